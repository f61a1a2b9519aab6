//! Socket state transitions.
//!
//! Every transition writes a command to `Sn_CR`, waits for the chip to
//! clear it, and where a particular `Sn_SR` state is expected, polls for
//! that too. All waits are bounded by [`Config::poll_limit`].
//!
//! [`Config::poll_limit`]: crate::device::Config::poll_limit

use byteorder::{ByteOrder, NetworkEndian};

use super::SocketId;
use crate::bus::Bus;
use crate::device::{sn, Command, Device, Interrupt, Protocol, Status};
use crate::{Addr, Error};

impl<B: Bus> Device<B> {
    /// Reads the socket status register.
    #[inline]
    pub fn status(&mut self, s: SocketId) -> Status {
        Status::from(self.read_sn_u8(s, sn::SR))
    }

    /// Polls until the socket reaches `want`.
    pub fn wait_status(&mut self, s: SocketId, want: Status) -> Result<(), Error> {
        self.poll(|dev| dev.status(s) == want)
    }

    /// Hands out ports above `first_ephemeral_port`, never 0.
    fn ephemeral_port(&mut self) -> u16 {
        let floor = match self.config.first_ephemeral_port {
            u16::MAX => 0,
            p => p,
        };
        self.next_port = match self.next_port.checked_add(1) {
            Some(p) if p > floor => p,
            _ => floor + 1,
        };
        self.next_port
    }

    /// Opens `s` with the given protocol on a local port.
    ///
    /// Port 0 picks the next ephemeral port. Both cursor shadows are
    /// refreshed once the chip has accepted the command.
    pub fn open(&mut self, s: SocketId, protocol: Protocol, port: u16) -> Result<(), Error> {
        let port = if port == 0 {
            self.ephemeral_port()
        } else {
            port
        };
        log::debug!("{}: open {:?} on port {}", s, protocol, port);
        self.write_sn_u8(s, sn::MR, protocol as u8);
        self.write_sn_u16(s, sn::PORT, port);
        self.command(s, Command::Open)?;
        self.refresh_tx(s);
        self.refresh_rx(s);
        Ok(())
    }

    /// Puts an initialized TCP socket into the listening state.
    pub fn listen(&mut self, s: SocketId) -> Result<(), Error> {
        self.command(s, Command::Listen)?;
        self.wait_status(s, Status::LISTEN)
    }

    /// Connects an initialized TCP socket to a remote peer.
    ///
    /// This returns once the chip has started the handshake; use
    /// [`wait_established`](Self::wait_established) to wait for it to
    /// complete.
    pub fn connect(&mut self, s: SocketId, addr: Addr, port: u16) -> Result<(), Error> {
        log::debug!("{}: connect to {}:{}", s, addr, port);
        self.set_destination(s, addr, port);
        self.command(s, Command::Connect)?;
        self.refresh_tx(s);
        self.refresh_rx(s);
        Ok(())
    }

    /// Waits for a connection to be established, by either side.
    pub fn wait_established(&mut self, s: SocketId) -> Result<(), Error> {
        let mut status = Status::CLOSED;
        self.poll(|dev| {
            status = dev.status(s);
            status != Status::SYN_SENT && status != Status::SYN_RECV && status != Status::LISTEN
        })?;
        if status == Status::ESTABLISHED {
            Ok(())
        } else {
            log::debug!("{}: connection failed in state {:?}", s, status);
            Err(Error::Closed)
        }
    }

    /// Starts a graceful TCP disconnect.
    pub fn disconnect(&mut self, s: SocketId) -> Result<(), Error> {
        self.command(s, Command::Disconnect)
    }

    /// Closes the socket and clears all of its interrupt flags.
    pub fn close(&mut self, s: SocketId) -> Result<(), Error> {
        log::trace!("{}: close", s);
        self.command(s, Command::Close)?;
        self.clear_interrupts(s, Interrupt::all());
        Ok(())
    }

    pub fn wait_closed(&mut self, s: SocketId) -> Result<(), Error> {
        self.wait_status(s, Status::CLOSED)
    }

    /// Sets the remote address used by CONNECT and by UDP SEND.
    pub fn set_destination(&mut self, s: SocketId, addr: Addr, port: u16) {
        let mut p = [0; 2];
        NetworkEndian::write_u16(&mut p, port);
        self.write_sn(s, sn::DIPR, &addr.0);
        self.write_sn(s, sn::DPORT, &p);
    }

    /// Waits for `s` to be free, then listens for TCP connections on `port`.
    pub fn start_server(&mut self, s: SocketId, port: u16) -> Result<(), Error> {
        self.wait_closed(s)?;
        self.open(s, Protocol::Tcp, port)?;
        self.wait_status(s, Status::INIT)?;
        self.listen(s)
    }

    /// Waits for `s` to be free, then connects to `addr:port` from an
    /// ephemeral local port.
    pub fn start_client(&mut self, s: SocketId, addr: Addr, port: u16) -> Result<(), Error> {
        self.wait_closed(s)?;
        self.open(s, Protocol::Tcp, 0)?;
        self.wait_status(s, Status::INIT)?;
        self.connect(s, addr, port)?;
        self.wait_established(s)
    }

    /// Disconnects and closes `s`.
    pub fn stop(&mut self, s: SocketId) -> Result<(), Error> {
        if self.is_connected(s) {
            self.disconnect(s)?;
        }
        self.close(s)
    }

    #[inline]
    pub fn is_connected(&mut self, s: SocketId) -> bool {
        self.status(s) == Status::ESTABLISHED
    }

    /// Waits until received data is available and returns its size.
    ///
    /// Fails with [`Error::Closed`] if the socket leaves the connected
    /// states while nothing is buffered.
    pub fn wait_for_data(&mut self, s: SocketId) -> Result<u16, Error> {
        for _ in 0..self.config.poll_limit {
            let n = self.received(s)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.status(s).can_send() {
                return Err(Error::Closed);
            }
        }
        Err(Error::Timeout)
    }
}
