/*!
Per-socket ring buffer management.

The chip exposes each socket's transmit and receive memory as a ring
addressed by free-running 16-bit pointers (`Sn_TX_WR`, `Sn_RX_RD`).
Writing one of those registers does not become visible when reading
it back until the chip has processed the next SEND or RECV command,
so the driver keeps a shadow of both cursors: the value it last told
the device.

Two families of primitives exist:

 * plain operations ([`Device::write`], [`Device::read`]) start at the
   device's latched pointer, suitable for one-shot transfers;
 * *piecemeal* operations ([`Device::write_piecemeal`],
   [`Device::read_piecemeal`], [`Device::fill_piecemeal`],
   [`Device::flush_piecemeal`]) start at the shadow, so several of them
   can assemble or consume one datagram before a single commit.

The shadows are only re-read from the device by an explicit refresh.
 */

use core::convert::TryFrom;
use core::fmt;

use crate::bus::Bus;
use crate::device::{sn, Block, Command, Device, Interrupt, Status};
use crate::Error;

pub mod lifecycle;

/// The number of hardware sockets.
pub const MAX_SOCKETS: usize = 8;

/// One of the chip's hardware sockets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SocketId(u8);

impl SocketId {
    /// Returns `None` if `n` does not name a hardware socket.
    #[inline]
    pub const fn new(n: u8) -> Option<SocketId> {
        if (n as usize) < MAX_SOCKETS {
            Some(SocketId(n))
        } else {
            None
        }
    }

    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }

    /// Iterates over every hardware socket.
    pub fn all() -> impl Iterator<Item = SocketId> {
        (0..MAX_SOCKETS as u8).map(SocketId)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "socket {}", self.0)
    }
}

impl TryFrom<u8> for SocketId {
    type Error = Error;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        SocketId::new(n).ok_or(Error::Malformed)
    }
}

/// Shadow copies of a socket's transmit write and receive read pointers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub(crate) struct Cursors {
    pub(crate) tx_write: u16,
    pub(crate) rx_read: u16,
}

impl<B: Bus> Device<B> {
    /// Returns the shadow transmit write cursor.
    #[inline]
    pub fn tx_cursor(&self, s: SocketId) -> u16 {
        self.cursors[s.0 as usize].tx_write
    }

    /// Returns the shadow receive read cursor.
    #[inline]
    pub fn rx_cursor(&self, s: SocketId) -> u16 {
        self.cursors[s.0 as usize].rx_read
    }

    /// Re-reads the transmit shadow from `Sn_TX_WR`.
    pub fn refresh_tx(&mut self, s: SocketId) {
        self.cursors[s.0 as usize].tx_write = self.read_sn_u16(s, sn::TX_WR);
    }

    /// Re-reads the receive shadow from `Sn_RX_RD`.
    pub fn refresh_rx(&mut self, s: SocketId) {
        self.cursors[s.0 as usize].rx_read = self.read_sn_u16(s, sn::RX_RD);
    }

    fn publish_tx(&mut self, s: SocketId, cursor: u16) {
        self.write_sn_u16(s, sn::TX_WR, cursor);
        self.cursors[s.0 as usize].tx_write = cursor;
    }

    fn publish_rx(&mut self, s: SocketId, cursor: u16) {
        self.write_sn_u16(s, sn::RX_RD, cursor);
        self.cursors[s.0 as usize].rx_read = cursor;
    }

    fn put(&mut self, s: SocketId, start: u16, data: &[u8]) {
        self.transport.write(start, Block::Tx(s).control(), data);
        self.publish_tx(s, start.wrapping_add(data.len() as u16));
    }

    fn take(&mut self, s: SocketId, start: u16, buf: &mut [u8]) {
        self.transport.read(start, Block::Rx(s).control(), buf);
        self.publish_rx(s, start.wrapping_add(buf.len() as u16));
    }

    /// Copies `data` into the transmit ring at the device's write pointer.
    pub fn write(&mut self, s: SocketId, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let start = self.read_sn_u16(s, sn::TX_WR);
        self.put(s, start, data)
    }

    /// Copies `data` into the transmit ring at the shadow write cursor.
    pub fn write_piecemeal(&mut self, s: SocketId, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let start = self.tx_cursor(s);
        self.put(s, start, data)
    }

    /// Writes `count` copies of `value` at the shadow write cursor.
    pub fn fill_piecemeal(&mut self, s: SocketId, value: u8, count: u16) {
        if count == 0 {
            return;
        }
        let start = self.tx_cursor(s);
        self.transport.fill(start, Block::Tx(s).control(), value, count);
        self.publish_tx(s, start.wrapping_add(count));
    }

    /// Fills `buf` from the receive ring at the device's read pointer.
    pub fn read(&mut self, s: SocketId, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let start = self.read_sn_u16(s, sn::RX_RD);
        self.take(s, start, buf)
    }

    /// Fills `buf` from the receive ring at the shadow read cursor.
    pub fn read_piecemeal(&mut self, s: SocketId, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let start = self.rx_cursor(s);
        self.take(s, start, buf)
    }

    /// Skips `count` received bytes without reading them.
    pub fn flush_piecemeal(&mut self, s: SocketId, count: u16) {
        if count == 0 {
            return;
        }
        let cursor = self.rx_cursor(s).wrapping_add(count);
        self.publish_rx(s, cursor)
    }

    /// Free transmit space as last committed by the device.
    pub fn free_size(&mut self, s: SocketId) -> Result<u16, Error> {
        self.read_stable(s, sn::TX_FSR)
    }

    /// Free transmit space measured from the shadow write cursor.
    ///
    /// Unlike [`free_size`](Self::free_size) this accounts for bytes
    /// staged by piecemeal writes that have not been sent yet.
    pub fn virtual_free_size(&mut self, s: SocketId) -> Result<u16, Error> {
        let tx_read = self.read_stable(s, sn::TX_RD)?;
        let pending = self.tx_cursor(s).wrapping_sub(tx_read);
        Ok(self.config.tx_capacity.saturating_sub(pending))
    }

    /// Received bytes as last committed by the device.
    pub fn received(&mut self, s: SocketId) -> Result<u16, Error> {
        self.read_stable(s, sn::RX_RSR)
    }

    /// Received bytes not yet consumed past the shadow read cursor.
    pub fn virtual_received(&mut self, s: SocketId) -> Result<u16, Error> {
        let rx_write = self.read_stable(s, sn::RX_WR)?;
        Ok(rx_write.wrapping_sub(self.rx_cursor(s)))
    }

    /// Issues a command and waits for the chip to accept it.
    pub fn command(&mut self, s: SocketId, cmd: Command) -> Result<(), Error> {
        log::trace!("{}: command {:?}", s, cmd);
        self.write_sn_u8(s, sn::CR, cmd as u8);
        self.poll(|dev| dev.read_sn_u8(s, sn::CR) == 0).map_err(|e| {
            log::warn!("{}: command {:?} was never accepted", s, cmd);
            e
        })
    }

    pub fn interrupts(&mut self, s: SocketId) -> Interrupt {
        Interrupt::from_bits_truncate(self.read_sn_u8(s, sn::IR))
    }

    pub fn clear_interrupts(&mut self, s: SocketId, flags: Interrupt) {
        self.write_sn_u8(s, sn::IR, flags.bits())
    }

    /// Queues `data` and transmits everything staged in the ring.
    ///
    /// With `retry` set nothing is copied; whatever was staged by
    /// earlier (piecemeal) writes is sent as is. Otherwise this waits
    /// for `data.len()` bytes of free space and copies `data` first.
    ///
    /// Returns the number of bytes the device advanced its read
    /// pointer by, which falls short of the staged amount when the
    /// peer's window is full.
    pub fn send(&mut self, s: SocketId, data: &[u8], retry: bool) -> Result<u16, Error> {
        if !retry {
            let len = u16::try_from(data.len()).map_err(|_| Error::TooLong)?;
            if len > self.config.tx_capacity {
                return Err(Error::TooLong);
            }
            let mut polls = 0;
            loop {
                if !self.status(s).can_send() {
                    return Err(Error::NotConnected);
                }
                if self.free_size(s)? >= len {
                    break;
                }
                polls += 1;
                if polls >= self.config.poll_limit {
                    return Err(Error::Timeout);
                }
            }
            self.write(s, data);
        }

        let before = self.read_stable(s, sn::TX_RD)?;
        self.command(s, Command::Send)?;

        let mut outcome = Ok(());
        self.poll(|dev| {
            let ir = dev.interrupts(s);
            if ir.contains(Interrupt::SEND_OK) {
                return true;
            }
            if ir.contains(Interrupt::TIMEOUT) {
                outcome = Err(Error::Timeout);
                return true;
            }
            if dev.status(s) == Status::CLOSED {
                outcome = Err(Error::Closed);
                return true;
            }
            false
        })?;
        match outcome {
            Ok(()) => self.clear_interrupts(s, Interrupt::SEND_OK),
            Err(Error::Timeout) => {
                log::warn!("{}: send timed out", s);
                self.clear_interrupts(s, Interrupt::TIMEOUT);
                self.refresh_tx(s);
                return Err(Error::Timeout);
            }
            Err(e) => {
                log::warn!("{}: closed during send", s);
                self.close(s)?;
                return Err(e);
            }
        }

        let after = self.read_stable(s, sn::TX_RD)?;
        self.refresh_tx(s);
        Ok(after.wrapping_sub(before))
    }

    /// Copies `buf.len()` received bytes out and releases the space to
    /// the device.
    pub fn receive(&mut self, s: SocketId, buf: &mut [u8]) -> Result<(), Error> {
        self.read(s, buf);
        self.command(s, Command::Recv)
    }
}
