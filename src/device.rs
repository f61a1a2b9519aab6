/*!
W5500 register map and the device handle.

See the WIZnet W5500 datasheet, sections 3 (register and memory
organization) and 4 (register descriptions).
 */

use bitflags::bitflags;
use core::fmt;

use crate::bus::{Bus, Transport};
use crate::socket::{Cursors, SocketId, MAX_SOCKETS};
use crate::{Addr, Error};

/// Common register offsets.
pub mod reg {
    pub const MR: u16 = 0x0000;
    pub const GAR: u16 = 0x0001;
    pub const SUBR: u16 = 0x0005;
    pub const SHAR: u16 = 0x0009;
    pub const SIPR: u16 = 0x000F;
    pub const RTR: u16 = 0x0019;
    pub const RCR: u16 = 0x001B;
    pub const PHYCFGR: u16 = 0x002E;
}

/// Socket register offsets, relative to the socket's register block.
pub mod sn {
    pub const MR: u16 = 0x00;
    pub const CR: u16 = 0x01;
    pub const IR: u16 = 0x02;
    pub const SR: u16 = 0x03;
    pub const PORT: u16 = 0x04;
    pub const DIPR: u16 = 0x0C;
    pub const DPORT: u16 = 0x10;
    pub const TX_FSR: u16 = 0x20;
    pub const TX_RD: u16 = 0x22;
    pub const TX_WR: u16 = 0x24;
    pub const RX_RSR: u16 = 0x26;
    pub const RX_RD: u16 = 0x28;
    pub const RX_WR: u16 = 0x2A;
}

/// A block addressed by the block-select bits of the control byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Block {
    /// Common registers.
    Common,
    /// A socket's register block.
    Socket(SocketId),
    /// A socket's transmit buffer memory.
    Tx(SocketId),
    /// A socket's receive buffer memory.
    Rx(SocketId),
}

impl Block {
    /// Returns the control byte selecting this block for a read.
    #[inline]
    pub fn control(self) -> u8 {
        let bsb = match self {
            Block::Common => 0,
            Block::Socket(s) => 1 + 4 * s.index(),
            Block::Tx(s) => 2 + 4 * s.index(),
            Block::Rx(s) => 3 + 4 * s.index(),
        };
        bsb << 3
    }
}

/// Socket status (the Sn_SR register).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u8);

impl Status {
    pub const CLOSED: Status = Status(0x00);
    pub const INIT: Status = Status(0x13);
    pub const LISTEN: Status = Status(0x14);
    pub const SYN_SENT: Status = Status(0x15);
    pub const SYN_RECV: Status = Status(0x16);
    pub const ESTABLISHED: Status = Status(0x17);
    pub const FIN_WAIT: Status = Status(0x18);
    pub const CLOSING: Status = Status(0x1A);
    pub const TIME_WAIT: Status = Status(0x1B);
    pub const CLOSE_WAIT: Status = Status(0x1C);
    pub const LAST_ACK: Status = Status(0x1D);
    pub const UDP: Status = Status(0x22);
    pub const MACRAW: Status = Status(0x42);

    /// Whether data may be queued for sending in this state.
    #[inline]
    pub fn can_send(self) -> bool {
        matches!(self, Status::ESTABLISHED | Status::CLOSE_WAIT | Status::UDP)
    }
}

impl From<u8> for Status {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

impl From<Status> for u8 {
    fn from(Status(x): Status) -> Self {
        x
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Status::CLOSED => "CLOSED",
            Status::INIT => "INIT",
            Status::LISTEN => "LISTEN",
            Status::SYN_SENT => "SYN_SENT",
            Status::SYN_RECV => "SYN_RECV",
            Status::ESTABLISHED => "ESTABLISHED",
            Status::FIN_WAIT => "FIN_WAIT",
            Status::CLOSING => "CLOSING",
            Status::TIME_WAIT => "TIME_WAIT",
            Status::CLOSE_WAIT => "CLOSE_WAIT",
            Status::LAST_ACK => "LAST_ACK",
            Status::UDP => "UDP",
            Status::MACRAW => "MACRAW",
            Self(x) => return f.debug_tuple("Status").field(&x).finish(),
        };
        f.write_str(name)
    }
}

/// A socket command (the Sn_CR register).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    Open = 0x01,
    Listen = 0x02,
    Connect = 0x04,
    Disconnect = 0x08,
    Close = 0x10,
    Send = 0x20,
    SendMac = 0x21,
    SendKeep = 0x22,
    Recv = 0x40,
}

/// The protocol bits of the socket mode register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    Closed = 0x00,
    Tcp = 0x01,
    Udp = 0x02,
    MacRaw = 0x04,
}

bitflags! {
    /// Socket interrupt flags (the Sn_IR register).
    ///
    /// Flags are cleared by writing them back.
    #[repr(transparent)]
    pub struct Interrupt: u8 {
        const CON = 0x01;
        const DISCON = 0x02;
        const RECV = 0x04;
        const TIMEOUT = 0x08;
        const SEND_OK = 0x10;
    }

    /// PHY status bits of the PHYCFGR register.
    #[repr(transparent)]
    pub struct PhyStatus: u8 {
        /// Carrier detected.
        const LINK = 0x01;
        const SPEED_100 = 0x02;
        const FULL_DUPLEX = 0x04;
    }
}

/// Driver configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on register polls while waiting for a command to
    /// be accepted or a status to be reached.
    pub poll_limit: u32,
    /// Size of each socket's transmit ring in device memory.
    pub tx_capacity: u16,
    /// Size of each socket's receive ring in device memory.
    pub rx_capacity: u16,
    /// Local ports handed out for `open(.., 0)` start after this one.
    pub first_ephemeral_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_limit: 10_000,
            tx_capacity: 2048,
            rx_capacity: 2048,
            first_ephemeral_port: 4000,
        }
    }
}

/// Static addressing written by [`Device::configure`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSettings {
    pub mac: [u8; 6],
    pub ip: Addr,
    pub gateway: Addr,
    pub subnet: Addr,
    /// Retransmission timeout in units of 100 us.
    pub retry_time: u16,
    pub retry_count: u8,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            // WIZnet's OUI
            mac: [0x00, 0x08, 0xDC, 0x00, 0x00, 0x01],
            ip: Addr::UNSPECIFIED,
            gateway: Addr::UNSPECIFIED,
            subnet: Addr::UNSPECIFIED,
            retry_time: 6000,
            retry_count: 3,
        }
    }
}

/// A W5500 on a serial bus.
///
/// Besides the transport, the handle owns the cursor shadows of all
/// eight sockets; see [`crate::socket`].
#[derive(Debug)]
pub struct Device<B> {
    pub(crate) transport: Transport<B>,
    pub(crate) cursors: [Cursors; MAX_SOCKETS],
    pub(crate) config: Config,
    pub(crate) next_port: u16,
}

impl<B> Device<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, Config::default())
    }

    pub fn with_config(bus: B, config: Config) -> Self {
        Device {
            transport: Transport::new(bus),
            cursors: [Cursors::default(); MAX_SOCKETS],
            next_port: config.first_ephemeral_port,
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consumes the handle and returns the bus.
    pub fn release(self) -> B {
        self.transport.into_inner()
    }

    #[inline]
    pub fn bus(&self) -> &B {
        self.transport.bus()
    }

    #[inline]
    pub fn bus_mut(&mut self) -> &mut B {
        self.transport.bus_mut()
    }
}

impl<B: Bus> Device<B> {
    fn read_addr(&mut self, offset: u16) -> Addr {
        let mut b = [0; 4];
        self.transport.read(offset, Block::Common.control(), &mut b);
        Addr(b)
    }

    fn write_addr(&mut self, offset: u16, Addr(b): Addr) {
        self.transport.write(offset, Block::Common.control(), &b)
    }

    /// Reads the source hardware address.
    pub fn mac(&mut self) -> [u8; 6] {
        let mut mac = [0; 6];
        self.transport.read(reg::SHAR, Block::Common.control(), &mut mac);
        mac
    }

    pub fn set_mac(&mut self, mac: &[u8; 6]) {
        self.transport.write(reg::SHAR, Block::Common.control(), mac)
    }

    /// Reads the source IP address.
    pub fn ip(&mut self) -> Addr {
        self.read_addr(reg::SIPR)
    }

    pub fn set_ip(&mut self, ip: Addr) {
        self.write_addr(reg::SIPR, ip)
    }

    pub fn gateway(&mut self) -> Addr {
        self.read_addr(reg::GAR)
    }

    pub fn set_gateway(&mut self, gateway: Addr) {
        self.write_addr(reg::GAR, gateway)
    }

    pub fn subnet(&mut self) -> Addr {
        self.read_addr(reg::SUBR)
    }

    pub fn set_subnet(&mut self, subnet: Addr) {
        self.write_addr(reg::SUBR, subnet)
    }

    /// Sets the TCP retransmission timeout (in 100 us units) and retry count.
    pub fn set_retry(&mut self, time: u16, count: u8) {
        self.transport.write_u16(reg::RTR, Block::Common.control(), time);
        self.transport.write_u8(reg::RCR, Block::Common.control(), count);
    }

    pub fn phy_status(&mut self) -> PhyStatus {
        PhyStatus::from_bits_truncate(self.transport.read_u8(reg::PHYCFGR, Block::Common.control()))
    }

    /// Whether the PHY reports a carrier.
    #[inline]
    pub fn link_up(&mut self) -> bool {
        self.phy_status().contains(PhyStatus::LINK)
    }

    /// Writes static addressing and retry parameters.
    pub fn configure(&mut self, settings: &NetworkSettings) {
        log::debug!(
            "configure: mac={:02x?} ip={} gateway={} subnet={}",
            settings.mac,
            settings.ip,
            settings.gateway,
            settings.subnet
        );
        self.set_mac(&settings.mac);
        self.set_subnet(settings.subnet);
        self.set_gateway(settings.gateway);
        self.set_ip(settings.ip);
        self.set_retry(settings.retry_time, settings.retry_count);
    }

    #[inline]
    pub(crate) fn read_sn_u8(&mut self, s: SocketId, offset: u16) -> u8 {
        self.transport.read_u8(offset, Block::Socket(s).control())
    }

    #[inline]
    pub(crate) fn write_sn_u8(&mut self, s: SocketId, offset: u16, value: u8) {
        self.transport.write_u8(offset, Block::Socket(s).control(), value)
    }

    #[inline]
    pub(crate) fn read_sn_u16(&mut self, s: SocketId, offset: u16) -> u16 {
        self.transport.read_u16(offset, Block::Socket(s).control())
    }

    #[inline]
    pub(crate) fn write_sn_u16(&mut self, s: SocketId, offset: u16, value: u16) {
        self.transport.write_u16(offset, Block::Socket(s).control(), value)
    }

    #[inline]
    pub(crate) fn write_sn(&mut self, s: SocketId, offset: u16, data: &[u8]) {
        self.transport.write(offset, Block::Socket(s).control(), data)
    }

    /// Polls `done` until it holds, at most `poll_limit` times.
    pub(crate) fn poll(&mut self, mut done: impl FnMut(&mut Self) -> bool) -> Result<(), Error> {
        for _ in 0..self.config.poll_limit {
            if done(self) {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Reads a live 16-bit counter until two consecutive reads agree.
    ///
    /// The chip updates these registers byte by byte, so a single read
    /// can observe a torn value.
    pub(crate) fn read_stable(&mut self, s: SocketId, offset: u16) -> Result<u16, Error> {
        let mut last = self.read_sn_u16(s, offset);
        for _ in 0..self.config.poll_limit {
            let x = self.read_sn_u16(s, offset);
            if x == last {
                return Ok(x);
            }
            last = x;
        }
        Err(Error::Timeout)
    }
}
