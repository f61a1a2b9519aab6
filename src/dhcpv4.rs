/*!
DHCPv4 definitions and a codec that works directly on a socket's
ring buffers.

Outgoing messages are assembled field by field with piecemeal writes
and committed with a single SEND; incoming datagrams are consumed field
by field with piecemeal reads and released with a single RECV. Neither
direction needs a message-sized buffer in host memory.

See:
 * [RFC2131]: Dynamic Host Configuration Protocol
 * [RFC2132]: DHCP Options and BOOTP Vendor Extensions

[RFC2131]: https://datatracker.ietf.org/doc/html/rfc2131
[RFC2132]: https://datatracker.ietf.org/doc/html/rfc2132
 */

use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};
use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::mem;
use core::slice;

use crate::bus::Bus;
use crate::device::{Command, Device, Interrupt};
use crate::socket::SocketId;
use crate::{Addr, Error};

pub mod client;

/// The 'DHCP server' UDP port.
pub const SERVER_PORT: u16 = 67;
/// The 'DHCP client' UDP port.
pub const CLIENT_PORT: u16 = 68;
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Length of 'op' through 'giaddr'.
const FIXED_LEN: usize = 28;
const CHADDR_LEN: u16 = 16;
/// The 'sname' and 'file' fields, which are never used here.
const LEGACY_LEN: u16 = 64 + 128;
/// Length of the header up to and including the magic cookie.
pub const HEADER_LEN: u16 = FIXED_LEN as u16 + CHADDR_LEN + LEGACY_LEN + MAGIC_COOKIE.len() as u16;

/// Source address, source port and length that the chip prepends to
/// every datagram received on a UDP socket.
pub const UDP_PREAMBLE_LEN: u16 = 8;

/// Hardware type of Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// Option codes.
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DOMAIN_SERVER: u8 = 6;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAM_LIST: u8 = 55;
    pub const RENEWAL_TIME: u8 = 58;
    pub const END: u8 = 255;
}

/// The packet op code/message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpCode {
    /// Signifies that the message is sent from a client to a server.
    BootRequest = 1,
    /// Signifies that the message is sent from a server to a client.
    BootReply,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => OpCode::BootRequest,
            2 => OpCode::BootReply,
            _ => return Err(Error::Malformed),
        })
    }
}

/// DHCP message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(u8);

impl MessageType {
    pub const DISCOVER: MessageType = MessageType(1);
    pub const OFFER: MessageType = MessageType(2);
    pub const REQUEST: MessageType = MessageType(3);
    pub const DECLINE: MessageType = MessageType(4);
    pub const ACK: MessageType = MessageType(5);
    pub const NAK: MessageType = MessageType(6);
    pub const RELEASE: MessageType = MessageType(7);
    pub const INFORM: MessageType = MessageType(8);
}

impl From<u8> for MessageType {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

impl From<MessageType> for u8 {
    fn from(MessageType(x): MessageType) -> Self {
        x
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            MessageType::DISCOVER => "DISCOVER",
            MessageType::OFFER => "OFFER",
            MessageType::REQUEST => "REQUEST",
            MessageType::DECLINE => "DECLINE",
            MessageType::ACK => "ACK",
            MessageType::NAK => "NAK",
            MessageType::RELEASE => "RELEASE",
            MessageType::INFORM => "INFORM",
            Self(x) => return f.debug_tuple("MessageType").field(&x).finish(),
        };
        f.write_str(name)
    }
}

bitflags! {
    /// DHCPv4 flags.
    ///
    /// This is the type of the 'flags' field.
    #[repr(transparent)]
    pub struct Flags: u16 {
        const BROADCAST = 1 << 15;
    }
}

/// A DHCPv4 option.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum DhcpOption<'a> {
    /// 0 Padding
    ///
    /// Can be used to cause subsequent fields to align on word
    /// boundaries.
    Pad,
    /// 255 End
    ///
    /// Marks the end of valid information in the 'options' field.
    End,
    /// 1 Subnet Mask.
    SubnetMask(&'a Addr),
    /// 3 Router
    Router(&'a [Addr]),
    /// 6 Domain Name Server
    DomainNameServer(&'a [Addr]),
    /// 50 Requested IP Address
    RequestedIpAddress(&'a Addr),
    /// 51 IP Address Lease Time
    AddressLeaseTime(u32),
    /// 53 DHCP Message Type
    ///
    /// This option is required.
    MessageType(MessageType),
    /// 54 Server Identifier
    ServerIdentifier(&'a Addr),
    /// 55 Parameter Request List
    ParameterRequestList(&'a [u8]),
    /// 58 Renewal (T1) Time Value
    RenewalTime(u32),
    /// Unrecognized option.
    Unknown(u8, &'a [u8]),
}

#[inline]
fn read_addrs(b: &[u8]) -> Result<&[Addr], Error> {
    if b.len() < 4 || b.len() % mem::size_of::<Addr>() != 0 {
        return Err(Error::Malformed);
    }
    // Safety: Ok, since Addr has same representation as [u8; 4] and
    // the length is a multiple of it.
    Ok(unsafe {
        slice::from_raw_parts(b.as_ptr().cast::<Addr>(), b.len() / mem::size_of::<Addr>())
    })
}

/// Reads an option holding exactly one address.
#[inline]
fn read_addr(b: &[u8]) -> Result<&Addr, Error> {
    if b.len() != mem::size_of::<Addr>() {
        return Err(Error::Malformed);
    }
    b.try_into()
}

#[inline]
fn addrs_as_bytes(addrs: &[Addr]) -> &[u8] {
    // Safety: Ok, since Addr has same representation as [u8; 4].
    unsafe { slice::from_raw_parts(addrs.as_ptr().cast::<u8>(), mem::size_of_val(addrs)) }
}

#[inline]
fn read_u32(b: &[u8]) -> Result<u32, Error> {
    if b.len() != 4 {
        return Err(Error::Malformed);
    }
    Ok(NetworkEndian::read_u32(b))
}

impl<'a> DhcpOption<'a> {
    /// Returns the tag of this parameter.
    pub fn code(&self) -> u8 {
        use DhcpOption::*;
        match *self {
            Pad => opt::PAD,
            End => opt::END,
            SubnetMask(_) => opt::SUBNET_MASK,
            Router(_) => opt::ROUTER,
            DomainNameServer(_) => opt::DOMAIN_SERVER,
            RequestedIpAddress(_) => opt::REQUESTED_IP,
            AddressLeaseTime(_) => opt::LEASE_TIME,
            MessageType(_) => opt::MESSAGE_TYPE,
            ServerIdentifier(_) => opt::SERVER_ID,
            ParameterRequestList(_) => opt::PARAM_LIST,
            RenewalTime(_) => opt::RENEWAL_TIME,
            Unknown(code, _) => code,
        }
    }

    /// Interprets the data `b` of an option with tag `code`.
    pub fn parse(code: u8, b: &'a [u8]) -> Result<Self, Error> {
        use DhcpOption::*;
        Ok(match code {
            opt::PAD => Pad,
            opt::END => End,
            opt::SUBNET_MASK => SubnetMask(read_addr(b)?),
            opt::ROUTER => Router(read_addrs(b)?),
            opt::DOMAIN_SERVER => DomainNameServer(read_addrs(b)?),
            opt::REQUESTED_IP => RequestedIpAddress(read_addr(b)?),
            opt::LEASE_TIME => AddressLeaseTime(read_u32(b)?),
            opt::MESSAGE_TYPE => match *b {
                [x] => MessageType(x.into()),
                _ => return Err(Error::Malformed),
            },
            opt::SERVER_ID => ServerIdentifier(read_addr(b)?),
            opt::PARAM_LIST => {
                if b.is_empty() {
                    return Err(Error::Malformed);
                }
                ParameterRequestList(b)
            }
            opt::RENEWAL_TIME => RenewalTime(read_u32(b)?),
            _ => Unknown(code, b),
        })
    }

    /// Calls `f` with the encoded data of this option.
    fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        use DhcpOption::*;
        match *self {
            Pad | End => f(&[]),
            SubnetMask(addr) | RequestedIpAddress(addr) | ServerIdentifier(addr) => f(&addr.0),
            Router(addrs) | DomainNameServer(addrs) => f(addrs_as_bytes(addrs)),
            AddressLeaseTime(x) | RenewalTime(x) => f(&x.to_be_bytes()),
            MessageType(x) => f(&[x.0]),
            ParameterRequestList(xs) | Unknown(_, xs) => f(xs),
        }
    }

    /// Stages this option in an outgoing message.
    ///
    /// Fails with [`Error::Overflow`] without writing anything if the
    /// option does not fit in the socket's remaining transmit space.
    /// This does not support options that need more than 255 bytes of
    /// data.
    pub fn write<B: Bus>(&self, out: &mut Outgoing<'_, B>) -> Result<(), Error> {
        let code = self.code();
        if let DhcpOption::Pad | DhcpOption::End = *self {
            out.reserve(1)?;
            out.dev.write_piecemeal(out.socket, &[code]);
            return Ok(());
        }
        self.with_data(|data| {
            let len: u8 = data.len().try_into().map_err(|_| Error::TooLong)?;
            out.reserve(2 + u16::from(len))?;
            out.dev.write_piecemeal(out.socket, &[code, len]);
            out.dev.write_piecemeal(out.socket, data);
            Ok(())
        })
    }
}

/// The fixed-format part of a DHCP message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Header {
    pub op: OpCode,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID.
    pub xid: u32,
    pub secs: u16,
    pub flags: Flags,
    /// Client IP address, when already bound.
    pub ciaddr: Addr,
    /// 'your' (client) IP address.
    pub yiaddr: Addr,
    /// IP address of next server to use in bootstrap.
    pub siaddr: Addr,
    /// Relay agent IP address.
    pub giaddr: Addr,
    /// Client hardware address.
    ///
    /// Only Ethernet addresses are supported; the rest of the 16-byte
    /// field is zero on the wire.
    pub chaddr: [u8; 6],
}

impl Header {
    /// Returns a client request header with all addresses unspecified.
    pub fn request(xid: u32, chaddr: [u8; 6]) -> Self {
        Header {
            op: OpCode::BootRequest,
            htype: HTYPE_ETHERNET,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: Flags::empty(),
            ciaddr: Addr::UNSPECIFIED,
            yiaddr: Addr::UNSPECIFIED,
            siaddr: Addr::UNSPECIFIED,
            giaddr: Addr::UNSPECIFIED,
            chaddr,
        }
    }

    fn encode_fixed(&self) -> [u8; FIXED_LEN] {
        let mut b = [0; FIXED_LEN];
        b[0] = self.op as u8;
        b[1] = self.htype;
        b[2] = self.hlen;
        b[3] = self.hops;
        NetworkEndian::write_u32(&mut b[4..], self.xid);
        NetworkEndian::write_u16(&mut b[8..], self.secs);
        NetworkEndian::write_u16(&mut b[10..], self.flags.bits());
        b[12..16].copy_from_slice(&self.ciaddr.0);
        b[16..20].copy_from_slice(&self.yiaddr.0);
        b[20..24].copy_from_slice(&self.siaddr.0);
        b[24..28].copy_from_slice(&self.giaddr.0);
        b
    }

    fn decode(b: &[u8; FIXED_LEN], chaddr: &[u8; CHADDR_LEN as usize]) -> Result<Self, Error> {
        let addr = |i: usize| <&Addr>::try_from(&b[i..]).map(|a| *a);
        let mut hw = [0; 6];
        hw.copy_from_slice(&chaddr[..6]);
        Ok(Header {
            op: b[0].try_into()?,
            htype: b[1],
            hlen: b[2],
            hops: b[3],
            xid: NetworkEndian::read_u32(&b[4..]),
            secs: NetworkEndian::read_u16(&b[8..]),
            flags: Flags::from_bits_truncate(NetworkEndian::read_u16(&b[10..])),
            ciaddr: addr(12)?,
            yiaddr: addr(16)?,
            siaddr: addr(20)?,
            giaddr: addr(24)?,
            chaddr: hw,
        })
    }
}

/// A DHCP message being staged in a socket's transmit ring.
pub struct Outgoing<'d, B> {
    dev: &'d mut Device<B>,
    socket: SocketId,
}

impl<'d, B: Bus> Outgoing<'d, B> {
    /// Starts a new message at the socket's committed write pointer.
    pub fn new(dev: &'d mut Device<B>, socket: SocketId) -> Self {
        dev.refresh_tx(socket);
        Outgoing { dev, socket }
    }

    fn reserve(&mut self, n: u16) -> Result<(), Error> {
        if self.dev.virtual_free_size(self.socket)? < n {
            log::debug!("{}: no room for {} more bytes", self.socket, n);
            return Err(Error::Overflow);
        }
        Ok(())
    }

    /// Stages the header, the unused legacy fields and the magic cookie.
    pub fn header(&mut self, header: &Header) -> Result<(), Error> {
        self.reserve(HEADER_LEN)?;
        let s = self.socket;
        self.dev.write_piecemeal(s, &header.encode_fixed());
        self.dev.write_piecemeal(s, &header.chaddr);
        self.dev
            .fill_piecemeal(s, 0, CHADDR_LEN - header.chaddr.len() as u16 + LEGACY_LEN);
        self.dev.write_piecemeal(s, &MAGIC_COOKIE);
        Ok(())
    }

    pub fn option(&mut self, option: &DhcpOption<'_>) -> Result<(), Error> {
        option.write(self)
    }

    /// Terminates the option list and transmits the message.
    pub fn send(mut self) -> Result<u16, Error> {
        self.option(&DhcpOption::End)?;
        self.dev.send(self.socket, &[], true)
    }
}

/// A datagram at the head of a UDP socket's receive ring.
pub struct Incoming<'d, B> {
    dev: &'d mut Device<B>,
    socket: SocketId,
    source: Addr,
    port: u16,
    len: u16,
    /// Unread bytes of the datagram payload.
    remaining: u16,
}

impl<'d, B: Bus> Incoming<'d, B> {
    /// Reads the envelope of the next received datagram, if any.
    pub fn next(dev: &'d mut Device<B>, socket: SocketId) -> Result<Option<Self>, Error> {
        if dev.received(socket)? < UDP_PREAMBLE_LEN {
            return Ok(None);
        }
        dev.refresh_rx(socket);
        let mut preamble = [0; UDP_PREAMBLE_LEN as usize];
        dev.read_piecemeal(socket, &mut preamble);
        let source = *<&Addr>::try_from(&preamble[..4])?;
        let port = NetworkEndian::read_u16(&preamble[4..]);
        let len = NetworkEndian::read_u16(&preamble[6..]);
        log::trace!("{}: datagram of {} bytes from {}:{}", socket, len, source, port);
        Ok(Some(Incoming {
            dev,
            socket,
            source,
            port,
            len,
            remaining: len,
        }))
    }

    #[inline]
    pub fn source(&self) -> Addr {
        self.source
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the payload length.
    #[inline]
    pub fn len(&self) -> u16 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let n = u16::try_from(buf.len()).map_err(|_| Error::Underflow)?;
        if n > self.remaining {
            return Err(Error::Underflow);
        }
        self.dev.read_piecemeal(self.socket, buf);
        self.remaining -= n;
        Ok(())
    }

    fn skip(&mut self, n: u16) -> Result<(), Error> {
        if n > self.remaining {
            return Err(Error::Underflow);
        }
        self.dev.flush_piecemeal(self.socket, n);
        self.remaining -= n;
        Ok(())
    }

    /// Reads the header through the magic cookie.
    pub fn header(&mut self) -> Result<Header, Error> {
        let mut fixed = [0; FIXED_LEN];
        self.take(&mut fixed)?;
        let mut chaddr = [0; CHADDR_LEN as usize];
        self.take(&mut chaddr)?;
        self.skip(LEGACY_LEN)?;
        let mut cookie = [0; 4];
        self.take(&mut cookie)?;
        if cookie != MAGIC_COOKIE {
            log::debug!("{}: bad magic cookie {:02x?}", self.socket, cookie);
            return Err(Error::Malformed);
        }
        Header::decode(&fixed, &chaddr)
    }

    /// Reads the next option as a tag and its data.
    ///
    /// Data longer than `scratch` is truncated and the rest skipped. A
    /// datagram that ends without an end option reads as if it had one.
    pub fn option<'b>(&mut self, scratch: &'b mut [u8]) -> Result<(u8, &'b [u8]), Error> {
        if self.remaining == 0 {
            return Ok((opt::END, &[]));
        }
        let mut code = [0];
        self.take(&mut code)?;
        if let [opt::PAD] | [opt::END] = code {
            return Ok((code[0], &[]));
        }
        let mut len = [0];
        self.take(&mut len)?;
        let len = u16::from(len[0]);
        let n = scratch.len().min(len.into());
        let data = &mut scratch[..n];
        self.take(data)?;
        self.skip(len - n as u16)?;
        Ok((code[0], data))
    }

    /// Reads and interprets the next option.
    pub fn read_option<'b>(&mut self, scratch: &'b mut [u8]) -> Result<DhcpOption<'b>, Error> {
        let (code, data) = self.option(scratch)?;
        DhcpOption::parse(code, data)
    }

    /// Releases the whole datagram, read or not, back to the device.
    pub fn finish(self) -> Result<(), Error> {
        let s = self.socket;
        self.dev.refresh_rx(s);
        self.dev.flush_piecemeal(s, UDP_PREAMBLE_LEN.wrapping_add(self.len));
        self.dev.clear_interrupts(s, Interrupt::RECV);
        self.dev.command(s, Command::Recv)?;
        self.dev.refresh_rx(s);
        Ok(())
    }
}
