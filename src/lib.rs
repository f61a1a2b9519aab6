/*!
Socket buffer management and a DHCPv4 client for the WIZnet W5500.

The W5500 is a hardwired TCP/IP offload chip driven over a serial bus.
This crate layers, bottom up:

 * [`bus`]: the framed register/memory transport;
 * [`device`]: the register map and the [`Device`](device::Device) handle;
 * [`socket`]: per-socket ring buffers with shadowed cursors, and the
   socket state machine in [`socket::lifecycle`];
 * [`stream`]: buffered byte I/O over a connected socket;
 * [`dhcpv4`]: a DHCP packet codec on top of the ring buffers, and the
   client state machine in [`dhcpv4::client`].

See:
 * [RFC2131]: Dynamic Host Configuration Protocol
 * [RFC2132]: DHCP Options and BOOTP Vendor Extensions

[RFC2131]: https://datatracker.ietf.org/doc/html/rfc2131
[RFC2132]: https://datatracker.ietf.org/doc/html/rfc2132
 */

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::convert::{TryFrom, TryInto};
use core::fmt;
use ref_cast::RefCast;

pub mod bus;
pub mod device;
pub mod dhcpv4;
pub mod socket;
pub mod stream;

#[cfg(test)]
mod mock;

/// The type of errors that may be produced by this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The message was malformed.
    Malformed,
    /// Source buffer ended too soon.
    Underflow,
    /// Destination buffer is smaller than the encoding.
    Overflow,
    /// Data is longer than can fit in the length field.
    TooLong,
    /// The chip did not reach the expected state in time.
    Timeout,
    /// The socket was closed during the operation.
    Closed,
    /// The socket is not in a state that allows sending.
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Error::Malformed => "malformed message",
            Error::Underflow => "source buffer ended too soon",
            Error::Overflow => "destination buffer is too small",
            Error::TooLong => "data is too long to fit in a single entity",
            Error::Timeout => "timed out waiting for the device",
            Error::Closed => "socket closed",
            Error::NotConnected => "socket not connected",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// An IPv4 address.
///
/// This is similar to [std::net::Ipv4Addr], but has an explicit
/// representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, RefCast, Debug)]
#[repr(transparent)]
pub struct Addr(pub [u8; 4]);

impl Addr {
    pub const UNSPECIFIED: Addr = Addr([0; 4]);
    pub const BROADCAST: Addr = Addr([255; 4]);
}

impl<'a> TryFrom<&'a [u8]> for &'a Addr {
    type Error = Error;

    #[inline]
    fn try_from(b: &'a [u8]) -> Result<Self, Self::Error> {
        b.get(..4)
            .and_then(|b| b.try_into().ok())
            .map(Addr::ref_cast)
            .ok_or(Error::Malformed)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

#[cfg(feature = "std")]
impl From<Addr> for ::std::net::Ipv4Addr {
    #[inline]
    fn from(Addr(x): Addr) -> Self {
        x.into()
    }
}

#[cfg(feature = "std")]
impl From<::std::net::Ipv4Addr> for Addr {
    #[inline]
    fn from(x: ::std::net::Ipv4Addr) -> Addr {
        Addr(x.octets())
    }
}
