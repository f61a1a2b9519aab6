/*!
A blocking DHCPv4 client.

Fresh acquisition runs DISCOVER, OFFER, REQUEST, ACK. Renewal starts at
REQUEST with the server and addresses already known. All traffic is
broadcast, renewal included, since unicast requests do not reliably
make it through relay agents.

```no_run
# use wizdhcp::bus::{Bus, Delay};
# fn demo(bus: impl Bus, mut delay: impl Delay) -> Result<(), wizdhcp::dhcpv4::client::DhcpError> {
use wizdhcp::device::Device;
use wizdhcp::dhcpv4::client::{acquire_or_renew_lease, ClientConfig, Lease};
use wizdhcp::Addr;

let mut dev = Device::new(bus);
let mut lease = Lease::default();
let mut dns = Addr::UNSPECIFIED;
acquire_or_renew_lease(&mut dev, &mut delay, &ClientConfig::default(), Some(&mut dns), &mut lease)?;

// Later, before `lease.lease_seconds` have passed:
lease.is_renewal = true;
acquire_or_renew_lease(&mut dev, &mut delay, &ClientConfig::default(), None, &mut lease)?;
# Ok(())
# }
```
 */

use core::fmt;

use super::{opt, DhcpOption, Header, Incoming, MessageType, OpCode, Outgoing};
use super::{CLIENT_PORT, SERVER_PORT};
use crate::bus::{Bus, Delay};
use crate::device::{Device, Protocol};
use crate::socket::SocketId;
use crate::{Addr, Error};

/// Room for the option data the client looks at: two DNS servers.
const OPTION_SCRATCH_LEN: usize = 8;

const DEFAULT_SOCKET: SocketId = match SocketId::new(3) {
    Some(s) => s,
    None => unreachable!(),
};

/// One step of the exchange.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    SendDiscover,
    AwaitOffer,
    SendRequest,
    AwaitAck,
    Done,
}

/// Lease state shared with the caller across acquisitions.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Lease {
    /// Run only REQUEST/ACK, keeping the device's current addresses.
    pub is_renewal: bool,
    /// The server that granted the lease. Required for renewal.
    pub dhcp_server_address: Addr,
    /// Seconds until the lease should be renewed.
    pub lease_seconds: u32,
}

/// Client configuration.
#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// The hardware socket used for the exchange.
    pub socket: SocketId,
    /// Transaction ID, constant for the whole exchange.
    pub xid: u32,
    /// Loop iterations without progress before giving up.
    pub idle_timeout: u32,
    /// Sleep between iterations that found nothing to do.
    pub poll_interval_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            socket: DEFAULT_SOCKET,
            xid: 0x3903_F326,
            idle_timeout: 1000,
            poll_interval_ms: 10,
        }
    }
}

/// The ways an acquisition can fail or a datagram can be rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum DhcpError {
    /// The socket could not be set up or torn down.
    Socket(Error),
    /// The PHY reports no carrier.
    LinkDown,
    /// A DISCOVER or REQUEST could not be sent.
    SendFault(Error),
    /// A reply came from a port other than 67.
    SourcePort(u16),
    /// A reply was truncated, not a server reply, or lacked the magic cookie.
    Header,
    /// A reply belongs to another transaction.
    Xid(u32),
    /// A reply's first option could not be read.
    FirstOption,
    /// The ACK's server or assigned address differs from the OFFER's.
    AddressMismatch,
    /// No usable reply arrived within the idle timeout.
    Timeout,
}

const DESCRIPTIONS: [&str; 9] = [
    "socket fault",
    "link down",
    "send fault",
    "invalid UDP source port",
    "DHCP header read fault",
    "incorrect transaction id",
    "first option read fault",
    "ACK addresses do not match OFFER",
    "timeout waiting for reply",
];

impl DhcpError {
    /// Returns the numeric error code, starting at 1.
    pub fn code(&self) -> u8 {
        match *self {
            DhcpError::Socket(_) => 1,
            DhcpError::LinkDown => 2,
            DhcpError::SendFault(_) => 3,
            DhcpError::SourcePort(_) => 4,
            DhcpError::Header => 5,
            DhcpError::Xid(_) => 6,
            DhcpError::FirstOption => 7,
            DhcpError::AddressMismatch => 8,
            DhcpError::Timeout => 9,
        }
    }
}

/// Describes an error code; 0 and unknown codes describe nothing.
pub fn strerror(code: u8) -> &'static str {
    match code {
        1..=9 => DESCRIPTIONS[usize::from(code) - 1],
        _ => "",
    }
}

impl fmt::Display for DhcpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(strerror(self.code()))?;
        match *self {
            DhcpError::Socket(e) | DhcpError::SendFault(e) => write!(f, ": {}", e),
            DhcpError::SourcePort(port) => write!(f, " ({})", port),
            DhcpError::Xid(xid) => write!(f, " ({:#010x})", xid),
            _ => Ok(()),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DhcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DhcpError::Socket(e) | DhcpError::SendFault(e) => Some(e),
            _ => None,
        }
    }
}

/// The outcome of one [`Session::step`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    /// Nothing was received.
    Waiting,
    /// A datagram was consumed without advancing the phase.
    Discarded,
    /// The phase advanced.
    Advanced,
}

/// What a server reply carried.
#[derive(Default)]
struct Reply {
    yiaddr: Addr,
    siaddr: Addr,
    server: Option<Addr>,
    subnet: Option<Addr>,
    gateway: Option<Addr>,
    dns: Option<Addr>,
    renewal_time: Option<u32>,
    lease_time: Option<u32>,
}

/// The state of one exchange.
#[derive(Debug)]
pub struct Session {
    config: ClientConfig,
    phase: Phase,
    idle: u32,
    is_renewal: bool,
    mac: [u8; 6],
    assigned: Addr,
    server: Addr,
    gateway: Addr,
    subnet: Addr,
    dns: Option<Addr>,
    lease_seconds: Option<u32>,
    last_rejection: Option<DhcpError>,
}

impl Session {
    /// Starts a fresh acquisition for the hardware address `mac`.
    pub fn new(config: ClientConfig, mac: [u8; 6]) -> Self {
        Session {
            config,
            phase: Phase::SendDiscover,
            idle: 0,
            is_renewal: false,
            mac,
            assigned: Addr::UNSPECIFIED,
            server: Addr::UNSPECIFIED,
            gateway: Addr::UNSPECIFIED,
            subnet: Addr::BROADCAST,
            dns: None,
            lease_seconds: None,
            last_rejection: None,
        }
    }

    /// Starts a renewal of `assigned` with `server`.
    pub fn renewing(
        config: ClientConfig,
        mac: [u8; 6],
        server: Addr,
        assigned: Addr,
        gateway: Addr,
        subnet: Addr,
    ) -> Self {
        Session {
            phase: Phase::SendRequest,
            is_renewal: true,
            server,
            assigned,
            gateway,
            subnet,
            ..Session::new(config, mac)
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterations since the phase last advanced.
    #[inline]
    pub fn idle(&self) -> u32 {
        self.idle
    }

    /// The reason the most recent datagram was rejected, cleared when the
    /// phase advances.
    #[inline]
    pub fn last_rejection(&self) -> Option<DhcpError> {
        self.last_rejection
    }

    /// The DHCP server, known once an OFFER was accepted.
    #[inline]
    pub fn server(&self) -> Addr {
        self.server
    }

    /// The offered (or renewed) address.
    #[inline]
    pub fn assigned(&self) -> Addr {
        self.assigned
    }

    #[inline]
    pub fn gateway(&self) -> Addr {
        self.gateway
    }

    #[inline]
    pub fn subnet(&self) -> Addr {
        self.subnet
    }

    /// The first DNS server advertised, if any.
    #[inline]
    pub fn dns(&self) -> Option<Addr> {
        self.dns
    }

    /// Seconds until renewal: T1 if advertised, otherwise half the lease.
    #[inline]
    pub fn lease_seconds(&self) -> Option<u32> {
        self.lease_seconds
    }

    fn advance(&mut self, phase: Phase) {
        log::debug!("dhcp: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.idle = 0;
        self.last_rejection = None;
    }

    /// Performs the action of the current phase once.
    ///
    /// Rejected datagrams are not errors; they are recorded in
    /// [`last_rejection`](Self::last_rejection). Errors are device
    /// faults that end the exchange.
    pub fn step<B: Bus>(&mut self, dev: &mut Device<B>) -> Result<Step, DhcpError> {
        match self.phase {
            Phase::SendDiscover => {
                log::info!("dhcp: sending DISCOVER");
                self.send(dev, MessageType::DISCOVER)?;
                self.advance(Phase::AwaitOffer);
                Ok(Step::Advanced)
            }
            Phase::SendRequest => {
                log::info!(
                    "dhcp: sending REQUEST for {} to {}",
                    self.assigned,
                    self.server
                );
                self.send(dev, MessageType::REQUEST)?;
                self.advance(Phase::AwaitAck);
                Ok(Step::Advanced)
            }
            Phase::AwaitOffer => self.receive(dev, MessageType::OFFER),
            Phase::AwaitAck => self.receive(dev, MessageType::ACK),
            Phase::Done => Ok(Step::Waiting),
        }
    }

    /// Steps until done, sleeping `poll_interval_ms` after every step.
    ///
    /// Steps that do not advance the phase count toward `idle_timeout`.
    pub fn run<B: Bus, D: Delay>(
        &mut self,
        dev: &mut Device<B>,
        delay: &mut D,
    ) -> Result<(), DhcpError> {
        while self.phase != Phase::Done {
            let step = self.step(dev)?;
            if self.phase == Phase::Done {
                break;
            }
            delay.delay_ms(self.config.poll_interval_ms);
            if step == Step::Advanced {
                continue;
            }
            self.idle += 1;
            if self.idle >= self.config.idle_timeout {
                log::warn!(
                    "dhcp: timed out in {:?} (last rejection: {:?})",
                    self.phase,
                    self.last_rejection
                );
                return Err(DhcpError::Timeout);
            }
        }
        Ok(())
    }

    fn send<B: Bus>(&self, dev: &mut Device<B>, kind: MessageType) -> Result<(), DhcpError> {
        let mut header = Header::request(self.config.xid, self.mac);
        if kind == MessageType::REQUEST {
            header.siaddr = self.server;
        }
        let mut out = Outgoing::new(dev, self.config.socket);
        out.header(&header).map_err(DhcpError::SendFault)?;
        out.option(&DhcpOption::MessageType(kind))
            .map_err(DhcpError::SendFault)?;
        let options = if kind == MessageType::DISCOVER {
            out.option(&DhcpOption::ParameterRequestList(&[
                opt::SUBNET_MASK,
                opt::ROUTER,
                opt::DOMAIN_SERVER,
            ]))
        } else {
            out.option(&DhcpOption::RequestedIpAddress(&self.assigned))
                .and_then(|()| out.option(&DhcpOption::ServerIdentifier(&self.server)))
        };
        options.map_err(DhcpError::SendFault)?;
        out.send().map_err(DhcpError::SendFault)?;
        Ok(())
    }

    fn receive<B: Bus>(
        &mut self,
        dev: &mut Device<B>,
        want: MessageType,
    ) -> Result<Step, DhcpError> {
        let mut datagram = match Incoming::next(dev, self.config.socket).map_err(DhcpError::Socket)? {
            Some(d) => d,
            None => return Ok(Step::Waiting),
        };
        let verdict = self.examine(&mut datagram, want);
        datagram.finish().map_err(DhcpError::Socket)?;

        let reply = match verdict {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(Step::Discarded),
            Err(e) => {
                log::warn!("dhcp: rejected reply: {}", e);
                self.last_rejection = Some(e);
                return Ok(Step::Discarded);
            }
        };

        if want == MessageType::OFFER {
            self.accept_offer(reply);
            self.advance(Phase::SendRequest);
            return Ok(Step::Advanced);
        }

        if reply.server != Some(self.server) || reply.yiaddr != self.assigned {
            log::warn!(
                "dhcp: ACK for {} from {:?} does not match OFFER of {} from {}",
                reply.yiaddr,
                reply.server,
                self.assigned,
                self.server
            );
            self.last_rejection = Some(DhcpError::AddressMismatch);
            return Ok(Step::Discarded);
        }
        self.accept_ack(dev, reply);
        self.advance(Phase::Done);
        Ok(Step::Advanced)
    }

    /// Validates a datagram and collects its options.
    ///
    /// Returns `Ok(None)` for well-formed replies of another message type.
    fn examine<B: Bus>(
        &self,
        d: &mut Incoming<'_, B>,
        want: MessageType,
    ) -> Result<Option<Reply>, DhcpError> {
        if d.port() != SERVER_PORT {
            return Err(DhcpError::SourcePort(d.port()));
        }
        let header = d.header().map_err(|_| DhcpError::Header)?;
        if header.op != OpCode::BootReply {
            return Err(DhcpError::Header);
        }
        if header.xid != self.config.xid {
            return Err(DhcpError::Xid(header.xid));
        }

        let mut scratch = [0; OPTION_SCRATCH_LEN];
        let kind = match d.option(&mut scratch).map_err(|_| DhcpError::FirstOption)? {
            (opt::MESSAGE_TYPE, &[x]) => MessageType::from(x),
            (code, _) => {
                log::debug!("dhcp: reply starts with option {}, ignoring", code);
                return Ok(None);
            }
        };
        if kind != want {
            log::debug!("dhcp: ignoring {:?} while waiting for {:?}", kind, want);
            return Ok(None);
        }

        let mut reply = Reply {
            yiaddr: header.yiaddr,
            siaddr: header.siaddr,
            ..Reply::default()
        };
        loop {
            let (code, data) = match d.option(&mut scratch) {
                Ok(x) => x,
                Err(e) => {
                    log::debug!("dhcp: options cut short: {}", e);
                    break;
                }
            };
            match DhcpOption::parse(code, data) {
                Ok(DhcpOption::End) => break,
                Ok(DhcpOption::SubnetMask(a)) => reply.subnet = Some(*a),
                Ok(DhcpOption::Router(addrs)) => reply.gateway = addrs.first().copied(),
                Ok(DhcpOption::DomainNameServer(addrs)) => reply.dns = addrs.first().copied(),
                Ok(DhcpOption::ServerIdentifier(a)) => reply.server = Some(*a),
                Ok(DhcpOption::RenewalTime(t)) => reply.renewal_time = Some(t),
                Ok(DhcpOption::AddressLeaseTime(t)) => reply.lease_time = Some(t),
                Ok(_) => {}
                Err(_) => log::debug!("dhcp: ignoring malformed option {}", code),
            }
        }
        Ok(Some(reply))
    }

    fn take_timers(&mut self, reply: &Reply) {
        if let Some(t) = reply.renewal_time.or(reply.lease_time.map(|t| t / 2)) {
            self.lease_seconds = Some(t);
        }
    }

    fn accept_offer(&mut self, reply: Reply) {
        log::info!("dhcp: offered {}", reply.yiaddr);
        self.assigned = reply.yiaddr;
        self.server = reply.server.unwrap_or(reply.siaddr);
        if let Some(subnet) = reply.subnet {
            self.subnet = subnet;
        }
        if let Some(gateway) = reply.gateway {
            self.gateway = gateway;
        }
        if reply.dns.is_some() {
            self.dns = reply.dns;
        }
        self.take_timers(&reply);
    }

    fn accept_ack<B: Bus>(&mut self, dev: &mut Device<B>, reply: Reply) {
        if reply.dns.is_some() {
            self.dns = reply.dns;
        }
        self.take_timers(&reply);
        if self.is_renewal {
            log::info!("dhcp: renewed {} with {}", self.assigned, self.server);
            return;
        }
        log::info!(
            "dhcp: bound {} subnet {} gateway {} from {}",
            self.assigned,
            self.subnet,
            self.gateway,
            self.server
        );
        dev.set_gateway(self.gateway);
        dev.set_subnet(self.subnet);
        dev.set_ip(self.assigned);
    }
}

/// Acquires a lease, or renews `lease` if `lease.is_renewal` is set.
///
/// On success the device's address registers hold the lease (untouched
/// by a renewal), `lease` holds the server and renewal interval, and the
/// first advertised DNS server is stored in `dns_out` if there was one.
/// The socket is closed on return either way.
pub fn acquire_or_renew_lease<B: Bus, D: Delay>(
    dev: &mut Device<B>,
    delay: &mut D,
    config: &ClientConfig,
    dns_out: Option<&mut Addr>,
    lease: &mut Lease,
) -> Result<(), DhcpError> {
    if !lease.is_renewal {
        dev.set_ip(Addr::UNSPECIFIED);
        dev.set_subnet(Addr::BROADCAST);
        dev.set_gateway(Addr::UNSPECIFIED);
    }
    if !dev.link_up() {
        log::warn!("dhcp: link down");
        return Err(DhcpError::LinkDown);
    }

    let s = config.socket;
    dev.open(s, Protocol::Udp, CLIENT_PORT)
        .map_err(DhcpError::Socket)?;
    dev.set_destination(s, Addr::BROADCAST, SERVER_PORT);

    let mac = dev.mac();
    let mut session = if lease.is_renewal {
        let (assigned, gateway, subnet) = (dev.ip(), dev.gateway(), dev.subnet());
        Session::renewing(*config, mac, lease.dhcp_server_address, assigned, gateway, subnet)
    } else {
        Session::new(*config, mac)
    };

    let result = session.run(dev, delay);
    let closed = dev.close(s);
    result?;
    closed.map_err(DhcpError::Socket)?;

    lease.dhcp_server_address = session.server();
    if let Some(seconds) = session.lease_seconds() {
        lease.lease_seconds = seconds;
    }
    if let (Some(out), Some(dns)) = (dns_out, session.dns()) {
        *out = dns;
    }
    Ok(())
}
