//! An in-memory W5500 for tests.
//!
//! Frames arriving through [`Bus`] are decoded into register and buffer
//! accesses. Like the real chip, written `Sn_TX_WR` and `Sn_RX_RD` values
//! only take effect on SEND and RECV respectively; until then reads
//! return the previous pointer.

use std::collections::VecDeque;

use byteorder::{ByteOrder, NetworkEndian};

use crate::bus::{Bus, Delay, RWB_WRITE};
use crate::device::{reg, sn, Command, Interrupt, PhyStatus, Status};
use crate::dhcpv4::{opt, MessageType, MAGIC_COOKIE};
use crate::socket::{SocketId, MAX_SOCKETS};
use crate::Addr;

const RING: usize = 2048;
const SOCKET_REGS: usize = 0x30;

/// A datagram (or stream segment) the chip was told to send.
#[derive(Clone, Debug)]
pub struct Sent {
    pub socket: SocketId,
    pub dest: Addr,
    pub port: u16,
    pub data: Vec<u8>,
}

struct Reply {
    after_sends: usize,
    socket: SocketId,
    source: [u8; 4],
    port: u16,
    payload: Vec<u8>,
}

struct Socket {
    regs: [u8; SOCKET_REGS],
    tx: Vec<u8>,
    rx: Vec<u8>,
    /// Committed write pointer.
    tx_wr: u16,
    tx_rd: u16,
    /// Committed read pointer.
    rx_rd: u16,
    rx_wr: u16,
}

impl Socket {
    fn new() -> Self {
        let mut s = Socket {
            regs: [0; SOCKET_REGS],
            tx: vec![0; RING],
            rx: vec![0; RING],
            tx_wr: MockChip::INITIAL_POINTER,
            tx_rd: MockChip::INITIAL_POINTER,
            rx_rd: MockChip::INITIAL_POINTER,
            rx_wr: MockChip::INITIAL_POINTER,
        };
        s.set_u16(sn::TX_WR, MockChip::INITIAL_POINTER);
        s.set_u16(sn::RX_RD, MockChip::INITIAL_POINTER);
        s
    }

    fn u16_at(&self, offset: u16) -> u16 {
        NetworkEndian::read_u16(&self.regs[offset as usize..])
    }

    fn set_u16(&mut self, offset: u16, value: u16) {
        NetworkEndian::write_u16(&mut self.regs[offset as usize..], value)
    }

    fn status(&self) -> Status {
        Status::from(self.regs[sn::SR as usize])
    }

    fn set_status(&mut self, status: Status) {
        self.regs[sn::SR as usize] = status.into();
    }

    fn raise(&mut self, flags: Interrupt) {
        self.regs[sn::IR as usize] |= flags.bits();
    }

    /// The value a read of the 16-bit pointer register at `base` returns.
    fn pointer(&self, base: u16) -> Option<u16> {
        Some(match base {
            sn::TX_FSR => (RING as u16).wrapping_sub(self.tx_wr.wrapping_sub(self.tx_rd)),
            sn::TX_RD => self.tx_rd,
            sn::TX_WR => self.tx_wr,
            sn::RX_RSR => self.rx_wr.wrapping_sub(self.rx_rd),
            sn::RX_RD => self.rx_rd,
            sn::RX_WR => self.rx_wr,
            _ => return None,
        })
    }

    fn push_rx(&mut self, data: &[u8]) {
        for &b in data {
            self.rx[self.rx_wr as usize % RING] = b;
            self.rx_wr = self.rx_wr.wrapping_add(1);
        }
        self.raise(Interrupt::RECV);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Common,
    Regs(usize),
    Tx(usize),
    Rx(usize),
}

struct Frame {
    bytes: usize,
    address: u16,
    target: Target,
    write: bool,
}

pub struct MockChip {
    pub common: [u8; 0x40],
    sockets: Vec<Socket>,
    frame: Option<Frame>,
    common_write_log: Vec<u16>,
    replies: VecDeque<Reply>,
    /// Everything sent so far, in order.
    pub sent: Vec<Sent>,
    /// Limits how far a single SEND advances `Sn_TX_RD`.
    pub window: Option<u16>,
    /// Never clear `Sn_CR`, as if the chip had hung.
    pub stuck: bool,
    /// Corrupt this many of the next `Sn_RX_RSR` reads.
    pub glitch_reads: u8,
}

impl MockChip {
    /// Where all ring pointers start, close to wrapping around.
    pub const INITIAL_POINTER: u16 = 0xFF80;

    pub fn new() -> Self {
        let mut common = [0; 0x40];
        common[reg::PHYCFGR as usize] = (PhyStatus::LINK | PhyStatus::SPEED_100).bits();
        MockChip {
            common,
            sockets: (0..MAX_SOCKETS).map(|_| Socket::new()).collect(),
            frame: None,
            common_write_log: Vec::new(),
            replies: VecDeque::new(),
            sent: Vec::new(),
            window: None,
            stuck: false,
            glitch_reads: 0,
        }
    }

    pub fn set_link(&mut self, up: bool) {
        let phy = &mut self.common[reg::PHYCFGR as usize];
        if up {
            *phy |= PhyStatus::LINK.bits();
        } else {
            *phy &= !PhyStatus::LINK.bits();
        }
    }

    pub fn set_mac(&mut self, mac: [u8; 6]) {
        self.preset_common(reg::SHAR, &mac);
    }

    /// Sets common registers without recording a write.
    pub fn preset_common(&mut self, offset: u16, data: &[u8]) {
        let start = offset as usize;
        self.common[start..start + data.len()].copy_from_slice(data);
    }

    pub fn common_u16(&self, offset: u16) -> u16 {
        NetworkEndian::read_u16(&self.common[offset as usize..])
    }

    /// Counts the write frames that started at common register `offset`.
    pub fn common_writes(&self, offset: u16) -> usize {
        self.common_write_log.iter().filter(|&&o| o == offset).count()
    }

    /// Reads back a 16-bit socket register as last written by the host.
    pub fn socket_u16(&self, s: SocketId, offset: u16) -> u16 {
        self.sockets[s.index() as usize].u16_at(offset)
    }

    /// Queues a datagram as received from `source:port`.
    pub fn deliver(&mut self, s: SocketId, source: [u8; 4], port: u16, payload: &[u8]) {
        let mut preamble = [0; 8];
        preamble[..4].copy_from_slice(&source);
        NetworkEndian::write_u16(&mut preamble[4..], port);
        NetworkEndian::write_u16(&mut preamble[6..], payload.len() as u16);
        let socket = &mut self.sockets[s.index() as usize];
        socket.push_rx(&preamble);
        socket.push_rx(payload);
    }

    /// Queues bytes received on a TCP connection.
    pub fn deliver_stream(&mut self, s: SocketId, data: &[u8]) {
        self.sockets[s.index() as usize].push_rx(data)
    }

    /// Completes a connection to a listening socket.
    pub fn peer_connect(&mut self, s: SocketId) {
        let socket = &mut self.sockets[s.index() as usize];
        socket.set_status(Status::ESTABLISHED);
        socket.raise(Interrupt::CON);
    }

    /// Delivers `payload` once the `n`-th SEND has been executed.
    pub fn reply_after(&mut self, n: usize, s: SocketId, source: [u8; 4], port: u16, payload: Vec<u8>) {
        self.replies.push_back(Reply {
            after_sends: n,
            socket: s,
            source,
            port,
            payload,
        });
    }

    fn execute(&mut self, n: usize, cmd: u8) {
        if cmd == Command::Send as u8 {
            return self.transmit(n);
        }
        let socket = &mut self.sockets[n];
        match cmd {
            c if c == Command::Open as u8 => {
                let status = match socket.regs[sn::MR as usize] & 0x0F {
                    1 => Status::INIT,
                    2 => Status::UDP,
                    4 => Status::MACRAW,
                    _ => Status::CLOSED,
                };
                socket.set_status(status);
            }
            c if c == Command::Listen as u8 => {
                if socket.status() == Status::INIT {
                    socket.set_status(Status::LISTEN);
                }
            }
            c if c == Command::Connect as u8 => {
                if socket.status() == Status::INIT {
                    socket.set_status(Status::ESTABLISHED);
                    socket.raise(Interrupt::CON);
                }
            }
            c if c == Command::Disconnect as u8 || c == Command::Close as u8 => {
                socket.set_status(Status::CLOSED);
            }
            c if c == Command::Recv as u8 => {
                socket.rx_rd = socket.u16_at(sn::RX_RD);
            }
            _ => {}
        }
    }

    fn transmit(&mut self, n: usize) {
        let socket = &mut self.sockets[n];
        let staged = socket.u16_at(sn::TX_WR);
        let len = staged.wrapping_sub(socket.tx_rd);
        let data = (0..len)
            .map(|i| socket.tx[socket.tx_rd.wrapping_add(i) as usize % RING])
            .collect();
        let advance = self.window.map_or(len, |w| w.min(len));
        socket.tx_rd = socket.tx_rd.wrapping_add(advance);
        socket.tx_wr = staged;
        socket.raise(Interrupt::SEND_OK);

        let mut dest = [0; 4];
        dest.copy_from_slice(&socket.regs[sn::DIPR as usize..][..4]);
        self.sent.push(Sent {
            socket: SocketId::new(n as u8).unwrap(),
            dest: Addr(dest),
            port: socket.u16_at(sn::DPORT),
            data,
        });

        let sends = self.sent.len();
        while self.replies.front().map_or(false, |r| r.after_sends <= sends) {
            let r = self.replies.pop_front().unwrap();
            self.deliver(r.socket, r.source, r.port, &r.payload);
        }
    }

    fn read_byte(&mut self, target: Target, address: u16) -> u8 {
        match target {
            Target::Common => self.common[address as usize],
            Target::Tx(n) => self.sockets[n].tx[address as usize % RING],
            Target::Rx(n) => self.sockets[n].rx[address as usize % RING],
            Target::Regs(n) => {
                let base = address & !1;
                let socket = &self.sockets[n];
                match socket.pointer(base) {
                    Some(v) => {
                        let mut b = [0; 2];
                        NetworkEndian::write_u16(&mut b, v);
                        if address == base {
                            if base == sn::RX_RSR && self.glitch_reads > 0 {
                                let glitch = self.glitch_reads;
                                self.glitch_reads -= 1;
                                return b[0] ^ glitch;
                            }
                            b[0]
                        } else {
                            b[1]
                        }
                    }
                    None => socket.regs[address as usize],
                }
            }
        }
    }

    fn write_byte(&mut self, target: Target, address: u16, value: u8) {
        match target {
            Target::Common => self.common[address as usize] = value,
            Target::Tx(n) => self.sockets[n].tx[address as usize % RING] = value,
            Target::Rx(n) => self.sockets[n].rx[address as usize % RING] = value,
            Target::Regs(n) => match address {
                sn::IR => self.sockets[n].regs[sn::IR as usize] &= !value,
                sn::CR => {
                    self.sockets[n].regs[sn::CR as usize] = value;
                    if !self.stuck {
                        self.execute(n, value);
                        self.sockets[n].regs[sn::CR as usize] = 0;
                    }
                }
                _ => self.sockets[n].regs[address as usize] = value,
            },
        }
    }
}

impl Bus for MockChip {
    fn select(&mut self) {
        assert!(self.frame.is_none(), "nested frame");
        self.frame = Some(Frame {
            bytes: 0,
            address: 0,
            target: Target::Common,
            write: false,
        });
    }

    fn deselect(&mut self) {
        let frame = self.frame.take().expect("deselect outside of a frame");
        if frame.write && frame.target == Target::Common {
            self.common_write_log.push(frame.address);
        }
    }

    fn transfer(&mut self, byte: u8) -> u8 {
        let mut frame = self.frame.take().expect("transfer outside of a frame");
        let out = match frame.bytes {
            0 => {
                frame.address = u16::from(byte) << 8;
                0
            }
            1 => {
                frame.address |= u16::from(byte);
                0
            }
            2 => {
                frame.write = byte & RWB_WRITE != 0;
                let bsb = usize::from(byte >> 3);
                frame.target = match bsb {
                    0 => Target::Common,
                    _ => {
                        let n = (bsb - 1) / 4;
                        match (bsb - 1) % 4 {
                            0 => Target::Regs(n),
                            1 => Target::Tx(n),
                            2 => Target::Rx(n),
                            _ => panic!("reserved block {}", bsb),
                        }
                    }
                };
                0
            }
            i => {
                let address = frame.address.wrapping_add((i - 3) as u16);
                if frame.write {
                    self.write_byte(frame.target, address, byte);
                    0
                } else {
                    self.read_byte(frame.target, address)
                }
            }
        };
        frame.bytes += 1;
        self.frame = Some(frame);
        out
    }
}

/// A [`Delay`] that only counts.
#[derive(Default, Debug)]
pub struct CountingDelay {
    pub calls: u32,
    pub total_ms: u32,
}

impl Delay for CountingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.calls += 1;
        self.total_ms += ms;
    }
}

/// Builds a server reply with the message type option first.
pub fn dhcp_reply(xid: u32, kind: MessageType, yiaddr: Addr, options: &[(u8, &[u8])]) -> Vec<u8> {
    let mut msg = vec![0; 236];
    msg[0] = 2;
    msg[1] = 1;
    msg[2] = 6;
    NetworkEndian::write_u32(&mut msg[4..], xid);
    msg[16..20].copy_from_slice(&yiaddr.0);
    msg[28..34].copy_from_slice(&[0x00, 0x08, 0xDC, 0xAA, 0xBB, 0xCC]);
    msg.extend_from_slice(&MAGIC_COOKIE);
    msg.extend_from_slice(&[opt::MESSAGE_TYPE, 1, kind.into()]);
    for &(code, data) in options {
        msg.push(code);
        msg.push(data.len() as u8);
        msg.extend_from_slice(data);
    }
    msg.push(opt::END);
    msg
}
