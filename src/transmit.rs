//! Non-blocking transmission of one DNS query to a list of servers.
//!
//! The caller owns the event loop. Each iteration it asks [`Transmit::io`]
//! which descriptor to wait on (and lowers its deadline to ours), waits,
//! then calls [`Transmit::get`] which performs at most one I/O operation.
//!
//! UDP goes round-robin over the 16 server slots, once per round, with
//! growing per-round timeouts. A truncated reply switches to TCP starting
//! again at the first server; TCP tries each server once with its own
//! deadline. Replies whose id or question differ from ours are dropped as
//! if they never arrived.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

use crate::proto_utils::{
    CLASS_IN, domain_equal, domain_length, parse_question, server_failed, wants_tcp,
};
use crate::random::DnsRandom;

pub const MAX_SERVERS: usize = 16;
/// Receive buffer for UDP replies; anything larger is discarded.
pub const MAX_UDP_REPLY: usize = 4096;
const MAX_UDP_QUERY: usize = 512;
const ROUNDS: usize = 4;
/// Round whose refusals and server failures keep waiting instead of moving on.
const PATIENT_ROUND: usize = 2;

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("query name is not a valid wire-format domain")]
    BadName,
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
    #[error("no server gave a usable answer")]
    Exhausted,
    #[error("no query in progress")]
    NoQuery,
}

/// Up to 16 upstream IPv4 addresses; unspecified (0.0.0.0) slots are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Servers([Ipv4Addr; MAX_SERVERS]);

impl Default for Servers {
    fn default() -> Self {
        Servers([Ipv4Addr::UNSPECIFIED; MAX_SERVERS])
    }
}

impl Servers {
    /// Takes at most the first 16 addresses.
    pub fn from_slice(ips: &[Ipv4Addr]) -> Self {
        let mut s = Self::default();
        for (slot, ip) in s.0.iter_mut().zip(ips) {
            *slot = *ip;
        }
        s
    }

    /// The 64-byte block form: 16 addresses in network order.
    pub fn from_bytes(block: &[u8; 4 * MAX_SERVERS]) -> Self {
        let mut s = Self::default();
        for (slot, quad) in s.0.iter_mut().zip(block.chunks_exact(4)) {
            *slot = Ipv4Addr::new(quad[0], quad[1], quad[2], quad[3]);
        }
        s
    }

    pub fn to_bytes(&self) -> [u8; 4 * MAX_SERVERS] {
        let mut block = [0u8; 4 * MAX_SERVERS];
        for (quad, ip) in block.chunks_exact_mut(4).zip(&self.0) {
            quad.copy_from_slice(&ip.octets());
        }
        block
    }

    pub fn get(&self, index: usize) -> Option<Ipv4Addr> {
        self.0.get(index).copied().filter(|ip| !ip.is_unspecified())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|ip| ip.is_unspecified())
    }
}

/// Timing and addressing knobs.
#[derive(Debug, Clone)]
pub struct TransmitPolicy {
    pub port: u16,
    pub local_ip: Ipv4Addr,
    /// Deadline of each UDP round.
    pub udp_timeouts: [Duration; ROUNDS],
    /// Deadline for a TCP connect, and again for the reply once sent.
    pub tcp_timeout: Duration,
    /// Random source ports tried before letting the kernel pick one.
    pub bind_attempts: u32,
}

impl Default for TransmitPolicy {
    fn default() -> Self {
        Self {
            port: 53,
            local_ip: Ipv4Addr::UNSPECIFIED,
            udp_timeouts: [1, 3, 11, 45].map(Duration::from_secs),
            tcp_timeout: Duration::from_secs(10),
            bind_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// What the caller should wait for before the next [`Transmit::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub fd: RawFd,
    pub interest: Interest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
}

/// Externally visible state, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    UdpWait { round: usize },
    TcpConnecting,
    TcpSending,
    TcpLenHi,
    TcpLenLo,
    TcpBody,
}

enum State {
    Idle,
    UdpWait { socket: UdpSocket },
    TcpConnecting { stream: TcpStream },
    TcpSending { stream: TcpStream, sent: usize },
    TcpLenHi { stream: TcpStream },
    TcpLenLo { stream: TcpStream, hi: u8 },
    TcpBody { stream: TcpStream, packet: Vec<u8>, received: usize },
}

enum Step {
    Wait,
    NextUdp,
    FirstTcp,
    NextTcp,
    Accept(Bytes),
}

pub struct Transmit {
    policy: TransmitPolicy,
    /// Length-prefixed query; empty when no query is outstanding.
    query: Vec<u8>,
    qtype: [u8; 2],
    servers: Servers,
    udp_round: usize,
    cur_server: usize,
    deadline: Instant,
    state: State,
    packet: Option<Bytes>,
}

impl Transmit {
    pub fn new(policy: TransmitPolicy) -> Self {
        Self {
            policy,
            query: Vec::new(),
            qtype: [0, 0],
            servers: Servers::default(),
            udp_round: 0,
            cur_server: 0,
            deadline: Instant::now(),
            state: State::Idle,
            packet: None,
        }
    }

    /// Build the query for `qname` (wire form) and send the first attempt.
    /// Recursive queries set RD and get all four UDP rounds; iterative
    /// queries skip the shortest one.
    pub fn start(
        &mut self,
        servers: Servers,
        recursive: bool,
        qname: &[u8],
        qtype: [u8; 2],
        rng: &mut DnsRandom,
    ) -> Result<(), TransmitError> {
        self.free();
        let len = domain_length(qname).ok_or(TransmitError::BadName)?;

        let mut query = Vec::with_capacity(len + 18);
        query.extend_from_slice(&((len + 16) as u16).to_be_bytes());
        query.extend_from_slice(&[0, 0]);
        query.extend_from_slice(if recursive { &[1, 0] } else { &[0, 0] });
        query.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        query.extend_from_slice(&qname[..len]);
        query.extend_from_slice(&qtype);
        query.extend_from_slice(&CLASS_IN);

        self.query = query;
        self.qtype = qtype;
        self.servers = servers;
        self.udp_round = if recursive { 0 } else { 1 };
        self.cur_server = 0;

        let res = if len + 16 > MAX_UDP_QUERY {
            self.this_tcp(rng)
        } else {
            self.this_udp(rng)
        };
        res.map(|_| ())
    }

    /// Close the socket and release the query and any received packet.
    pub fn free(&mut self) {
        self.state = State::Idle;
        self.query.clear();
        self.packet = None;
    }

    /// Descriptor and readiness wanted now; lowers `deadline` to ours.
    pub fn io(&self, deadline: &mut Instant) -> Option<IoRequest> {
        let (fd, interest) = match &self.state {
            State::Idle => return None,
            State::UdpWait { socket } => (socket.as_raw_fd(), Interest::Read),
            State::TcpConnecting { stream } | State::TcpSending { stream, .. } => {
                (stream.as_raw_fd(), Interest::Write)
            }
            State::TcpLenHi { stream }
            | State::TcpLenLo { stream, .. }
            | State::TcpBody { stream, .. } => (stream.as_raw_fd(), Interest::Read),
        };
        if self.deadline < *deadline {
            *deadline = self.deadline;
        }
        Some(IoRequest { fd, interest })
    }

    /// Advance after the event loop returned. `ready` says whether our
    /// descriptor was reported ready; otherwise only the deadline is checked
    /// against `now`.
    pub fn get(
        &mut self,
        ready: bool,
        now: Instant,
        rng: &mut DnsRandom,
    ) -> Result<Progress, TransmitError> {
        if matches!(self.state, State::Idle) {
            return match self.packet {
                Some(_) => Ok(Progress::Done),
                None => Err(TransmitError::NoQuery),
            };
        }

        let state = std::mem::replace(&mut self.state, State::Idle);
        let (next, step) = if ready {
            self.step(state)
        } else if now < self.deadline {
            (state, Step::Wait)
        } else {
            debug!(target = "transmit", server = ?self.servers.get(self.cur_server), phase = ?phase_of(&state), "deadline passed");
            match state {
                State::UdpWait { .. } => (State::Idle, Step::NextUdp),
                _ => (State::Idle, Step::NextTcp),
            }
        };
        self.state = next;

        match step {
            Step::Wait => Ok(Progress::Pending),
            Step::NextUdp => {
                self.cur_server += 1;
                self.this_udp(rng)
            }
            Step::FirstTcp => {
                debug!(target = "transmit", server = ?self.servers.get(self.cur_server), "server requested tcp");
                self.cur_server = 0;
                self.this_tcp(rng)
            }
            Step::NextTcp => {
                self.cur_server += 1;
                self.this_tcp(rng)
            }
            Step::Accept(packet) => {
                self.packet = Some(packet);
                self.query.clear();
                Ok(Progress::Done)
            }
        }
    }

    fn step(&mut self, state: State) -> (State, Step) {
        match state {
            State::Idle => (State::Idle, Step::Wait),

            State::UdpWait { socket } => {
                let mut buf = [0u8; MAX_UDP_REPLY + 1];
                match retry_intr(|| socket.recv(&mut buf)) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        (State::UdpWait { socket }, Step::Wait)
                    }
                    Err(e)
                        if e.raw_os_error() == Some(libc::ECONNREFUSED)
                            && self.udp_round == PATIENT_ROUND =>
                    {
                        (State::UdpWait { socket }, Step::Wait)
                    }
                    Err(_) | Ok(0) => (State::Idle, Step::NextUdp),
                    Ok(n) if n > MAX_UDP_REPLY => (State::UdpWait { socket }, Step::Wait),
                    Ok(n) => {
                        let reply = &buf[..n];
                        if self.irrelevant(reply) {
                            debug!(target = "transmit", len = n, "dropped irrelevant udp reply");
                            (State::UdpWait { socket }, Step::Wait)
                        } else if wants_tcp(reply) {
                            (State::Idle, Step::FirstTcp)
                        } else if server_failed(reply) {
                            if self.udp_round == PATIENT_ROUND {
                                (State::UdpWait { socket }, Step::Wait)
                            } else {
                                (State::Idle, Step::NextUdp)
                            }
                        } else {
                            (State::Idle, Step::Accept(Bytes::copy_from_slice(reply)))
                        }
                    }
                }
            }

            State::TcpConnecting { stream } => {
                let connected = matches!(stream.take_error(), Ok(None)) && stream.peer_addr().is_ok();
                if connected {
                    (State::TcpSending { stream, sent: 0 }, Step::Wait)
                } else {
                    (State::Idle, Step::NextTcp)
                }
            }

            State::TcpSending { mut stream, sent } => {
                match retry_intr(|| stream.write(&self.query[sent..])) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        (State::TcpSending { stream, sent }, Step::Wait)
                    }
                    Err(_) | Ok(0) => (State::Idle, Step::NextTcp),
                    Ok(n) if sent + n == self.query.len() => {
                        self.deadline = Instant::now() + self.policy.tcp_timeout;
                        (State::TcpLenHi { stream }, Step::Wait)
                    }
                    Ok(n) => (State::TcpSending { stream, sent: sent + n }, Step::Wait),
                }
            }

            State::TcpLenHi { mut stream } => match read_byte(&mut stream) {
                Ok(Some(hi)) => (State::TcpLenLo { stream, hi }, Step::Wait),
                Ok(None) => (State::TcpLenHi { stream }, Step::Wait),
                Err(_) => (State::Idle, Step::NextTcp),
            },

            State::TcpLenLo { mut stream, hi } => match read_byte(&mut stream) {
                Ok(Some(lo)) => {
                    let len = u16::from_be_bytes([hi, lo]) as usize;
                    if len == 0 {
                        (State::Idle, Step::NextTcp)
                    } else {
                        let packet = vec![0u8; len];
                        (State::TcpBody { stream, packet, received: 0 }, Step::Wait)
                    }
                }
                Ok(None) => (State::TcpLenLo { stream, hi }, Step::Wait),
                Err(_) => (State::Idle, Step::NextTcp),
            },

            State::TcpBody {
                mut stream,
                mut packet,
                received,
            } => match retry_intr(|| stream.read(&mut packet[received..])) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    (State::TcpBody { stream, packet, received }, Step::Wait)
                }
                Err(_) | Ok(0) => (State::Idle, Step::NextTcp),
                Ok(n) if received + n < packet.len() => (
                    State::TcpBody {
                        stream,
                        packet,
                        received: received + n,
                    },
                    Step::Wait,
                ),
                Ok(_) => {
                    drop(stream);
                    if self.irrelevant(&packet) || wants_tcp(&packet) || server_failed(&packet) {
                        debug!(target = "transmit", len = packet.len(), "unusable tcp reply");
                        (State::Idle, Step::NextTcp)
                    } else {
                        (State::Idle, Step::Accept(Bytes::from(packet)))
                    }
                }
            },
        }
    }

    fn this_udp(&mut self, rng: &mut DnsRandom) -> Result<Progress, TransmitError> {
        self.state = State::Idle;

        while self.udp_round < ROUNDS {
            while self.cur_server < MAX_SERVERS {
                if let Some(ip) = self.servers.get(self.cur_server) {
                    self.stamp_id(rng);
                    let socket = match self.bind_random(Type::DGRAM, Protocol::UDP, rng) {
                        Ok(s) => s,
                        Err(err) => return Err(self.fail(err)),
                    };
                    match self.send_udp(socket, ip) {
                        Ok(socket) => {
                            self.deadline = Instant::now() + self.policy.udp_timeouts[self.udp_round];
                            self.state = State::UdpWait { socket };
                            debug!(target = "transmit", server = %ip, round = self.udp_round, "udp query sent");
                            return Ok(Progress::Pending);
                        }
                        Err(err) => {
                            debug!(target = "transmit", server = %ip, error = %err, "udp send failed");
                        }
                    }
                }
                self.cur_server += 1;
            }
            self.udp_round += 1;
            self.cur_server = 0;
        }

        debug!(target = "transmit", "udp rounds exhausted");
        self.free();
        Err(TransmitError::Exhausted)
    }

    fn this_tcp(&mut self, rng: &mut DnsRandom) -> Result<Progress, TransmitError> {
        self.state = State::Idle;
        self.packet = None;

        while self.cur_server < MAX_SERVERS {
            if let Some(ip) = self.servers.get(self.cur_server) {
                self.stamp_id(rng);
                let socket = match self.bind_random(Type::STREAM, Protocol::TCP, rng) {
                    Ok(s) => s,
                    Err(err) => return Err(self.fail(err)),
                };
                self.deadline = Instant::now() + self.policy.tcp_timeout;
                let addr = SocketAddrV4::new(ip, self.policy.port);
                match socket.connect(&addr.into()) {
                    Ok(()) => {
                        self.state = State::TcpSending {
                            stream: socket.into(),
                            sent: 0,
                        };
                        debug!(target = "transmit", server = %ip, "tcp connected");
                        return Ok(Progress::Pending);
                    }
                    Err(err) if connect_in_progress(&err) => {
                        self.state = State::TcpConnecting {
                            stream: socket.into(),
                        };
                        debug!(target = "transmit", server = %ip, "tcp connecting");
                        return Ok(Progress::Pending);
                    }
                    Err(err) => {
                        debug!(target = "transmit", server = %ip, error = %err, "tcp connect failed");
                    }
                }
            }
            self.cur_server += 1;
        }

        debug!(target = "transmit", "tcp servers exhausted");
        self.free();
        Err(TransmitError::Exhausted)
    }

    fn fail(&mut self, err: io::Error) -> TransmitError {
        warn!(target = "transmit", error = %err, "cannot open query socket");
        self.free();
        TransmitError::Io(err)
    }

    fn send_udp(&self, socket: Socket, ip: Ipv4Addr) -> io::Result<UdpSocket> {
        socket.connect(&SocketAddrV4::new(ip, self.policy.port).into())?;
        let socket: UdpSocket = socket.into();
        let payload = &self.query[2..];
        let n = retry_intr(|| socket.send(payload))?;
        if n != payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short udp send"));
        }
        Ok(socket)
    }

    /// Non-blocking socket bound to a random unprivileged port, falling
    /// back to an ephemeral one.
    fn bind_random(&self, ty: Type, proto: Protocol, rng: &mut DnsRandom) -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, ty, Some(proto))?;
        socket.set_nonblocking(true)?;
        for _ in 0..self.policy.bind_attempts {
            let port = 1025 + rng.below(64510) as u16;
            let local = SocketAddrV4::new(self.policy.local_ip, port);
            if socket.bind(&local.into()).is_ok() {
                return Ok(socket);
            }
        }
        socket.bind(&SocketAddrV4::new(self.policy.local_ip, 0).into())?;
        Ok(socket)
    }

    fn stamp_id(&mut self, rng: &mut DnsRandom) {
        let id = rng.id().to_be_bytes();
        self.query[2] = id[0];
        self.query[3] = id[1];
    }

    /// True unless `reply` carries our id and exactly our question.
    fn irrelevant(&self, reply: &[u8]) -> bool {
        let Some(q) = parse_question(reply) else {
            return true;
        };
        q.id.to_be_bytes() != self.query[2..4]
            || !domain_equal(&q.name, &self.query[14..])
            || q.qtype != self.qtype
            || q.qclass != CLASS_IN
    }

    pub fn packet(&self) -> Option<&Bytes> {
        self.packet.as_ref()
    }

    pub fn take_packet(&mut self) -> Option<Bytes> {
        self.packet.take()
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::UdpWait { .. } => Phase::UdpWait {
                round: self.udp_round,
            },
            other => phase_of(other),
        }
    }

    pub fn current_server(&self) -> usize {
        self.cur_server
    }

    pub fn udp_round(&self) -> usize {
        self.udp_round
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Transaction id of the attempt in flight.
    pub fn query_id(&self) -> Option<u16> {
        self.query
            .get(2..4)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

fn phase_of(state: &State) -> Phase {
    match state {
        State::Idle => Phase::Idle,
        State::UdpWait { .. } => Phase::UdpWait { round: 0 },
        State::TcpConnecting { .. } => Phase::TcpConnecting,
        State::TcpSending { .. } => Phase::TcpSending,
        State::TcpLenHi { .. } => Phase::TcpLenHi,
        State::TcpLenLo { .. } => Phase::TcpLenLo,
        State::TcpBody { .. } => Phase::TcpBody,
    }
}

fn retry_intr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

/// `Ok(None)` when nothing is available yet; EOF is an error.
fn read_byte(stream: &mut TcpStream) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    match retry_intr(|| stream.read(&mut b)) {
        Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(_) => Ok(Some(b[0])),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR))
        || err.kind() == io::ErrorKind::WouldBlock
}
