//! Loopback fixtures shared by the transmission and resolver tests.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::thread::{self, JoinHandle, sleep};
use std::time::{Duration, Instant};

use crate::random::DnsRandom;
use crate::transmit::{Progress, Transmit};

pub const QTYPE_A: [u8; 2] = [0, 1];
pub const ALT_SERVER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// One port number bound for UDP on 127.0.0.1 and 127.0.0.2, and for TCP on
/// both addresses when asked.
pub struct LoopbackPorts {
    pub port: u16,
    pub udp: UdpSocket,
    pub alt: UdpSocket,
    pub tcp: Option<TcpListener>,
    pub alt_tcp: Option<TcpListener>,
}

impl LoopbackPorts {
    pub fn bind(with_tcp: bool) -> Self {
        for _ in 0..50 {
            let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            let port = udp.local_addr().unwrap().port();
            let Ok(alt) = UdpSocket::bind((ALT_SERVER, port)) else {
                continue;
            };
            let (tcp, alt_tcp) = if with_tcp {
                match (
                    TcpListener::bind((Ipv4Addr::LOCALHOST, port)),
                    TcpListener::bind((ALT_SERVER, port)),
                ) {
                    (Ok(a), Ok(b)) => (Some(a), Some(b)),
                    _ => continue,
                }
            } else {
                (None, None)
            };
            return Self {
                port,
                udp,
                alt,
                tcp,
                alt_tcp,
            };
        }
        panic!("no free loopback port pair");
    }
}

/// Drain and count whatever datagrams are queued.
pub fn blackhole_count(socket: &UdpSocket) -> usize {
    socket.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 4096];
    let mut n = 0;
    while socket.recv_from(&mut buf).is_ok() {
        n += 1;
    }
    n
}

pub fn recv_query(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    socket.set_nonblocking(false).unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 4096];
    let (n, from) = socket.recv_from(&mut buf).expect("query datagram");
    (buf[..n].to_vec(), from)
}

/// Answer `query` (no length prefix) with the given rcode. A plain
/// NOERROR answer carries one A record for 127.0.0.9 with TTL 300.
pub fn reply_to(query: &[u8], rcode: u8, truncated: bool) -> Vec<u8> {
    let mut reply = query.to_vec();
    reply[2] |= 0x80;
    if truncated {
        reply[2] |= 0x02;
    }
    reply[3] = 0x80 | rcode;
    if rcode == 0 && !truncated {
        reply[7] = 1;
        reply.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0x01, 0x2C, 0, 4, 127, 0, 0, 9]);
    }
    reply
}

/// Accept one TCP connection and answer the query read from it.
pub fn serve_tcp_once(listener: TcpListener, rcode: u8) -> JoinHandle<Vec<u8>> {
    serve_tcp_with(listener, move |query| reply_to(query, rcode, false))
}

/// Like [`serve_tcp_once`], with the reply built by `answer`.
pub fn serve_tcp_with<F>(listener: TcpListener, answer: F) -> JoinHandle<Vec<u8>>
where
    F: FnOnce(&[u8]) -> Vec<u8> + Send + 'static,
{
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("tcp client");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();
        let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut query).unwrap();
        let reply = answer(&query);
        stream.write_all(&(reply.len() as u16).to_be_bytes()).unwrap();
        stream.write_all(&reply).unwrap();
        reply
    })
}

/// Poll a readable transmission until it finishes or two seconds pass.
pub fn wait_for_progress(tx: &mut Transmit, rng: &mut DnsRandom) -> Progress {
    let give_up = Instant::now() + Duration::from_secs(2);
    while Instant::now() < give_up {
        if tx.get(true, Instant::now(), rng).unwrap() == Progress::Done {
            return Progress::Done;
        }
        sleep(Duration::from_millis(10));
    }
    Progress::Pending
}
