//! Wire-format helpers the engines lean on: domain names in uncompressed
//! wire form, bounded reads out of packets, and a few header predicates.
//!
//! These parse just enough to validate and key packets; full message
//! decoding is left to hickory-proto where it is needed for display.

pub const HEADER_LEN: usize = 12;
pub const CLASS_IN: [u8; 2] = [0, 1];

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 100;

/// Length of a wire name including the terminating root label, or `None`
/// if the name is not terminated within `name` or has an oversized label.
pub fn domain_length(name: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let len = *name.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return (pos <= MAX_NAME_LEN).then_some(pos);
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        pos += len;
    }
}

/// Case-insensitive comparison of two wire names.
pub fn domain_equal(a: &[u8], b: &[u8]) -> bool {
    match (domain_length(a), domain_length(b)) {
        // label length bytes are < 64 and never collide with letters
        (Some(la), Some(lb)) => la == lb && a[..la].eq_ignore_ascii_case(&b[..lb]),
        _ => false,
    }
}

/// Lowercased copy of a wire name, for hashing keys.
pub fn domain_lower(name: &[u8]) -> Option<Vec<u8>> {
    let len = domain_length(name)?;
    Some(name[..len].to_ascii_lowercase())
}

/// "www.example.com" (optionally with trailing dot) to wire form.
/// No escape sequences; empty string and "." are the root.
pub fn domain_from_dot(dotted: &str) -> Option<Vec<u8>> {
    let trimmed = dotted.strip_suffix('.').unwrap_or(dotted);
    let mut out = Vec::with_capacity(trimmed.len() + 2);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return None;
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    (out.len() <= MAX_NAME_LEN).then_some(out)
}

pub fn domain_to_dot(name: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while let Some(&len) = name.get(pos) {
        if len == 0 {
            break;
        }
        let end = (pos + 1 + len as usize).min(name.len());
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&String::from_utf8_lossy(&name[pos + 1..end]));
        pos = end;
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Copy `out.len()` bytes starting at `pos`; returns the position after.
pub fn packet_copy(packet: &[u8], pos: usize, out: &mut [u8]) -> Option<usize> {
    let end = pos.checked_add(out.len())?;
    out.copy_from_slice(packet.get(pos..end)?);
    Some(end)
}

/// Read a possibly-compressed name at `pos`. Returns the name in
/// uncompressed wire form and the position just after it in `packet`.
pub fn packet_getname(packet: &[u8], pos: usize) -> Option<(Vec<u8>, usize)> {
    let mut name = Vec::with_capacity(64);
    let mut cur = pos;
    let mut after = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(cur)?;
        if len & 0xC0 == 0xC0 {
            let lo = *packet.get(cur + 1)?;
            if after.is_none() {
                after = Some(cur + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            cur = (((len & 0x3F) as usize) << 8) | lo as usize;
            continue;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        if len == 0 {
            name.push(0);
            if name.len() > MAX_NAME_LEN {
                return None;
            }
            return Some((name, after.unwrap_or(cur + 1)));
        }
        let label = packet.get(cur + 1..cur + 1 + len as usize)?;
        name.push(len);
        name.extend_from_slice(label);
        if name.len() >= MAX_NAME_LEN {
            return None;
        }
        cur += 1 + len as usize;
    }
}

#[inline]
pub fn rcode(packet: &[u8]) -> Option<u8> {
    packet.get(3).map(|b| b & 0x0F)
}

/// Server asks us to retry over TCP (TC bit), or the header is unreadable.
pub fn wants_tcp(packet: &[u8]) -> bool {
    match packet.get(..HEADER_LEN) {
        Some(h) => h[2] & 0x02 != 0,
        None => true,
    }
}

/// Any rcode besides NOERROR and NXDOMAIN is a server-side failure.
pub fn server_failed(packet: &[u8]) -> bool {
    if packet.len() < HEADER_LEN {
        return true;
    }
    !matches!(rcode(packet), Some(0) | Some(3))
}

/// Question section of a packet with QDCOUNT == 1.
pub struct Question {
    pub id: u16,
    pub name: Vec<u8>,
    pub qtype: [u8; 2],
    pub qclass: [u8; 2],
}

pub fn parse_question(packet: &[u8]) -> Option<Question> {
    let mut header = [0u8; HEADER_LEN];
    let pos = packet_copy(packet, 0, &mut header)?;
    if header[4] != 0 || header[5] != 1 {
        return None;
    }
    let (name, pos) = packet_getname(packet, pos)?;
    let mut tail = [0u8; 4];
    packet_copy(packet, pos, &mut tail)?;
    Some(Question {
        id: u16::from_be_bytes([header[0], header[1]]),
        name,
        qtype: [tail[0], tail[1]],
        qclass: [tail[2], tail[3]],
    })
}

/// Cache key for a question: qtype followed by the lowercased name.
pub fn cache_key(qtype: [u8; 2], name: &[u8]) -> Option<Vec<u8>> {
    let lower = domain_lower(name)?;
    let mut key = Vec::with_capacity(2 + lower.len());
    key.extend_from_slice(&qtype);
    key.extend_from_slice(&lower);
    Some(key)
}

/// Smallest TTL among the answer records, `None` when there are none or
/// the packet does not parse.
pub fn min_answer_ttl(packet: &[u8]) -> Option<u32> {
    let mut header = [0u8; HEADER_LEN];
    let mut pos = packet_copy(packet, 0, &mut header)?;
    let qd_count = u16::from_be_bytes([header[4], header[5]]);
    let an_count = u16::from_be_bytes([header[6], header[7]]);

    for _ in 0..qd_count {
        let (_, next) = packet_getname(packet, pos)?;
        pos = next + 4;
    }

    let mut min_ttl: Option<u32> = None;
    for _ in 0..an_count {
        let (_, next) = packet_getname(packet, pos)?;
        let mut fixed = [0u8; 10];
        pos = packet_copy(packet, next, &mut fixed)?;
        // Type(2) Class(2) TTL(4) RDLen(2)
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
        let rd_len = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += rd_len;
        if pos > packet.len() {
            return None;
        }
    }
    min_ttl
}
