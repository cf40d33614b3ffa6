//! Fixed-size arena cache with circular oldest-first eviction.
//!
//! Layout of `arena` (all offsets are `u32` little-endian when stored):
//!
//! ```text
//! [0, hsize)          hsize/4 bucket head links
//! [hsize, writer)     entries, newest on the right
//! [writer, oldest)    free space
//! [oldest, unused)    entries, oldest on the left
//! [unused, size)      dead space left behind by the last wrap
//! ```
//!
//! with `hsize <= writer <= oldest <= unused <= size`, and
//! `oldest == unused` only when `unused == size`.
//!
//! Each bucket is a list: head link, newest entry, next newest, ... Every
//! link holds the xor of the positions of its two neighbours (0 past the
//! tail), so walking needs the previous position as well as the current
//! one. New entries go right after the head; eviction takes the tail.
//!
//! Entry: 4-byte link, 4-byte keylen, 4-byte datalen, 8-byte expiry, key, data.

use std::collections::TryReserveError;
use std::hash::Hasher;

use siphasher::sip::SipHasher24;
use thiserror::Error;
use tracing::{debug, error};

use crate::clock::{Clock, SystemClock, Tai};
use crate::random::DnsRandom;

pub const MAX_KEY_LEN: usize = 1000;
pub const MAX_DATA_LEN: usize = 1_000_000;
/// Seven days.
pub const MAX_TTL: u32 = 604_800;

pub const MIN_SIZE: usize = 100;
pub const MAX_SIZE: usize = 1_000_000_000;

const ENTRY_HEADER: usize = 20;
// hash flooding guard
const MAX_CHAIN: usize = 100;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot allocate cache arena: {0}")]
    Alloc(#[from] TryReserveError),
}

/// A hit borrowed from the arena; the borrow ends before the next `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHit<'a> {
    pub data: &'a [u8],
    /// Remaining lifetime in seconds, at most [`MAX_TTL`].
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hsize: usize,
    /// Bytes between the cursors that hold entries, live or garbage.
    pub used: usize,
    /// Total bytes ever written.
    pub motion: u64,
}

pub struct Cache<C: Clock = SystemClock> {
    arena: Vec<u8>,
    size: usize,
    hsize: usize,
    writer: usize,
    oldest: usize,
    unused: usize,
    sip_key: [u8; 16],
    motion: u64,
    clock: C,
}

impl Cache<SystemClock> {
    /// Arena of `capacity` bytes (clamped to `[MIN_SIZE, MAX_SIZE]`) with a
    /// fresh hash key drawn from `rng`.
    pub fn new(capacity: usize, rng: &mut DnsRandom) -> Result<Self, CacheError> {
        Self::with_clock(capacity, rng.key128(), SystemClock)
    }
}

impl<C: Clock> Cache<C> {
    pub fn with_clock(capacity: usize, sip_key: [u8; 16], clock: C) -> Result<Self, CacheError> {
        let mut cache = Self {
            arena: Vec::new(),
            size: 0,
            hsize: 0,
            writer: 0,
            oldest: 0,
            unused: 0,
            sip_key,
            motion: 0,
            clock,
        };
        cache.layout(capacity)?;
        Ok(cache)
    }

    /// Drop every entry and start over with a new size and hash key.
    /// `motion` keeps counting across re-initialization.
    pub fn reinit(&mut self, capacity: usize, rng: &mut DnsRandom) -> Result<(), CacheError> {
        self.sip_key = rng.key128();
        self.layout(capacity)
    }

    fn layout(&mut self, capacity: usize) -> Result<(), CacheError> {
        let size = capacity.clamp(MIN_SIZE, MAX_SIZE);
        let mut hsize = 4;
        while hsize <= size >> 5 {
            hsize <<= 1;
        }

        let mut arena = Vec::new();
        arena.try_reserve_exact(size)?;
        arena.resize(size, 0);

        self.arena = arena;
        self.size = size;
        self.hsize = hsize;
        self.writer = hsize;
        self.oldest = size;
        self.unused = size;
        debug!(target = "cache", size, hsize, "cache initialized");
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<CacheHit<'_>> {
        if key.len() > MAX_KEY_LEN {
            return None;
        }

        let mut prev = self.bucket(key);
        let mut pos = self.get4(prev) as usize;
        let mut hops = 0;

        while pos != 0 {
            if self.get4(pos + 4) as usize == key.len() {
                let key_end = pos + ENTRY_HEADER + key.len();
                if key_end > self.size {
                    impossible("key runs past arena", pos);
                }
                if &self.arena[pos + ENTRY_HEADER..key_end] == key {
                    let expire = Tai::unpack(self.get8(pos + 12));
                    let now = self.clock.now();
                    if expire < now {
                        return None;
                    }
                    let ttl = expire.secs_since(now).min(MAX_TTL as u64) as u32;

                    let data_len = self.get4(pos + 8) as usize;
                    if data_len > self.size - key_end {
                        impossible("data runs past arena", pos);
                    }
                    return Some(CacheHit {
                        data: &self.arena[key_end..key_end + data_len],
                        ttl,
                    });
                }
            }
            let next = prev ^ self.get4(pos) as usize;
            prev = pos;
            pos = next;
            hops += 1;
            if hops > MAX_CHAIN {
                return None;
            }
        }
        None
    }

    /// Store `data` under `key` for `ttl` seconds. Oversized input and a
    /// zero ttl are ignored, as is an entry that cannot fit even in an
    /// empty arena.
    pub fn set(&mut self, key: &[u8], data: &[u8], ttl: u32) {
        if key.len() > MAX_KEY_LEN || data.len() > MAX_DATA_LEN || ttl == 0 {
            return;
        }
        let ttl = ttl.min(MAX_TTL);
        let entry_len = key.len() + data.len() + ENTRY_HEADER;

        while self.writer + entry_len > self.oldest {
            if self.oldest == self.unused {
                if self.writer <= self.hsize {
                    return;
                }
                self.unused = self.writer;
                self.oldest = self.hsize;
                self.writer = self.hsize;
            }
            self.evict_oldest();
        }

        let head = self.bucket(key);
        let expire = self.clock.now().add_secs(ttl as u64);

        let first = self.get4(head) as usize;
        if first != 0 {
            let link = self.get4(first) as usize ^ head ^ self.writer;
            self.set4(first, link as u32);
        }

        let w = self.writer;
        self.set4(w, (first ^ head) as u32);
        self.set4(w + 4, key.len() as u32);
        self.set4(w + 8, data.len() as u32);
        self.arena[w + 12..w + 20].copy_from_slice(&expire.pack());
        self.arena[w + 20..w + 20 + key.len()].copy_from_slice(key);
        self.arena[w + 20 + key.len()..w + entry_len].copy_from_slice(data);

        self.set4(head, w as u32);
        self.writer += entry_len;
        self.motion += entry_len as u64;
    }

    fn evict_oldest(&mut self) {
        let oldest = self.oldest;
        // the tail's link is just its predecessor's position
        let prev = self.get4(oldest) as usize;
        let link = self.get4(prev) as usize ^ oldest;
        self.set4(prev, link as u32);

        let len = self.get4(oldest + 4) as usize + self.get4(oldest + 8) as usize + ENTRY_HEADER;
        self.oldest += len;
        if self.oldest > self.unused {
            impossible("eviction ran past unused", self.oldest);
        }
        if self.oldest == self.unused {
            self.unused = self.size;
            self.oldest = self.size;
        }
    }

    /// Cumulative bytes written by `set`.
    pub fn motion(&self) -> u64 {
        self.motion
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size,
            hsize: self.hsize,
            used: (self.writer - self.hsize) + (self.unused - self.oldest),
            motion: self.motion,
        }
    }

    fn bucket(&self, key: &[u8]) -> usize {
        let mut h = SipHasher24::new_with_key(&self.sip_key);
        h.write(key);
        (h.finish() as u32 as usize) & (self.hsize - 4)
    }

    #[inline]
    fn get4(&self, pos: usize) -> u32 {
        if pos > self.size - 4 {
            impossible("read past arena", pos);
        }
        let b = &self.arena[pos..pos + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    fn set4(&mut self, pos: usize, v: u32) {
        if pos > self.size - 4 {
            impossible("write past arena", pos);
        }
        self.arena[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn get8(&self, pos: usize) -> [u8; 8] {
        if pos > self.size - 8 {
            impossible("read past arena", pos);
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.arena[pos..pos + 8]);
        b
    }
}

/// Offset arithmetic went out of range: the arena can no longer be trusted.
#[cold]
fn impossible(what: &'static str, pos: usize) -> ! {
    error!(target = "cache", what, pos, "cache arena corrupted, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::time::Duration;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn cache(capacity: usize) -> (Cache<ManualClock>, ManualClock) {
        let clock = ManualClock::new(Tai::from_unix(1_700_000_000));
        let cache = Cache::with_clock(capacity, KEY, clock.clone()).expect("alloc");
        (cache, clock)
    }

    impl<C: Clock> Cache<C> {
        fn assert_cursors(&self) {
            assert!(self.hsize <= self.writer);
            assert!(self.writer <= self.oldest);
            assert!(self.oldest <= self.unused);
            assert!(self.unused <= self.size);
            if self.oldest == self.unused {
                assert_eq!(self.unused, self.size);
            }
        }
    }

    #[test]
    fn init_clamps_size_and_sizes_buckets() {
        let (c, _) = cache(10);
        assert_eq!(c.stats().size, MIN_SIZE);
        assert_eq!(c.stats().hsize, 4);

        let (c, _) = cache(1_000_000);
        let s = c.stats();
        assert!(s.hsize.is_power_of_two());
        assert!(s.hsize > s.size >> 5);
        assert!(s.hsize / 2 <= s.size >> 5);
    }

    #[test]
    fn small_cache_expires_after_ttl() {
        let (mut c, clock) = cache(100);
        c.set(b"a", b"1", 5);
        c.set(b"b", b"2", 5);

        let a = c.get(b"a").expect("a cached");
        assert_eq!(a.data, b"1");
        assert_eq!(a.ttl, 5);
        assert_eq!(c.get(b"b").expect("b cached").data, b"2");

        clock.advance(Duration::from_secs(6));
        assert!(c.get(b"a").is_none());
        assert!(c.get(b"b").is_none());
    }

    #[test]
    fn ttl_counts_down_and_is_clamped() {
        let (mut c, clock) = cache(10_000);
        c.set(b"week", b"x", u32::MAX);
        assert_eq!(c.get(b"week").unwrap().ttl, MAX_TTL);
        clock.advance(Duration::from_secs(100));
        assert_eq!(c.get(b"week").unwrap().ttl, MAX_TTL - 100);
    }

    #[test]
    fn rejects_bad_input() {
        let (mut c, _) = cache(3_000_000);
        c.set(b"zero", b"x", 0);
        assert!(c.get(b"zero").is_none());

        let long_key = vec![b'k'; MAX_KEY_LEN + 1];
        c.set(&long_key, b"x", 10);
        assert!(c.get(&long_key).is_none());

        let big = vec![0u8; MAX_DATA_LEN + 1];
        c.set(b"big", &big, 10);
        assert!(c.get(b"big").is_none());
        assert_eq!(c.motion(), 0);
    }

    #[test]
    fn entry_larger_than_arena_is_a_noop() {
        let (mut c, _) = cache(100);
        c.set(b"keep", b"me", 60);
        c.set(b"huge", &[7u8; 200], 60);
        assert!(c.get(b"huge").is_none());
        c.assert_cursors();
    }

    #[test]
    fn overwrite_returns_newest_value() {
        let (mut c, _) = cache(10_000);
        c.set(b"k", b"old", 60);
        c.set(b"k", b"new", 60);
        assert_eq!(c.get(b"k").unwrap().data, b"new");
        assert_eq!(c.motion(), 2 * (1 + 3 + 20));
    }

    #[test]
    fn get_walks_whole_chain() {
        // hsize 4 leaves a single bucket, so every entry shares one chain
        let (mut c, _) = cache(100);
        c.set(b"a", b"1", 60);
        c.set(b"b", b"2", 60);
        c.set(b"c", b"3", 60);
        assert_eq!(c.get(b"c").expect("head").data, b"3");
        assert_eq!(c.get(b"b").expect("middle").data, b"2");
        assert_eq!(c.get(b"a").expect("tail").data, b"1");
        assert!(c.get(b"d").is_none());
    }

    #[test]
    fn evicts_oldest_first() {
        let (mut c, _) = cache(100);
        // hsize 4, 96 bytes of entries; each entry below is 40 bytes
        c.set(b"one", &[1u8; 17], 60);
        c.set(b"two", &[2u8; 17], 60);
        c.set(b"thr", &[3u8; 17], 60);
        assert!(c.get(b"one").is_none());
        assert_eq!(c.get(b"two").unwrap().data, &[2u8; 17]);
        assert_eq!(c.get(b"thr").unwrap().data, &[3u8; 17]);
        c.assert_cursors();

        c.set(b"fou", &[4u8; 17], 60);
        assert!(c.get(b"two").is_none());
        assert_eq!(c.get(b"thr").unwrap().data, &[3u8; 17]);
        assert_eq!(c.get(b"fou").unwrap().data, &[4u8; 17]);
        c.assert_cursors();
    }

    #[test]
    fn long_chains_stop_after_limit() {
        let (mut c, _) = cache(100_000);
        let target = c.bucket(b"k0");
        let keys: Vec<Vec<u8>> = (0u32..)
            .map(|i| format!("k{i}").into_bytes())
            .filter(|k| c.bucket(k) == target)
            .take(105)
            .collect();
        for (i, k) in keys.iter().enumerate() {
            c.set(k, &(i as u32).to_le_bytes(), 600);
        }

        // newest sits at chain depth 0, keys[i] at depth 104 - i
        assert!(c.get(&keys[104]).is_some());
        assert!(c.get(&keys[4]).is_some());
        assert!(c.get(&keys[3]).is_none());
        assert!(c.get(&keys[0]).is_none());
    }

    #[test]
    fn reinit_discards_entries() {
        let (mut c, _) = cache(1_000);
        c.set(b"k", b"v", 60);
        let mut rng = DnsRandom::from_seed([3; 32]);
        c.reinit(2_000, &mut rng).unwrap();
        assert!(c.get(b"k").is_none());
        assert_eq!(c.stats().size, 2_000);
    }

    proptest! {
        #[test]
        fn live_entries_survive_interleaved_eviction(
            ops in prop::collection::vec((0u8..24, prop::collection::vec(any::<u8>(), 0..60)), 1..400)
        ) {
            let (mut c, _) = cache(1_500);
            // latest value per key, in insertion order
            let mut order: Vec<(u8, Vec<u8>)> = Vec::new();

            for (k, v) in ops {
                let key = [b'k', k];
                c.set(&key, &v, 3_600);
                order.retain(|(ok, _)| *ok != k);
                order.push((k, v.clone()));

                c.assert_cursors();
                let s = c.stats();
                prop_assert!(s.used + s.hsize <= s.size);
                prop_assert_eq!(c.get(&key).map(|h| h.data.to_vec()), Some(v));

                // survivors are a suffix of insertion order and hold their own bytes
                let mut evicted_seen = false;
                for (ok, ov) in order.iter().rev() {
                    match c.get(&[b'k', *ok]) {
                        Some(hit) => {
                            prop_assert!(!evicted_seen, "newer entry evicted before older one");
                            prop_assert_eq!(hit.data, ov.as_slice());
                        }
                        None => evicted_seen = true,
                    }
                }
            }
        }
    }
}
