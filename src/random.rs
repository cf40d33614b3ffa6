//! Randomness for transaction ids, source ports and the cache hash key.
//!
//! One generator is seeded per process from the OS entropy source, with
//! process identity, the high-resolution clock and caller-supplied bytes
//! folded in, then passed by reference to whoever needs numbers.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::warn;

pub struct DnsRandom {
    rng: ChaCha20Rng,
}

impl DnsRandom {
    /// Seed from the system CSPRNG mixed with `entropy` and process state.
    pub fn new(entropy: &[u8]) -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = OsRng.try_fill_bytes(&mut seed) {
            warn!(target = "random", error = %err, "os entropy unavailable, seeding from process state only");
        }

        let mut material = Vec::with_capacity(64 + entropy.len());
        material.extend_from_slice(&std::process::id().to_le_bytes());
        #[cfg(unix)]
        {
            // SAFETY: these calls take no arguments and cannot fail.
            let (ppid, uid, gid) = unsafe { (libc::getppid(), libc::getuid(), libc::getgid()) };
            material.extend_from_slice(&ppid.to_le_bytes());
            material.extend_from_slice(&uid.to_le_bytes());
            material.extend_from_slice(&gid.to_le_bytes());
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        material.extend_from_slice(&nanos.to_le_bytes());
        material.extend_from_slice(entropy);

        for (i, b) in material.iter().enumerate() {
            seed[i % seed.len()] ^= b.rotate_left((i / seed.len()) as u32);
        }
        Self::from_seed(seed)
    }

    /// Deterministic generator, for tests and reproducible simulations.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    /// Uniform in `0..n`; 0 when `n == 0`.
    pub fn below(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        self.rng.gen_range(0..n)
    }

    pub fn id(&mut self) -> u16 {
        self.rng.r#gen()
    }

    pub fn key128(&mut self) -> [u8; 16] {
        let mut key = [0u8; 16];
        self.rng.fill_bytes(&mut key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_respects_bound() {
        let mut r = DnsRandom::from_seed([7; 32]);
        assert_eq!(r.below(0), 0);
        for _ in 0..1000 {
            assert!(r.below(64510) < 64510);
        }
    }

    #[test]
    fn seeded_generators_differ() {
        let mut a = DnsRandom::new(b"one");
        let mut b = DnsRandom::new(b"two");
        assert_ne!(a.key128(), b.key128());
    }

    #[test]
    fn ids_cover_both_bytes() {
        let mut r = DnsRandom::from_seed([1; 32]);
        let ids: Vec<u16> = (0..256).map(|_| r.id()).collect();
        assert!(ids.iter().any(|id| id >> 8 != 0));
        assert!(ids.iter().any(|id| id & 0xff != 0));
    }
}
