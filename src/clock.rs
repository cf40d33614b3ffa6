//! TAI64 timestamps and the clock abstraction used by the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2^62 + 10: TAI64 label of the UNIX epoch.
const TAI_UNIX_OFFSET: u64 = 4_611_686_018_427_387_914;

/// Whole seconds on the TAI64 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tai(u64);

impl Tai {
    pub fn from_unix(secs: u64) -> Self {
        Tai(TAI_UNIX_OFFSET.saturating_add(secs))
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        Self::from_unix(secs)
    }

    pub fn seconds(self) -> u64 {
        self.0
    }

    pub fn add_secs(self, secs: u64) -> Self {
        Tai(self.0.saturating_add(secs))
    }

    /// Seconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn secs_since(self, earlier: Tai) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Big-endian external format, 8 bytes.
    pub fn pack(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn unpack(b: [u8; 8]) -> Self {
        Tai(u64::from_be_bytes(b))
    }
}

/// Source of "now" for TTL accounting.
pub trait Clock {
    fn now(&self) -> Tai;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Tai {
        Tai::from_system_time(SystemTime::now())
    }
}

/// Hand-driven clock. Clones share the same time, so a test can keep one
/// copy and move the other into a cache.
#[derive(Debug, Clone)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Tai) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(start.seconds())),
        }
    }

    /// Starts at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs(), Ordering::Relaxed);
    }

    pub fn set(&self, t: Tai) {
        self.secs.store(t.seconds(), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tai {
        Tai(self.secs.load(Ordering::Relaxed))
    }
}
