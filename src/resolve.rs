//! Async driver that runs one transmission to completion on tokio.
//!
//! The engine stays poll-based; this loop only waits for the descriptor it
//! names (or its deadline) and feeds the outcome back.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::Interest as Readiness;
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::random::DnsRandom;
use crate::transmit::{Interest, IoRequest, Progress, Transmit, TransmitError};

/// Upper bound on a single wait, whatever the engine's own deadline.
const ITERATION_CAP: Duration = Duration::from_secs(120);

/// Descriptor owned by the transmission; registering it must not close it.
struct Borrowed(RawFd);

impl AsRawFd for Borrowed {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Drive a started transmission until it yields a reply or gives up.
pub async fn resolve(tx: &mut Transmit, rng: &mut DnsRandom) -> Result<Bytes, TransmitError> {
    loop {
        let mut deadline = Instant::now() + ITERATION_CAP;
        let ready = match tx.io(&mut deadline) {
            Some(request) => wait_ready(request, deadline).await?,
            None => false,
        };
        match tx.get(ready, Instant::now(), rng)? {
            Progress::Pending => continue,
            Progress::Done => return tx.packet().cloned().ok_or(TransmitError::NoQuery),
        }
    }
}

async fn wait_ready(request: IoRequest, deadline: Instant) -> io::Result<bool> {
    let interest = match request.interest {
        Interest::Read => Readiness::READABLE,
        Interest::Write => Readiness::WRITABLE,
    };
    let fd = AsyncFd::try_with_interest(Borrowed(request.fd), interest)
        .map_err(io::Error::from)?;
    tokio::select! {
        guard = fd.ready(interest) => {
            let mut guard = guard?;
            guard.clear_ready();
            Ok(true)
        }
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            trace!(target = "resolve", fd = request.fd, "wait hit deadline");
            Ok(false)
        }
    }
}
