//! Engine counters.
//!
//! The engine owns one `EngineStats`; workers and the receive loop only ever
//! increment it through atomics. Hashrate is not stored, it is derived from
//! two samples of `hashes_computed`.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct EngineStats {
    hashes_computed: AtomicU64,
    shares_found: AtomicU64,
    shares_submitted: AtomicU64,
    shares_accepted: AtomicU64,
    shares_rejected: AtomicU64,
    shares_unconfirmed: AtomicU64,
    started: Instant,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            hashes_computed: AtomicU64::new(0),
            shares_found: AtomicU64::new(0),
            shares_submitted: AtomicU64::new(0),
            shares_accepted: AtomicU64::new(0),
            shares_rejected: AtomicU64::new(0),
            shares_unconfirmed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn add_hashes(&self, count: u64) {
        self.hashes_computed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_found(&self) {
        self.shares_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        self.shares_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Pool verdict on a submitted share.
    pub fn record_result(&self, accepted: bool) {
        if accepted {
            self.shares_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shares_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A share that was dropped before the pool confirmed or rejected it.
    pub fn record_unconfirmed(&self) {
        self.shares_unconfirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hashes_computed(&self) -> u64 {
        self.hashes_computed.load(Ordering::Relaxed)
    }

    pub fn shares_found(&self) -> u64 {
        self.shares_found.load(Ordering::Relaxed)
    }

    pub fn shares_accepted(&self) -> u64 {
        self.shares_accepted.load(Ordering::Relaxed)
    }

    pub fn shares_rejected(&self) -> u64 {
        self.shares_rejected.load(Ordering::Relaxed)
    }

    pub fn shares_unconfirmed(&self) -> u64 {
        self.shares_unconfirmed.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, hashrate: f64) -> StatsSnapshot {
        StatsSnapshot {
            hashrate,
            hashes_computed: self.hashes_computed(),
            shares_found: self.shares_found(),
            shares_submitted: self.shares_submitted.load(Ordering::Relaxed),
            shares_accepted: self.shares_accepted(),
            shares_rejected: self.shares_rejected(),
            shares_unconfirmed: self.shares_unconfirmed(),
            uptime: self.uptime(),
        }
    }
}

/// Point-in-time copy of the counters handed to the stats sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Hashes per second since the previous snapshot.
    pub hashrate: f64,
    pub hashes_computed: u64,
    pub shares_found: u64,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_unconfirmed: u64,
    pub uptime: Duration,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} H/s, {} hashes, shares found/accepted/rejected/unconfirmed {}/{}/{}/{}, uptime {}s",
            self.hashrate,
            self.hashes_computed,
            self.shares_found,
            self.shares_accepted,
            self.shares_rejected,
            self.shares_unconfirmed,
            self.uptime.as_secs()
        )
    }
}

/// Derives hashrate as `Δhashes / Δtime` between successive samples.
#[derive(Debug)]
pub struct HashrateMeter {
    last_hashes: u64,
    last_at: Instant,
}

impl HashrateMeter {
    pub fn new(hashes_now: u64, now: Instant) -> Self {
        Self {
            last_hashes: hashes_now,
            last_at: now,
        }
    }

    pub fn sample(&mut self, hashes_now: u64, now: Instant) -> f64 {
        let delta_hashes = hashes_now.saturating_sub(self.last_hashes);
        let secs = now.saturating_duration_since(self.last_at).as_secs_f64();
        self.last_hashes = hashes_now;
        self.last_at = now;
        if secs > 0.0 {
            delta_hashes as f64 / secs
        } else {
            0.0
        }
    }
}
