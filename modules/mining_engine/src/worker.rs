//! CPU worker threads.
//!
//! Worker `i` of `N` tests nonces `i, i + N, i + 2N, ...` for the current
//! `(job, extranonce2)`, so no two workers ever hash the same triple. When a
//! worker runs off the end of the `u32` nonce space it moves to the next
//! extranonce2 and starts over at `i`.
//!
//! Workers read the `JobBoard` through snapshots and hand hits to the
//! submission queue. They never touch the socket.

use crate::header::{extranonce2_bytes, header_prefix};
use crate::pow::PowHasher;
use crate::submission::SubmissionSender;
use anyhow::{Context, Result};
use pool_stratum_connector::{is_share, BoardSnapshot, EngineStats, JobBoard, ShareCandidate, Target};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Hashes between cancellation and generation checks.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

const DUTY_WINDOW: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_millis(20);
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub threads: usize,
    /// Fraction of each 100 ms window spent hashing, in `(0, 1]`.
    pub intensity: f64,
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            intensity: 1.0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Result of waiting for the workers to exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinSummary {
    pub joined: usize,
    pub abandoned: usize,
    pub panicked: usize,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<u64>>,
    token: CancellationToken,
    joined: usize,
    panicked: usize,
}

impl WorkerPool {
    /// Start `config.threads` workers. They run until `token` is cancelled.
    pub fn spawn(
        config: &WorkerConfig,
        board: Arc<JobBoard>,
        hasher: Arc<dyn PowHasher>,
        queue: SubmissionSender,
        stats: Arc<EngineStats>,
        token: CancellationToken,
    ) -> Result<Self> {
        let count = config.threads.max(1);
        let intensity = if config.intensity > 0.0 && config.intensity <= 1.0 {
            config.intensity
        } else {
            warn!(intensity = config.intensity, "Intensity outside (0, 1], using 1.0");
            1.0
        };
        // Cancelling the pool-local token never cancels the engine token.
        let token = token.child_token();
        info!(threads = count, intensity, algorithm = hasher.name(), "Starting mining workers");

        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let worker = Worker {
                index: index as u32,
                stride: count as u32,
                batch_size: config.batch_size.max(1),
                board: Arc::clone(&board),
                hasher: Arc::clone(&hasher),
                queue: queue.clone(),
                stats: Arc::clone(&stats),
                token: token.clone(),
                throttle: Throttle::new(intensity),
            };
            let spawned = thread::Builder::new()
                .name(format!("miner-worker-{}", index))
                .spawn(move || worker.run())
                .with_context(|| format!("Failed to spawn mining worker {}", index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    token.cancel();
                    return Err(e);
                }
            }
        }

        Ok(Self {
            handles,
            token,
            joined: 0,
            panicked: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len() + self.joined
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell the workers to stop after their current batch.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait up to `window` for every worker to exit. Safe to drop part-way;
    /// workers already joined stay joined.
    pub async fn join_within(&mut self, window: Duration) -> JoinSummary {
        self.cancel();
        let deadline = Instant::now() + window;
        loop {
            let mut index = 0;
            while index < self.handles.len() {
                if self.handles[index].is_finished() {
                    let handle = self.handles.swap_remove(index);
                    match handle.join() {
                        Ok(hashes) => trace!(hashes, "Worker joined"),
                        Err(_) => {
                            self.panicked += 1;
                            warn!("A mining worker panicked");
                        }
                    }
                    self.joined += 1;
                } else {
                    index += 1;
                }
            }
            if self.handles.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        JoinSummary {
            joined: self.joined,
            abandoned: self.handles.len(),
            panicked: self.panicked,
        }
    }

    /// Detach every worker that has not exited. They still see the cancelled
    /// token and stop on their own. Returns how many were left running.
    pub fn abandon(&mut self) -> usize {
        self.cancel();
        let left = self.handles.iter().filter(|h| !h.is_finished()).count();
        if left > 0 {
            warn!(workers = left, "Abandoning mining workers that have not exited");
        }
        self.handles.clear();
        left
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Duty-cycle limiter: after hashing for `intensity * window`, sleep out the
/// rest of the window.
#[derive(Debug)]
struct Throttle {
    intensity: f64,
    window_start: Instant,
    busy: Duration,
}

impl Throttle {
    fn new(intensity: f64) -> Self {
        Self {
            intensity,
            window_start: Instant::now(),
            busy: Duration::ZERO,
        }
    }

    /// `Some(pause)` once the window's hashing budget is spent; the caller
    /// sleeps for `pause` and then calls `restart`.
    fn after_batch(&mut self, spent: Duration) -> Option<Duration> {
        if self.intensity >= 1.0 {
            return None;
        }
        self.busy += spent;
        if self.busy < DUTY_WINDOW.mul_f64(self.intensity) {
            return None;
        }
        let window = self.busy.div_f64(self.intensity);
        Some(window.saturating_sub(self.window_start.elapsed()))
    }

    fn restart(&mut self) {
        self.window_start = Instant::now();
        self.busy = Duration::ZERO;
    }
}

/// The work a worker is currently grinding.
struct Work {
    snapshot: BoardSnapshot,
    extranonce2_counter: u64,
    extranonce2: Vec<u8>,
    header: Vec<u8>,
    nonce: u32,
}

struct Worker {
    index: u32,
    stride: u32,
    batch_size: u32,
    board: Arc<JobBoard>,
    hasher: Arc<dyn PowHasher>,
    queue: SubmissionSender,
    stats: Arc<EngineStats>,
    token: CancellationToken,
    throttle: Throttle,
}

impl Worker {
    fn run(mut self) -> u64 {
        debug!(worker = self.index, "Worker started");
        let mut total = 0u64;
        let mut work: Option<Work> = None;

        while !self.token.is_cancelled() {
            let Some(snapshot) = self.board.snapshot() else {
                work = None;
                self.sleep(IDLE_POLL);
                continue;
            };
            let refreshed = self.refresh(work.take(), snapshot);
            let current = work.insert(refreshed);

            let started = Instant::now();
            let hashes = self.grind(current);
            total += hashes;
            self.stats.add_hashes(hashes);

            if let Some(pause) = self.throttle.after_batch(started.elapsed()) {
                self.sleep(pause);
                self.throttle.restart();
            }
        }
        debug!(worker = self.index, hashes = total, "Worker stopped");
        total
    }

    /// Reconcile cached work with a fresh snapshot. A new generation resets
    /// the cursor; a new job in the same generation keeps it.
    fn refresh(&self, previous: Option<Work>, snapshot: BoardSnapshot) -> Work {
        match previous {
            Some(mut work) if work.snapshot.generation == snapshot.generation => {
                if !Arc::ptr_eq(&work.snapshot.job, &snapshot.job) {
                    trace!(worker = self.index, job_id = %snapshot.job.job_id, "Adopting updated job");
                    work.header = header_prefix(&snapshot.job, &snapshot.extranonce, &work.extranonce2);
                }
                work.snapshot = snapshot;
                work
            }
            _ => {
                trace!(
                    worker = self.index,
                    job_id = %snapshot.job.job_id,
                    generation = snapshot.generation,
                    "New generation, resetting nonce cursor"
                );
                let extranonce2 = extranonce2_bytes(0, snapshot.extranonce.extranonce2_size);
                let header = header_prefix(&snapshot.job, &snapshot.extranonce, &extranonce2);
                Work {
                    snapshot,
                    extranonce2_counter: 0,
                    extranonce2,
                    header,
                    nonce: self.index,
                }
            }
        }
    }

    /// One batch. Candidates are only emitted if the generation is unchanged
    /// once the batch is done.
    fn grind(&self, work: &mut Work) -> u64 {
        let target: Target = work.snapshot.target;
        let mut hits: Vec<(u32, [u8; 32])> = Vec::new();
        let mut hashes = 0u64;
        let mut exhausted = false;

        for _ in 0..self.batch_size {
            let digest = self.hasher.hash(&work.header, work.nonce);
            hashes += 1;
            if is_share(&digest, &target) {
                hits.push((work.nonce, digest));
            }
            match work.nonce.checked_add(self.stride) {
                Some(next) => work.nonce = next,
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if !hits.is_empty() {
            if self.board.generation() != work.snapshot.generation {
                debug!(worker = self.index, dropped = hits.len(), "Discarding hits for a stale generation");
            } else {
                for (nonce, digest) in hits {
                    self.stats.record_found();
                    let candidate = ShareCandidate {
                        job_id: work.snapshot.job.job_id.clone(),
                        nonce,
                        extranonce2: work.extranonce2.clone(),
                        ntime: work.snapshot.job.time.clone(),
                        digest,
                    };
                    debug!(
                        worker = self.index,
                        job_id = %candidate.job_id,
                        nonce = %format!("{:08x}", nonce),
                        digest = %hex::encode(digest),
                        "Share candidate found"
                    );
                    if !self.queue.push(candidate) {
                        debug!(worker = self.index, "Submission queue closed, dropping candidate");
                    }
                }
            }
        }

        if exhausted {
            work.extranonce2_counter += 1;
            work.extranonce2 = extranonce2_bytes(work.extranonce2_counter, work.snapshot.extranonce.extranonce2_size);
            work.header = header_prefix(&work.snapshot.job, &work.snapshot.extranonce, &work.extranonce2);
            work.nonce = self.index;
            debug!(
                worker = self.index,
                extranonce2 = %hex::encode(&work.extranonce2),
                "Nonce space exhausted, advancing extranonce2"
            );
        }
        hashes
    }

    /// Sleep in short slices so cancellation is seen promptly.
    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
