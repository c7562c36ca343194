// modules/mining_engine/src/tests/worker_tests.rs
use super::stub_pool::{extranonce, job, LowNonceHasher};
use crate::pow::PowHasher;
use crate::submission::submission_queue;
use crate::worker::{WorkerConfig, WorkerPool};
use anyhow::{anyhow, Result};
use pool_stratum_connector::{EngineStats, JobBoard};
use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn board_with_job(job_id: &str) -> Arc<JobBoard> {
    let board = Arc::new(JobBoard::new());
    board.set_extranonce(extranonce());
    board.publish(job(job_id), true);
    board
}

#[tokio::test]
async fn test_workers_partition_nonce_space() -> Result<()> {
    let board = board_with_job("p1");
    let stats = Arc::new(EngineStats::new());
    let (tx, mut rx) = submission_queue(10_000);
    let token = CancellationToken::new();
    let config = WorkerConfig {
        threads: 4,
        intensity: 1.0,
        batch_size: 16,
    };
    let mut pool = WorkerPool::spawn(
        &config,
        Arc::clone(&board),
        Arc::new(LowNonceHasher { below: 400 }),
        tx,
        Arc::clone(&stats),
        token.clone(),
    )?;
    assert_eq!(pool.len(), 4);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seen = HashSet::new();
    while seen.len() < 400 {
        let candidate = tokio::time::timeout_at(deadline, rx.recv())
            .await?
            .ok_or_else(|| anyhow!("queue closed early"))?;
        assert_eq!(candidate.job_id, "p1");
        assert_eq!(candidate.extranonce2, vec![0, 0, 0, 0]);
        assert_eq!(candidate.ntime, vec![0x50, 0x4e, 0x86, 0xb9]);
        let key = (candidate.job_id.clone(), candidate.extranonce2.clone(), candidate.nonce);
        assert!(seen.insert(key), "nonce {} hashed twice", candidate.nonce);
    }

    token.cancel();
    let summary = pool.join_within(Duration::from_secs(2)).await;
    assert_eq!(summary.joined, 4);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.panicked, 0);

    let nonces: BTreeSet<u32> = seen.iter().map(|(_, _, nonce)| *nonce).collect();
    assert_eq!(nonces, (0..400).collect::<BTreeSet<u32>>());
    assert!(stats.shares_found() >= 400);
    assert!(stats.hashes_computed() >= 400);
    Ok(())
}

/// Blocks inside the very first hash until released, then finds a share on
/// every nonce.
struct GatedHasher {
    started: Mutex<Option<Sender<()>>>,
    gate: Mutex<Receiver<()>>,
}

impl PowHasher for GatedHasher {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn hash(&self, _header: &[u8], _nonce: u32) -> [u8; 32] {
        let first = self.started.lock().unwrap().take();
        if let Some(started) = first {
            let _ = started.send(());
            let _ = self.gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
        }
        thread::sleep(Duration::from_micros(50));
        [0u8; 32]
    }
}

#[tokio::test]
async fn test_stale_generation_emits_nothing() -> Result<()> {
    let board = board_with_job("old");
    let stats = Arc::new(EngineStats::new());
    let (tx, mut rx) = submission_queue(10_000);
    let token = CancellationToken::new();
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let hasher = GatedHasher {
        started: Mutex::new(Some(started_tx)),
        gate: Mutex::new(gate_rx),
    };
    let config = WorkerConfig {
        threads: 1,
        intensity: 1.0,
        batch_size: 8,
    };
    let mut pool = WorkerPool::spawn(&config, Arc::clone(&board), Arc::new(hasher), tx, stats, token.clone())?;

    // The worker is mid-batch on "old" when the clean job lands.
    started_rx.recv_timeout(Duration::from_secs(5))?;
    board.publish(job("new"), true);
    gate_tx.send(())?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let first = tokio::time::timeout_at(deadline, rx.recv())
        .await?
        .ok_or_else(|| anyhow!("queue closed early"))?;
    assert_eq!(first.job_id, "new");
    assert_eq!(first.nonce, 0, "cursor should restart for the new generation");

    token.cancel();
    pool.join_within(Duration::from_secs(2)).await;
    while let Some(candidate) = rx.try_recv() {
        assert_eq!(candidate.job_id, "new");
    }
    Ok(())
}

/// Finds a share on every nonce and parks the thread inside the hash of
/// `pause_at` until released.
struct PausingHasher {
    pause_at: u32,
    reached: Mutex<Option<Sender<()>>>,
    resume: Mutex<Receiver<()>>,
}

impl PowHasher for PausingHasher {
    fn name(&self) -> &'static str {
        "pausing"
    }

    fn hash(&self, _header: &[u8], nonce: u32) -> [u8; 32] {
        if nonce == self.pause_at {
            let reached = self.reached.lock().unwrap().take();
            if let Some(reached) = reached {
                let _ = reached.send(());
                let _ = self.resume.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }
        }
        [0u8; 32]
    }
}

#[tokio::test]
async fn test_updated_job_keeps_nonce_cursor() -> Result<()> {
    let board = board_with_job("a1");
    let (tx, mut rx) = submission_queue(10_000);
    let token = CancellationToken::new();
    let (reached_tx, reached_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let hasher = PausingHasher {
        pause_at: 15,
        reached: Mutex::new(Some(reached_tx)),
        resume: Mutex::new(resume_rx),
    };
    let config = WorkerConfig {
        threads: 1,
        intensity: 1.0,
        batch_size: 16,
    };
    let mut pool = WorkerPool::spawn(
        &config,
        Arc::clone(&board),
        Arc::new(hasher),
        tx,
        Arc::new(EngineStats::new()),
        token.clone(),
    )?;

    // Last hash of the first batch; the update lands before the next batch.
    reached_rx.recv_timeout(Duration::from_secs(5))?;
    let generation = board.generation();
    board.publish(job("a2"), false);
    assert_eq!(board.generation(), generation);
    resume_tx.send(())?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut candidates = Vec::new();
    while candidates.len() < 32 {
        let candidate = tokio::time::timeout_at(deadline, rx.recv())
            .await?
            .ok_or_else(|| anyhow!("queue closed early"))?;
        candidates.push(candidate);
    }
    token.cancel();
    pool.join_within(Duration::from_secs(2)).await;

    for (i, candidate) in candidates.iter().enumerate() {
        assert_eq!(candidate.nonce, i as u32, "cursor moved on the job update");
        assert_eq!(candidate.extranonce2, vec![0, 0, 0, 0]);
        let expected = if i < 16 { "a1" } else { "a2" };
        assert_eq!(candidate.job_id, expected, "nonce {}", candidate.nonce);
    }
    Ok(())
}

#[tokio::test]
async fn test_workers_idle_without_work() -> Result<()> {
    let board = Arc::new(JobBoard::new());
    let stats = Arc::new(EngineStats::new());
    let (tx, mut rx) = submission_queue(16);
    let token = CancellationToken::new();
    let config = WorkerConfig {
        threads: 3,
        ..WorkerConfig::default()
    };
    let mut pool = WorkerPool::spawn(&config, board, Arc::new(LowNonceHasher { below: u32::MAX }), tx, Arc::clone(&stats), token)?;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(stats.hashes_computed(), 0);
    assert!(rx.try_recv().is_none());

    let summary = pool.join_within(Duration::from_secs(1)).await;
    assert_eq!(summary.joined, 3);
    assert_eq!(summary.abandoned, 0);
    Ok(())
}

/// Takes `delay` per hash and never finds a share.
struct SlowHasher {
    delay: Duration,
}

impl PowHasher for SlowHasher {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn hash(&self, _header: &[u8], _nonce: u32) -> [u8; 32] {
        thread::sleep(self.delay);
        [0xFFu8; 32]
    }
}

#[tokio::test]
async fn test_join_window_abandons_busy_worker() -> Result<()> {
    let board = board_with_job("slow");
    let stats = Arc::new(EngineStats::new());
    let (tx, _rx) = submission_queue(16);
    let config = WorkerConfig {
        threads: 1,
        intensity: 1.0,
        batch_size: 1,
    };
    let hasher = Arc::new(SlowHasher {
        delay: Duration::from_millis(300),
    });
    let mut pool = WorkerPool::spawn(&config, board, hasher, tx, Arc::clone(&stats), CancellationToken::new())?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = pool.join_within(Duration::from_millis(10)).await;
    assert_eq!(summary.joined, 0);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(pool.abandon(), 1);
    Ok(())
}

#[tokio::test]
async fn test_throttled_worker_still_finds_shares() -> Result<()> {
    let board = board_with_job("t1");
    let stats = Arc::new(EngineStats::new());
    let (tx, mut rx) = submission_queue(10_000);
    let token = CancellationToken::new();
    let config = WorkerConfig {
        threads: 2,
        intensity: 0.25,
        batch_size: 4,
    };
    let mut pool = WorkerPool::spawn(
        &config,
        board,
        Arc::new(LowNonceHasher { below: 10 }),
        tx,
        Arc::clone(&stats),
        token.clone(),
    )?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut nonces = BTreeSet::new();
    while nonces.len() < 10 {
        let candidate = tokio::time::timeout_at(deadline, rx.recv())
            .await?
            .ok_or_else(|| anyhow!("queue closed early"))?;
        nonces.insert(candidate.nonce);
    }
    assert_eq!(nonces, (0..10).collect::<BTreeSet<u32>>());

    token.cancel();
    let summary = pool.join_within(Duration::from_secs(1)).await;
    assert_eq!(summary.joined, 2);
    Ok(())
}
