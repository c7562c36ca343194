//! Current work, published by the pool connection and read by workers.
//!
//! Writers (the receive loop) build a new immutable state and swap it in;
//! readers (worker threads) load the current `Arc` without taking a lock, so
//! a snapshot never blocks a writer. Job, target and generation always come
//! from the same state, never mixed across updates.

use crate::target::{Difficulty, Target};
use crate::types::{Extranonce, Job};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Consistent view of the board at one instant.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub job: Arc<Job>,
    pub extranonce: Arc<Extranonce>,
    pub difficulty: Difficulty,
    pub target: Target,
    /// Bumped whenever outstanding work becomes invalid.
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct BoardState {
    job: Option<Arc<Job>>,
    extranonce: Option<Arc<Extranonce>>,
    difficulty: Difficulty,
    target: Target,
    generation: u64,
}

pub struct JobBoard {
    state: ArcSwap<BoardState>,
    /// Mirror of `state.generation` for cheap epoch checks in hot loops.
    generation: AtomicU64,
    /// Serializes writers; readers never touch it.
    write_lock: Mutex<()>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBoard {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(BoardState {
                job: None,
                extranonce: None,
                difficulty: Difficulty::ONE,
                target: Difficulty::ONE.to_target(),
                generation: 0,
            }),
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut BoardState)) -> u64 {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = BoardState::clone(&self.state.load());
        f(&mut next);
        let generation = next.generation;
        self.state.store(Arc::new(next));
        self.generation.store(generation, Ordering::Release);
        generation
    }

    /// Replace the current job. With `clean_jobs` the generation advances and
    /// workers abandon whatever they were searching. Returns the generation.
    pub fn publish(&self, job: Job, clean_jobs: bool) -> u64 {
        let job_id = job.job_id.clone();
        let generation = self.update(|state| {
            state.job = Some(Arc::new(job));
            if clean_jobs {
                state.generation += 1;
            }
        });
        debug!(job_id = %job_id, clean_jobs, generation, "Job published");
        generation
    }

    /// Replace difficulty and target together. Does not invalidate work.
    pub fn set_difficulty(&self, difficulty: Difficulty) {
        let target = difficulty.to_target();
        self.update(|state| {
            state.difficulty = difficulty;
            state.target = target;
        });
        info!(difficulty = %difficulty, target = %target, "Pool difficulty updated");
    }

    /// Install the pool-assigned extranonce. The nonce space changes, so the
    /// generation advances.
    pub fn set_extranonce(&self, extranonce: Extranonce) -> u64 {
        self.update(|state| {
            state.extranonce = Some(Arc::new(extranonce));
            state.generation += 1;
        })
    }

    /// Drop the current job so workers idle until fresh work arrives.
    pub fn suspend(&self) -> u64 {
        let generation = self.update(|state| {
            state.job = None;
            state.generation += 1;
        });
        debug!(generation, "Job board suspended");
        generation
    }

    /// `None` until both a job and an extranonce are known.
    pub fn snapshot(&self) -> Option<BoardSnapshot> {
        let state = self.state.load();
        Some(BoardSnapshot {
            job: state.job.clone()?,
            extranonce: state.extranonce.clone()?,
            difficulty: state.difficulty,
            target: state.target,
            generation: state.generation,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn difficulty(&self) -> Difficulty {
        self.state.load().difficulty
    }

    pub fn current_job_id(&self) -> Option<String> {
        self.state.load().job.as_ref().map(|job| job.job_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, clean: bool) -> Job {
        Job {
            job_id: id.to_string(),
            previous_block_hash: vec![0u8; 32],
            coinbase_part1: vec![1, 2, 3],
            coinbase_part2: vec![4, 5, 6],
            merkle_branches: vec![],
            version: vec![0x20, 0, 0, 0],
            bits: vec![0x1d, 0x00, 0xff, 0xff],
            time: vec![0x5a, 0x5a, 0x5a, 0x5a],
            clean_jobs: clean,
        }
    }

    fn extranonce() -> Extranonce {
        Extranonce {
            extranonce1: vec![0xf8, 0x00, 0x2c, 0x90],
            extranonce2_size: 4,
        }
    }

    #[test]
    fn test_snapshot_requires_job_and_extranonce() {
        let board = JobBoard::new();
        assert!(board.snapshot().is_none());
        board.publish(job("a", true), true);
        assert!(board.snapshot().is_none());
        board.set_extranonce(extranonce());
        let snap = board.snapshot().unwrap();
        assert_eq!(snap.job.job_id, "a");
        assert_eq!(snap.difficulty, Difficulty::ONE);
    }

    #[test]
    fn test_clean_jobs_strictly_increase_generation() {
        let board = JobBoard::new();
        board.set_extranonce(extranonce());
        let mut last = board.generation();
        for i in 0..5 {
            let generation = board.publish(job(&i.to_string(), true), true);
            assert!(generation > last);
            assert_eq!(board.generation(), generation);
            last = generation;
        }
    }

    #[test]
    fn test_non_clean_job_keeps_generation() {
        let board = JobBoard::new();
        board.set_extranonce(extranonce());
        let generation = board.publish(job("a", true), true);
        assert_eq!(board.publish(job("b", false), false), generation);
        let snap = board.snapshot().unwrap();
        assert_eq!(snap.job.job_id, "b");
        assert_eq!(snap.generation, generation);
    }

    #[test]
    fn test_difficulty_and_target_move_together() {
        let board = JobBoard::new();
        board.set_extranonce(extranonce());
        board.publish(job("a", true), true);
        let before = board.snapshot().unwrap();

        let diff = Difficulty::new(5000.0).unwrap();
        board.set_difficulty(diff);
        let after = board.snapshot().unwrap();
        assert_eq!(after.difficulty, diff);
        assert_eq!(after.target, diff.to_target());
        assert_eq!(after.generation, before.generation);
        // The earlier snapshot is unaffected.
        assert_eq!(before.target, Difficulty::ONE.to_target());
    }

    #[test]
    fn test_suspend_clears_job() {
        let board = JobBoard::new();
        board.set_extranonce(extranonce());
        let generation = board.publish(job("a", true), true);
        assert!(board.suspend() > generation);
        assert!(board.snapshot().is_none());
        assert_eq!(board.current_job_id(), None);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_state() {
        let board = Arc::new(JobBoard::new());
        board.set_extranonce(extranonce());
        board.publish(job("2", true), true);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let board = Arc::clone(&board);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(snap) = board.snapshot() {
                            // Job ids are published as the generation they produce.
                            let id: u64 = snap.job.job_id.parse().unwrap();
                            assert_eq!(id, snap.generation);
                        }
                    }
                })
            })
            .collect();

        for i in 3..200u64 {
            board.publish(job(&i.to_string(), true), true);
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
