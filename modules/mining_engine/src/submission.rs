//! Worker-to-network handoff for share candidates.
//!
//! Unbounded so a worker thread never blocks on I/O, but the depth is tracked
//! and a warning is logged once it crosses `warn_depth`.

use pool_stratum_connector::ShareCandidate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
struct Depth {
    current: AtomicUsize,
    warn_depth: usize,
    warned: AtomicBool,
}

impl Depth {
    fn increment(&self) {
        let depth = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if depth >= self.warn_depth && !self.warned.swap(true, Ordering::AcqRel) {
            warn!(depth, warn_depth = self.warn_depth, "Submission queue is backing up");
        }
    }

    fn decrement(&self) {
        let depth = self.current.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if depth < self.warn_depth / 2 && self.warned.swap(false, Ordering::AcqRel) {
            debug!(depth, "Submission queue recovered");
        }
    }
}

pub fn submission_queue(warn_depth: usize) -> (SubmissionSender, SubmissionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(Depth {
        current: AtomicUsize::new(0),
        warn_depth: warn_depth.max(1),
        warned: AtomicBool::new(false),
    });
    (
        SubmissionSender {
            tx,
            depth: Arc::clone(&depth),
        },
        SubmissionReceiver { rx, depth },
    )
}

/// Enqueue end; cheap to clone, callable from plain threads.
#[derive(Debug, Clone)]
pub struct SubmissionSender {
    tx: mpsc::UnboundedSender<ShareCandidate>,
    depth: Arc<Depth>,
}

impl SubmissionSender {
    /// Returns `false` if the receiver is gone; the candidate is dropped.
    pub fn push(&self, candidate: ShareCandidate) -> bool {
        self.depth.increment();
        if self.tx.send(candidate).is_err() {
            self.depth.decrement();
            return false;
        }
        true
    }
}

/// The single dequeue end, owned by the engine supervisor.
#[derive(Debug)]
pub struct SubmissionReceiver {
    rx: mpsc::UnboundedReceiver<ShareCandidate>,
    depth: Arc<Depth>,
}

impl SubmissionReceiver {
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<ShareCandidate> {
        let candidate = self.rx.recv().await?;
        self.depth.decrement();
        Some(candidate)
    }

    pub fn try_recv(&mut self) -> Option<ShareCandidate> {
        let candidate = self.rx.try_recv().ok()?;
        self.depth.decrement();
        Some(candidate)
    }

    /// Close the queue and drop everything still in it. Returns the count.
    pub fn discard_all(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.try_recv().is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.depth.current.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
