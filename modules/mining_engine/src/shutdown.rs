//! Ordered, bounded teardown.
//!
//! The coordinator is the only component that joins worker threads or closes
//! a pool socket. Teardown order: workers, the submit in flight, queue drain,
//! submissions off, receive loop, socket. A second signal skips whatever is left of the
//! graceful path and closes immediately.

use crate::submission::SubmissionReceiver;
use crate::worker::WorkerPool;
use pool_stratum_connector::{ProtocolClient, ReceiveOutcome, SocketCloser};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ShutdownPhase {
    Running,
    StopRequested,
    Draining,
    Closed,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::StopRequested => "stop requested",
            ShutdownPhase::Draining => "draining",
            ShutdownPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    /// How long to wait for workers before abandoning them.
    pub join_window: Duration,
    /// How long queued candidates may still be submitted.
    pub drain_window: Duration,
    /// How long to wait for the receive loop to observe cancellation.
    pub receive_join_window: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            join_window: Duration::from_secs(2),
            drain_window: Duration::from_secs(2),
            receive_join_window: Duration::from_secs(1),
        }
    }
}

/// A pool session as the engine holds it while mining.
pub struct LiveConnection {
    pub client: Arc<ProtocolClient>,
    pub closer: SocketCloser,
    pub receive_task: JoinHandle<ReceiveOutcome>,
    /// Cancels only the receive loop.
    pub io_cancel: CancellationToken,
}

/// Everything the coordinator tears down.
pub struct TeardownParts {
    pub workers: Option<WorkerPool>,
    pub queue: SubmissionReceiver,
    pub connection: Option<LiveConnection>,
    /// The submit the supervisor had in flight when it stopped.
    pub submitting: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub forced: bool,
    pub workers_joined: usize,
    pub workers_abandoned: usize,
    /// Candidates handed to the pool during the drain window.
    pub drained: usize,
    /// Candidates dropped without being sent.
    pub discarded: usize,
    pub socket_closed: bool,
    pub elapsed: Duration,
}

pub struct ShutdownCoordinator {
    settings: ShutdownSettings,
    phase: watch::Sender<ShutdownPhase>,
    token: CancellationToken,
    force: CancellationToken,
    signals: AtomicUsize,
}

impl ShutdownCoordinator {
    pub fn new(settings: ShutdownSettings) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            settings,
            phase,
            token: CancellationToken::new(),
            force: CancellationToken::new(),
            signals: AtomicUsize::new(0),
        }
    }

    /// Broadcast token every worker and task observes.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: ShutdownPhase) {
        let changed = self.phase.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(phase = %next, "Shutdown phase");
        }
    }

    /// First call requests an orderly stop; any later call before `Closed`
    /// forces it.
    pub fn signal(&self) -> ShutdownPhase {
        let count = self.signals.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 {
            self.advance(ShutdownPhase::StopRequested);
            self.token.cancel();
            info!("Stop requested, signal again to force");
        } else if self.phase() != ShutdownPhase::Closed && !self.force.is_cancelled() {
            warn!("Second stop signal, forcing shutdown");
            self.advance(ShutdownPhase::StopRequested);
            self.token.cancel();
            self.force.cancel();
        }
        self.phase()
    }

    /// Close a connection that ended on its own (reconnect path). The
    /// receive loop has already returned, so only the socket is left.
    pub async fn retire(&self, connection: LiveConnection) {
        connection.client.stop_submitting();
        connection.io_cancel.cancel();
        let mut task = connection.receive_task;
        if tokio::time::timeout(self.settings.receive_join_window, &mut task).await.is_err() {
            task.abort();
        }
        connection.closer.close().await;
        debug!(pool = %connection.client.endpoint(), "Retired pool connection");
    }

    pub async fn teardown(&self, parts: TeardownParts) -> TeardownReport {
        let started = Instant::now();
        if !self.token.is_cancelled() {
            self.signal();
        }
        let TeardownParts {
            workers,
            mut queue,
            connection,
            submitting,
        } = parts;
        let mut report = TeardownReport::default();

        // 1. Workers
        if let Some(mut workers) = workers {
            if self.is_forced() {
                report.workers_abandoned = workers.abandon();
            } else {
                let summary = tokio::select! {
                    biased;
                    _ = self.force.cancelled() => None,
                    summary = workers.join_within(self.settings.join_window) => Some(summary),
                };
                match summary {
                    Some(summary) => {
                        report.workers_joined = summary.joined;
                        report.workers_abandoned = summary.abandoned;
                        if summary.abandoned > 0 {
                            workers.abandon();
                        }
                    }
                    None => report.workers_abandoned = workers.abandon(),
                }
            }
        }

        // 2. Submit in flight, then drain. Both share one window.
        let deadline = tokio::time::Instant::now() + self.settings.drain_window;
        if let Some(task) = submitting {
            report.discarded += self.finish_in_flight(task, deadline).await;
        }
        match connection.as_ref() {
            Some(conn) if !self.is_forced() => {
                self.advance(ShutdownPhase::Draining);
                let (sent, unsent) = self.drain(&mut queue, &conn.client, deadline).await;
                report.drained = sent;
                report.discarded += unsent;
            }
            _ => {}
        }
        report.discarded += queue.discard_all();
        if report.discarded > 0 {
            info!(count = report.discarded, "Dropped queued shares without sending them");
        }

        // 3. Receive loop, then socket
        if let Some(conn) = connection {
            conn.client.stop_submitting();
            conn.io_cancel.cancel();
            let mut task = conn.receive_task;
            if self.is_forced() {
                task.abort();
                let _ = task.await;
            } else {
                let joined = tokio::select! {
                    biased;
                    _ = self.force.cancelled() => false,
                    result = tokio::time::timeout(self.settings.receive_join_window, &mut task) => result.is_ok(),
                };
                if !joined {
                    task.abort();
                    let _ = task.await;
                }
            }
            report.socket_closed = conn.closer.close().await;
        }

        report.forced = self.is_forced();
        self.advance(ShutdownPhase::Closed);
        report.elapsed = started.elapsed();
        info!(
            forced = report.forced,
            workers_joined = report.workers_joined,
            workers_abandoned = report.workers_abandoned,
            drained = report.drained,
            discarded = report.discarded,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }

    /// Let the submit in flight finish before `deadline`, else abort it.
    /// Returns 1 if it was cut short.
    async fn finish_in_flight(&self, mut task: JoinHandle<()>, deadline: tokio::time::Instant) -> usize {
        if !self.is_forced() {
            let finished = tokio::select! {
                biased;
                _ = self.force.cancelled() => false,
                result = tokio::time::timeout_at(deadline, &mut task) => result.is_ok(),
            };
            if finished {
                return 0;
            }
        }
        if task.is_finished() {
            return 0;
        }
        task.abort();
        let _ = task.await;
        debug!("Submit in flight cut short");
        1
    }

    /// Submit what is already queued until the window closes, the queue is
    /// empty, the connection stops taking submits, or a force signal arrives.
    /// Returns `(sent, unsent)`; an unsent candidate was dequeued but its
    /// submit failed or did not complete.
    async fn drain(
        &self,
        queue: &mut SubmissionReceiver,
        client: &ProtocolClient,
        deadline: tokio::time::Instant,
    ) -> (usize, usize) {
        let mut sent = 0;
        let mut failed = 0;
        while client.accepts_submits() {
            let Some(candidate) = queue.try_recv() else {
                break;
            };
            let outcome = tokio::select! {
                biased;
                _ = self.force.cancelled() => None,
                result = tokio::time::timeout_at(deadline, client.submit(&candidate)) => Some(result),
            };
            match outcome {
                None => {
                    debug!("Drain interrupted by force signal");
                    return (sent, failed + 1);
                }
                Some(Err(_)) => {
                    debug!("Drain window elapsed");
                    return (sent, failed + 1);
                }
                Some(Ok(Ok(_))) => sent += 1,
                Some(Ok(Err(e))) => {
                    debug!(error = %e, "Share dropped during drain");
                    failed += 1;
                }
            }
        }
        (sent, failed)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(ShutdownSettings::default())
    }
}
