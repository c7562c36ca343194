//! `MiningEngine`: connect, mine, reconnect, stop.
//!
//! `start` returns once the pool handshake is done and the workers are
//! running. From then on a supervisor task owns the live connection: it
//! forwards queued candidates, publishes stats on an interval and replaces
//! the connection when it drops. `stop` hands everything to the
//! `ShutdownCoordinator`.

use crate::pow::{hasher_by_name, PowHasher, ALGORITHMS};
use crate::shutdown::{LiveConnection, ShutdownCoordinator, ShutdownPhase, ShutdownSettings, TeardownParts, TeardownReport};
use crate::submission::{submission_queue, SubmissionReceiver};
use crate::worker::{WorkerConfig, WorkerPool};
use anyhow::anyhow;
use pool_stratum_connector::{
    AuthStatus, ClientSettings, ConnectError, EngineStats, HashrateMeter, JobBoard, PoolEndpoint, ProtocolClient,
    ReceiveOutcome, ShareCandidate, StatsSnapshot,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_STATS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): doubles from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub client: ClientSettings,
    pub workers: WorkerConfig,
    pub algorithm: String,
    pub queue_warn_depth: usize,
    pub shutdown: ShutdownSettings,
    pub reconnect: ReconnectPolicy,
    pub stats_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            client: ClientSettings::default(),
            workers: WorkerConfig::default(),
            algorithm: "chained".to_string(),
            queue_warn_depth: 256,
            shutdown: ShutdownSettings::default(),
            reconnect: ReconnectPolicy::default(),
            stats_interval: Duration::from_secs(30),
        }
    }
}

/// Receives a stats snapshot every `stats_interval` and once more at exit.
pub trait StatsSink: Send + Sync {
    fn publish(&self, snapshot: &StatsSnapshot);
}

/// Writes each snapshot as an INFO status line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn publish(&self, snapshot: &StatsSnapshot) {
        info!(
            hashrate = snapshot.hashrate,
            hashes = snapshot.hashes_computed,
            found = snapshot.shares_found,
            accepted = snapshot.shares_accepted,
            rejected = snapshot.shares_rejected,
            unconfirmed = snapshot.shares_unconfirmed,
            "Status: {}",
            snapshot
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineStatus {
    Starting,
    Mining { authorized: bool },
    Reconnecting { attempt: u32 },
    Stopping,
    Stopped,
    Failed(String),
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Starting => f.write_str("starting"),
            EngineStatus::Mining { authorized: true } => f.write_str("mining"),
            EngineStatus::Mining { authorized: false } => f.write_str("mining (authorization pending)"),
            EngineStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            EngineStatus::Stopping => f.write_str("stopping"),
            EngineStatus::Stopped => f.write_str("stopped"),
            EngineStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Why the engine stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineOutcome {
    /// A stop was requested.
    Stopped,
    /// The connection was lost and every reconnect attempt failed.
    ReconnectExhausted { attempts: u32 },
    /// The pool refused the credentials mid-session.
    Unauthorized,
    /// The supervisor task panicked.
    Crashed(String),
}

impl EngineOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, EngineOutcome::Stopped)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineExit {
    pub outcome: EngineOutcome,
    pub report: TeardownReport,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to start mining workers: {0}")]
    Workers(String),
}

pub struct MiningEngine {
    options: EngineOptions,
    hasher: Arc<dyn PowHasher>,
    sink: Arc<dyn StatsSink>,
}

impl MiningEngine {
    /// Resolves `options.algorithm` to a hasher.
    pub fn new(options: EngineOptions, sink: Arc<dyn StatsSink>) -> anyhow::Result<Self> {
        let hasher = hasher_by_name(&options.algorithm).ok_or_else(|| {
            anyhow!(
                "Unknown algorithm '{}', expected one of: {}",
                options.algorithm,
                ALGORITHMS.join(", ")
            )
        })?;
        Ok(Self::with_hasher(options, hasher, sink))
    }

    pub fn with_hasher(options: EngineOptions, hasher: Arc<dyn PowHasher>, sink: Arc<dyn StatsSink>) -> Self {
        Self { options, hasher, sink }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Connect and run the handshake, then start the workers and the
    /// supervisor. Nothing is left running if this returns an error.
    pub async fn start(&self, endpoint: PoolEndpoint) -> Result<EngineHandle, StartError> {
        let board = Arc::new(JobBoard::new());
        let stats = Arc::new(EngineStats::new());
        let coordinator = Arc::new(ShutdownCoordinator::new(self.options.shutdown.clone()));
        let (status_tx, status_rx) = watch::channel(EngineStatus::Starting);
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        let session = Session {
            endpoint,
            settings: self.options.client.clone(),
            board: Arc::clone(&board),
            stats: Arc::clone(&stats),
            ended: ended_tx,
        };
        let connection = session.open().await?;
        let authorized = connection.client.auth_status() == AuthStatus::Authorized;

        let (queue_tx, queue_rx) = submission_queue(self.options.queue_warn_depth);
        let workers = match WorkerPool::spawn(
            &self.options.workers,
            Arc::clone(&board),
            Arc::clone(&self.hasher),
            queue_tx,
            Arc::clone(&stats),
            coordinator.token(),
        ) {
            Ok(workers) => workers,
            Err(e) => {
                coordinator
                    .teardown(TeardownParts {
                        workers: None,
                        queue: queue_rx,
                        connection: Some(connection),
                        submitting: None,
                    })
                    .await;
                return Err(StartError::Workers(format!("{:#}", e)));
            }
        };

        status_tx.send_replace(EngineStatus::Mining { authorized });
        info!(pool = %session.endpoint, authorized, "Mining started");

        let supervisor = Supervisor {
            session,
            ended: ended_rx,
            reconnect: self.options.reconnect.clone(),
            stats_interval: self.options.stats_interval.max(MIN_STATS_INTERVAL),
            coordinator: Arc::clone(&coordinator),
            sink: Arc::clone(&self.sink),
            status: status_tx,
        };
        let task = tokio::spawn(supervisor.run(connection, workers, queue_rx));

        Ok(EngineHandle {
            coordinator,
            status: status_rx,
            stats,
            board,
            supervisor: task,
        })
    }

    /// Request an orderly stop and wait for teardown to finish.
    pub async fn stop(&self, handle: EngineHandle) -> EngineExit {
        handle.signal();
        handle.wait().await
    }
}

pub struct EngineHandle {
    coordinator: Arc<ShutdownCoordinator>,
    status: watch::Receiver<EngineStatus>,
    stats: Arc<EngineStats>,
    board: Arc<JobBoard>,
    supervisor: JoinHandle<EngineExit>,
}

impl EngineHandle {
    /// First call stops the engine in order; a second call forces it.
    pub fn signal(&self) -> ShutdownPhase {
        self.coordinator.signal()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// `true` once the supervisor has torn everything down.
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait for the engine to stop on its own or after a signal.
    pub async fn wait(self) -> EngineExit {
        match self.supervisor.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "Engine supervisor failed");
                // The supervisor owned the teardown, so force whatever is left.
                self.coordinator.signal();
                self.coordinator.signal();
                EngineExit {
                    outcome: EngineOutcome::Crashed(e.to_string()),
                    report: TeardownReport::default(),
                    stats: self.stats.snapshot(0.0),
                }
            }
        }
    }
}

/// What is needed to open a pool connection, again and again.
struct Session {
    endpoint: PoolEndpoint,
    settings: ClientSettings,
    board: Arc<JobBoard>,
    stats: Arc<EngineStats>,
    ended: mpsc::UnboundedSender<ReceiveOutcome>,
}

impl Session {
    async fn open(&self) -> Result<LiveConnection, ConnectError> {
        let (client, closer) = ProtocolClient::connect(
            self.endpoint.clone(),
            self.settings.clone(),
            Arc::clone(&self.board),
            Arc::clone(&self.stats),
        )
        .await?;

        // Independent of the engine token: the receive loop keeps reading
        // verdicts while the queue drains.
        let io_cancel = CancellationToken::new();
        let receive_task = tokio::spawn({
            let client = Arc::clone(&client);
            let cancel = io_cancel.clone();
            let ended = self.ended.clone();
            async move {
                let outcome = client.receive_loop(cancel).await;
                let _ = ended.send(outcome);
                outcome
            }
        });

        Ok(LiveConnection {
            client,
            closer,
            receive_task,
            io_cancel,
        })
    }
}

enum Event {
    Stop,
    Ended(ReceiveOutcome),
    Share(ShareCandidate),
    Submitted,
    Tick,
}

/// Resolves once the submit in `slot` finishes, then empties the slot.
async fn settle(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.as_mut() {
        if let Err(e) = task.await {
            debug!(error = %e, "Submit task ended abnormally");
        }
    }
    *slot = None;
}

struct Supervisor {
    session: Session,
    ended: mpsc::UnboundedReceiver<ReceiveOutcome>,
    reconnect: ReconnectPolicy,
    stats_interval: Duration,
    coordinator: Arc<ShutdownCoordinator>,
    sink: Arc<dyn StatsSink>,
    status: watch::Sender<EngineStatus>,
}

impl Supervisor {
    async fn run(mut self, connection: LiveConnection, workers: WorkerPool, mut queue: SubmissionReceiver) -> EngineExit {
        let token = self.coordinator.token();
        let mut connection = Some(connection);
        // At most one submit in flight; the backlog stays in the queue.
        let mut submitting: Option<JoinHandle<()>> = None;
        let mut meter = HashrateMeter::new(self.session.stats.hashes_computed(), Instant::now());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.stats_interval, self.stats_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            let Some(live) = connection.as_ref() else {
                break EngineOutcome::Stopped;
            };

            let event = tokio::select! {
                biased;
                _ = token.cancelled() => Event::Stop,
                Some(outcome) = self.ended.recv() => Event::Ended(outcome),
                _ = settle(&mut submitting), if submitting.is_some() => Event::Submitted,
                Some(candidate) = queue.recv(), if submitting.is_none() => Event::Share(candidate),
                _ = ticker.tick() => Event::Tick,
            };

            match event {
                Event::Stop => break EngineOutcome::Stopped,
                Event::Share(candidate) => {
                    // Runs beside the loop so a slow write never delays a stop
                    // or a reconnect.
                    let client = Arc::clone(&live.client);
                    submitting = Some(tokio::spawn(async move {
                        if let Err(e) = client.submit(&candidate).await {
                            debug!(error = %e, job_id = %candidate.job_id, "Share not submitted");
                        }
                    }));
                }
                Event::Submitted => {}
                Event::Tick => {
                    let hashrate = meter.sample(self.session.stats.hashes_computed(), Instant::now());
                    self.sink.publish(&self.session.stats.snapshot(hashrate));
                    let authorized = live.client.auth_status() == AuthStatus::Authorized;
                    self.status.send_if_modified(|status| match status {
                        EngineStatus::Mining { authorized: current } if *current != authorized => {
                            *current = authorized;
                            true
                        }
                        _ => false,
                    });
                }
                Event::Ended(ReceiveOutcome::Cancelled) => break EngineOutcome::Stopped,
                Event::Ended(ReceiveOutcome::Unauthorized) => {
                    error!(pool = %self.session.endpoint, "Pool revoked authorization, stopping");
                    break EngineOutcome::Unauthorized;
                }
                Event::Ended(ended) => {
                    warn!(pool = %self.session.endpoint, outcome = ?ended, "Pool connection lost");
                    if let Some(old) = connection.take() {
                        self.coordinator.retire(old).await;
                    }
                    self.session.board.suspend();
                    match self.reconnect_with_backoff(&token).await {
                        Ok(Some(fresh)) => connection = Some(fresh),
                        Ok(None) => break EngineOutcome::Stopped,
                        Err(outcome) => break outcome,
                    }
                }
            }
        };

        self.status.send_replace(EngineStatus::Stopping);
        let report = self
            .coordinator
            .teardown(TeardownParts {
                workers: Some(workers),
                queue,
                connection,
                submitting,
            })
            .await;

        let hashrate = meter.sample(self.session.stats.hashes_computed(), Instant::now());
        let stats = self.session.stats.snapshot(hashrate);
        self.sink.publish(&stats);
        let status = match &outcome {
            EngineOutcome::Stopped => EngineStatus::Stopped,
            EngineOutcome::ReconnectExhausted { attempts } => {
                EngineStatus::Failed(format!("gave up after {} reconnect attempts", attempts))
            }
            EngineOutcome::Unauthorized => EngineStatus::Failed("pool refused authorization".to_string()),
            EngineOutcome::Crashed(reason) => EngineStatus::Failed(reason.clone()),
        };
        self.status.send_replace(status);
        info!(outcome = ?outcome, "Engine stopped");
        EngineExit { outcome, report, stats }
    }

    /// `Ok(Some)` with a fresh connection, `Ok(None)` if a stop arrived
    /// first, `Err` with the outcome to stop on.
    async fn reconnect_with_backoff(&mut self, token: &CancellationToken) -> Result<Option<LiveConnection>, EngineOutcome> {
        // Outcomes from the retired connection are stale.
        while self.ended.try_recv().is_ok() {}

        for attempt in 1..=self.reconnect.max_attempts {
            self.status.send_replace(EngineStatus::Reconnecting { attempt });
            let delay = self.reconnect.backoff(attempt);
            info!(attempt, max_attempts = self.reconnect.max_attempts, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                opened = self.session.open() => opened,
            };

            match opened {
                Ok(fresh) => {
                    let authorized = fresh.client.auth_status() == AuthStatus::Authorized;
                    self.status.send_replace(EngineStatus::Mining { authorized });
                    info!(attempt, pool = %self.session.endpoint, "Reconnected");
                    return Ok(Some(fresh));
                }
                Err(ConnectError::Unauthorized(reason)) => {
                    error!(reason = %reason, "Pool refused authorization on reconnect");
                    return Err(EngineOutcome::Unauthorized);
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        error!(attempts = self.reconnect.max_attempts, "Reconnect attempts exhausted");
        Err(EngineOutcome::ReconnectExhausted {
            attempts: self.reconnect.max_attempts,
        })
    }
}
