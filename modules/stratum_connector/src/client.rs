//! Pool connection: handshake, receive loop and share submission.
//!
//! Socket ownership is split three ways and never shared:
//!
//! - the read half belongs to whoever runs [`ProtocolClient::receive_loop`]
//!   (the handshake borrows it first);
//! - the write half sits behind a mutex and is only used by `submit` and the
//!   authorize resend. A line write that is dropped or fails part way marks
//!   the link broken: nothing else is written and the receive loop ends as
//!   `Disconnected`;
//! - closing is only possible through the [`SocketCloser`] returned by
//!   [`ProtocolClient::connect`].

use crate::error::{ConnectError, ConnectResult, SubmitError};
use crate::job_board::JobBoard;
use crate::messages::{self, methods, JsonRpcMessage};
use crate::stats::EngineStats;
use crate::types::{AuthStatus, ConnectionState, PoolEndpoint, ShareCandidate};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// How often the receive loop sweeps unanswered submits and checks whether
/// an authorize resend is due.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

/// Authorize request ids remembered for matching late replies.
const AUTH_IDS_KEPT: usize = 8;

/// Connection tuning. Every timeout is independent of the others.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Sent as the first `mining.subscribe` parameter.
    pub client_name: String,
    /// Bounds the TCP connect and the wait for the subscribe result.
    pub connect_timeout: Duration,
    /// How long to wait for the authorize result before mining on streamed work.
    pub auth_wait: Duration,
    /// Re-send `mining.authorize` on this interval while the result is unknown.
    pub auth_resend_interval: Option<Duration>,
    /// Bounds one submit write, and how long a submit may wait for its verdict.
    pub submit_timeout: Duration,
    /// Consecutive malformed lines that count as a protocol desync.
    pub malformed_limit: u32,
    /// Window the malformed lines must fall into.
    pub malformed_window: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_name: format!("pool-miner/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            auth_wait: Duration::from_secs(15),
            auth_resend_interval: None,
            submit_timeout: Duration::from_secs(5),
            malformed_limit: 3,
            malformed_window: Duration::from_secs(5),
        }
    }
}

/// Why the receive loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The cancellation token fired.
    Cancelled,
    /// EOF or a read error.
    Disconnected,
    /// Too many malformed lines in a row.
    Desync,
    /// The pool sent `client.reconnect`.
    ReconnectRequested,
    /// The pool answered a late authorize with a refusal.
    Unauthorized,
}

impl ReceiveOutcome {
    /// Outcomes after which a fresh connection may succeed.
    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            ReceiveOutcome::Disconnected | ReceiveOutcome::Desync | ReceiveOutcome::ReconnectRequested
        )
    }
}

/// State shared by the client and its closer.
struct Link {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Fired before the closer takes the writer, so an in-flight write lets go.
    closing: CancellationToken,
    /// Fired when a line was cut off mid-write.
    broken: CancellationToken,
    closed: AtomicBool,
    shutdowns: AtomicUsize,
    submits_open: AtomicBool,
    state: watch::Sender<ConnectionState>,
    peer: String,
}

impl Link {
    fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(peer = %self.peer, state = %next, "Connection state changed");
        }
        changed
    }

    /// Write one whole line. Cancel-safe only up to taking the writer lock.
    async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        if self.broken.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "an earlier write was cut off"));
        }
        let half = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;

        let mut in_flight = LineInFlight {
            link: self,
            finished: false,
        };
        let result = tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closing")),
            result = async {
                half.write_all(line.as_bytes()).await?;
                half.flush().await
            } => result,
        };
        in_flight.finished = result.is_ok();
        result
    }

    fn mark_broken(&self) {
        self.submits_open.store(false, Ordering::Release);
        if !self.broken.is_cancelled() && !self.closed.load(Ordering::Acquire) {
            warn!(peer = %self.peer, "Write to pool cut off mid-line, dropping the connection");
        }
        self.broken.cancel();
    }
}

/// Marks the link broken unless the write it guards ran to completion.
/// Dropping a pending `write_line` (timeout, abort) counts as cut off.
struct LineInFlight<'a> {
    link: &'a Link,
    finished: bool,
}

impl Drop for LineInFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.link.mark_broken();
        }
    }
}

/// The only handle able to close a pool socket.
///
/// Not `Clone`. The engine hands it to its shutdown coordinator.
pub struct SocketCloser {
    link: Arc<Link>,
}

impl SocketCloser {
    /// Stop submissions, shut the write half down and drop it.
    ///
    /// Idempotent: returns `true` only for the call that actually closed.
    pub async fn close(&self) -> bool {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            trace!(peer = %self.link.peer, "Close requested on an already closed socket");
            return false;
        }
        self.link.submits_open.store(false, Ordering::Release);
        self.link.set_state(ConnectionState::Closing);
        self.link.closing.cancel();

        let half = self.link.writer.lock().await.take();
        if let Some(mut half) = half {
            if let Err(e) = half.shutdown().await {
                debug!(peer = %self.link.peer, error = %e, "Socket shutdown reported an error");
            }
            self.link.shutdowns.fetch_add(1, Ordering::AcqRel);
        }
        self.link.set_state(ConnectionState::Closed);
        info!(peer = %self.link.peer, "Pool socket closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::Acquire)
    }

    /// Number of times the write half was actually shut down. Never above one.
    pub fn shutdown_count(&self) -> usize {
        self.link.shutdowns.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> &str {
        &self.link.peer
    }
}

impl fmt::Debug for SocketCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCloser")
            .field("peer", &self.link.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct PendingSubmit {
    job_id: String,
    nonce: u32,
    sent_at: Instant,
}

#[derive(Debug)]
struct AuthTracker {
    status: AuthStatus,
    /// Latest authorize ids, resends included. Emptied once authorized.
    request_ids: VecDeque<u64>,
}

impl AuthTracker {
    fn new() -> Self {
        Self {
            status: AuthStatus::Pending,
            request_ids: VecDeque::with_capacity(AUTH_IDS_KEPT),
        }
    }

    fn track(&mut self, id: u64) {
        if self.request_ids.len() == AUTH_IDS_KEPT {
            self.request_ids.pop_front();
        }
        self.request_ids.push_back(id);
    }

    fn is_tracked(&self, id: u64) -> bool {
        self.request_ids.contains(&id)
    }
}

/// Counts consecutive malformed lines that fall within one window.
#[derive(Debug)]
struct MalformedStreak {
    limit: u32,
    window: Duration,
    count: u32,
    started: Option<Instant>,
}

impl MalformedStreak {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            count: 0,
            started: None,
        }
    }

    /// Returns `true` once the streak reaches the limit.
    fn record(&mut self, now: Instant) -> bool {
        match self.started {
            Some(start) if now.duration_since(start) <= self.window => self.count += 1,
            _ => {
                self.started = Some(now);
                self.count = 1;
            }
        }
        self.count >= self.limit
    }

    fn reset(&mut self) {
        self.count = 0;
        self.started = None;
    }
}

/// What the receive loop should do after routing one message.
#[derive(Debug, PartialEq, Eq)]
enum Routed {
    Continue,
    Malformed,
    Reconnect,
    Unauthorized,
}

/// One authenticated session with a pool.
pub struct ProtocolClient {
    endpoint: PoolEndpoint,
    settings: ClientSettings,
    board: Arc<JobBoard>,
    stats: Arc<EngineStats>,
    link: Arc<Link>,
    reader: tokio::sync::Mutex<Option<LineReader>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSubmit>>,
    auth: Mutex<AuthTracker>,
    notifies: AtomicU64,
}

impl ProtocolClient {
    /// Open the socket and run subscribe then authorize.
    ///
    /// On any handshake failure the socket is closed before returning.
    pub async fn connect(
        endpoint: PoolEndpoint,
        settings: ClientSettings,
        board: Arc<JobBoard>,
        stats: Arc<EngineStats>,
    ) -> ConnectResult<(Arc<Self>, SocketCloser)> {
        let address = endpoint.address();
        info!(pool = %endpoint, "Connecting to pool");

        let stream = timeout(settings.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                ConnectError::Unreachable(format!("connect to {} timed out after {:?}", address, settings.connect_timeout))
            })?
            .map_err(|e| ConnectError::Unreachable(format!("{}: {}", address, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let link = Arc::new(Link {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            closing: CancellationToken::new(),
            broken: CancellationToken::new(),
            closed: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            submits_open: AtomicBool::new(true),
            state,
            peer: address,
        });
        link.set_state(ConnectionState::Connected);

        let client = Arc::new(Self {
            endpoint,
            settings,
            board,
            stats,
            link: Arc::clone(&link),
            reader: tokio::sync::Mutex::new(Some(BufReader::new(read_half).lines())),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            auth: Mutex::new(AuthTracker::new()),
            notifies: AtomicU64::new(0),
        });
        let closer = SocketCloser { link };

        match client.handshake().await {
            Ok(()) => Ok((client, closer)),
            Err(e) => {
                warn!(pool = %client.endpoint, error = %e, "Handshake failed");
                closer.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ConnectResult<()> {
        let mut guard = self.reader.lock().await;
        let lines = guard
            .as_mut()
            .ok_or_else(|| ConnectError::Unreachable("socket reader unavailable".to_string()))?;

        // Subscribe
        let id = self.allocate_id();
        self.send(&messages::subscribe_request(id, &self.settings.client_name))
            .await
            .map_err(|e| ConnectError::Unreachable(format!("sending subscribe: {}", e)))?;
        let deadline = tokio::time::Instant::now() + self.settings.connect_timeout;
        let (result, error) = self.await_response(lines, id, deadline).await?.ok_or_else(|| {
            ConnectError::MalformedHandshake(format!(
                "no subscribe result within {:?}",
                self.settings.connect_timeout
            ))
        })?;
        if let Some(err) = error.filter(|e| !e.is_null()) {
            return Err(ConnectError::MalformedHandshake(format!("subscribe refused: {}", err)));
        }
        let result = result.ok_or_else(|| ConnectError::MalformedHandshake("subscribe result missing".to_string()))?;
        let extranonce =
            messages::parse_subscribe_result(&result).map_err(|e| ConnectError::MalformedHandshake(e.to_string()))?;
        info!(
            extranonce1 = %hex::encode(&extranonce.extranonce1),
            extranonce2_size = extranonce.extranonce2_size,
            "Subscribed"
        );
        self.board.set_extranonce(extranonce);
        self.link.set_state(ConnectionState::Subscribed);

        // Authorize
        let id = self.allocate_id();
        self.track_auth_request(id);
        self.send(&messages::authorize_request(id, &self.endpoint.username, &self.endpoint.password))
            .await
            .map_err(|e| ConnectError::Unreachable(format!("sending authorize: {}", e)))?;
        let deadline = tokio::time::Instant::now() + self.settings.auth_wait;
        match self.await_response(lines, id, deadline).await? {
            Some((result, error)) => match self.resolve_auth(result.as_ref(), error.as_ref()) {
                Routed::Unauthorized => {
                    let reason = messages::parse_verdict(result.as_ref(), error.as_ref())
                        .reason
                        .unwrap_or_default();
                    Err(ConnectError::Unauthorized(reason))
                }
                _ => Ok(()),
            },
            None if self.notifies_received() > 0 => {
                warn!(
                    authorized = false,
                    auth_wait = ?self.settings.auth_wait,
                    "No authorize result yet, mining on streamed work"
                );
                Ok(())
            }
            None => Err(ConnectError::AuthTimeout(self.settings.auth_wait)),
        }
    }

    /// Read until the response for `id` arrives, routing everything else.
    /// `Ok(None)` means the deadline passed first.
    async fn await_response(
        &self,
        lines: &mut LineReader,
        id: u64,
        deadline: tokio::time::Instant,
    ) -> ConnectResult<Option<(Option<Value>, Option<Value>)>> {
        loop {
            let line = match timeout_at(deadline, lines.next_line()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(ConnectError::Unreachable(format!("read during handshake: {}", e))),
                Ok(Ok(None)) => {
                    return Err(ConnectError::Unreachable(
                        "pool closed the connection during handshake".to_string(),
                    ))
                }
                Ok(Ok(Some(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            trace!(line = %line, "Handshake line");
            match JsonRpcMessage::from_line(&line) {
                Ok(JsonRpcMessage::Response {
                    id: response_id,
                    result,
                    error,
                }) if response_id == id => return Ok(Some((result, error))),
                Ok(msg) => {
                    if self.route(msg) == Routed::Reconnect {
                        return Err(ConnectError::Unreachable(
                            "pool requested reconnect during handshake".to_string(),
                        ));
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed line during handshake"),
            }
        }
    }

    /// Single reader of the socket after the handshake. Returns when the
    /// token fires, the socket fails, or the pool desyncs.
    pub async fn receive_loop(&self, cancel: CancellationToken) -> ReceiveOutcome {
        let Some(mut lines) = self.reader.lock().await.take() else {
            warn!("Receive loop started twice; the socket reader is already gone");
            return ReceiveOutcome::Disconnected;
        };
        let mut streak = MalformedStreak::new(self.settings.malformed_limit, self.settings.malformed_window);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_auth_sent = Instant::now();

        debug!(pool = %self.endpoint, "Receive loop started");
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ReceiveOutcome::Cancelled,
                _ = self.link.broken.cancelled() => {
                    warn!(pool = %self.endpoint, "Outgoing stream is no longer line-aligned");
                    break ReceiveOutcome::Disconnected;
                }
                _ = housekeeping.tick() => {
                    self.sweep_expired_submits();
                    if let Some(every) = self.settings.auth_resend_interval {
                        if self.auth_status() == AuthStatus::Pending && last_auth_sent.elapsed() >= every {
                            self.resend_authorize().await;
                            last_auth_sent = Instant::now();
                        }
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        trace!(line = %line, "Pool line");
                        let routed = match JsonRpcMessage::from_line(&line) {
                            Ok(msg) => self.route(msg),
                            Err(e) => {
                                warn!(error = %e, "Skipping malformed line");
                                Routed::Malformed
                            }
                        };
                        match routed {
                            Routed::Continue => streak.reset(),
                            Routed::Malformed => {
                                if streak.record(Instant::now()) {
                                    error!(
                                        limit = self.settings.malformed_limit,
                                        window = ?self.settings.malformed_window,
                                        "Too many malformed lines, treating the connection as desynced"
                                    );
                                    break ReceiveOutcome::Desync;
                                }
                            }
                            Routed::Reconnect => break ReceiveOutcome::ReconnectRequested,
                            Routed::Unauthorized => break ReceiveOutcome::Unauthorized,
                        }
                    }
                    Ok(None) => {
                        info!(pool = %self.endpoint, "Pool closed the connection");
                        break ReceiveOutcome::Disconnected;
                    }
                    Err(e) => {
                        warn!(pool = %self.endpoint, error = %e, "Socket read failed");
                        break ReceiveOutcome::Disconnected;
                    }
                },
            }
        };
        drop(lines);

        let lost = self.drain_pending();
        if lost > 0 {
            info!(count = lost, "Submitted shares left without a verdict");
        }
        if outcome.should_reconnect() {
            self.link.set_state(ConnectionState::Disconnected);
        }
        debug!(?outcome, "Receive loop finished");
        outcome
    }

    fn route(&self, msg: JsonRpcMessage) -> Routed {
        match msg {
            JsonRpcMessage::Response { id, result, error } => self.route_response(id, result, error),
            JsonRpcMessage::Request { method, params, .. } => self.route_request(&method, &params),
        }
    }

    fn route_request(&self, method: &str, params: &Value) -> Routed {
        match method {
            methods::NOTIFY => match messages::parse_notify(params) {
                Ok(job) => {
                    self.notifies.fetch_add(1, Ordering::Relaxed);
                    let clean_jobs = job.clean_jobs;
                    info!(job_id = %job.job_id, clean_jobs, "New job from pool");
                    self.board.publish(job, clean_jobs);
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed mining.notify");
                    return Routed::Malformed;
                }
            },
            methods::SET_DIFFICULTY => match messages::parse_set_difficulty(params) {
                Ok(difficulty) => self.board.set_difficulty(difficulty),
                Err(e) => warn!(error = %e, current = %self.board.difficulty(), "Keeping previous difficulty"),
            },
            methods::SET_EXTRANONCE => match messages::parse_set_extranonce(params) {
                Ok(extranonce) => {
                    info!(
                        extranonce1 = %hex::encode(&extranonce.extranonce1),
                        extranonce2_size = extranonce.extranonce2_size,
                        "Pool changed extranonce"
                    );
                    self.board.set_extranonce(extranonce);
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed mining.set_extranonce");
                    return Routed::Malformed;
                }
            },
            methods::RECONNECT => {
                // Redirect targets are not followed; the configured endpoint is reused.
                info!(params = %params, pool = %self.endpoint, "Pool requested a reconnect");
                return Routed::Reconnect;
            }
            methods::SHOW_MESSAGE => {
                let text = params.get(0).and_then(Value::as_str).unwrap_or_default();
                info!(message = %text, "Message from pool");
            }
            other => debug!(method = other, "Ignoring unsupported pool method"),
        }
        Routed::Continue
    }

    fn route_response(&self, id: u64, result: Option<Value>, error: Option<Value>) -> Routed {
        let pending = self.pending_lock().remove(&id);
        if let Some(pending) = pending {
            let verdict = messages::parse_verdict(result.as_ref(), error.as_ref());
            self.stats.record_result(verdict.accepted);
            let latency_ms = pending.sent_at.elapsed().as_millis() as u64;
            if verdict.accepted {
                info!(job_id = %pending.job_id, nonce = %format!("{:08x}", pending.nonce), latency_ms, "Share accepted");
            } else {
                warn!(
                    job_id = %pending.job_id,
                    nonce = %format!("{:08x}", pending.nonce),
                    reason = verdict.reason.as_deref().unwrap_or("unknown"),
                    "Share rejected"
                );
            }
            return Routed::Continue;
        }
        if self.is_auth_request(id) {
            return self.resolve_auth(result.as_ref(), error.as_ref());
        }
        debug!(id, "Response for an unknown request id");
        Routed::Continue
    }

    fn resolve_auth(&self, result: Option<&Value>, error: Option<&Value>) -> Routed {
        let verdict = messages::parse_verdict(result, error);
        let mut auth = self.auth_lock();
        if auth.status == AuthStatus::Authorized {
            debug!(accepted = verdict.accepted, "Ignoring reply to an earlier authorize");
            return Routed::Continue;
        }
        if verdict.accepted {
            auth.status = AuthStatus::Authorized;
            auth.request_ids.clear();
            drop(auth);
            self.link.set_state(ConnectionState::Authorized);
            info!(authorized = true, worker = %self.endpoint.username, "Authorized by pool");
            Routed::Continue
        } else {
            auth.status = AuthStatus::Rejected;
            drop(auth);
            error!(
                worker = %self.endpoint.username,
                reason = verdict.reason.as_deref().unwrap_or("unknown"),
                "Pool refused authorization"
            );
            Routed::Unauthorized
        }
    }

    async fn resend_authorize(&self) {
        let id = self.allocate_id();
        self.track_auth_request(id);
        let request = messages::authorize_request(id, &self.endpoint.username, &self.endpoint.password);
        match timeout(self.settings.submit_timeout, self.send(&request)).await {
            Ok(Ok(())) => debug!(id, "Re-sent authorize"),
            Ok(Err(e)) => warn!(error = %e, "Authorize resend failed"),
            Err(_) => warn!("Authorize resend timed out"),
        }
    }

    /// Send one share. The returned id is the request id the verdict will
    /// carry. A failed submit is dropped and counted as unconfirmed.
    pub async fn submit(&self, share: &ShareCandidate) -> Result<u64, SubmitError> {
        if !self.link.submits_open.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        let id = self.allocate_id();
        let line = messages::submit_request(id, &self.endpoint.username, share)
            .to_line()
            .map_err(|e| SubmitError::WriteFailed(e.to_string()))?;

        self.pending_lock().insert(
            id,
            PendingSubmit {
                job_id: share.job_id.clone(),
                nonce: share.nonce,
                sent_at: Instant::now(),
            },
        );

        let outcome = match timeout(self.settings.submit_timeout, self.link.write_line(&line)).await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(_)) if self.link.closed.load(Ordering::Acquire) => Err(SubmitError::Closed),
            Ok(Err(e)) => Err(SubmitError::WriteFailed(e.to_string())),
            Err(_) => Err(SubmitError::Timeout(self.settings.submit_timeout)),
        };

        match outcome {
            Ok(id) => {
                self.stats.record_submitted();
                debug!(id, job_id = %share.job_id, nonce = %format!("{:08x}", share.nonce), "Share submitted");
                Ok(id)
            }
            Err(e) => {
                self.pending_lock().remove(&id);
                self.stats.record_unconfirmed();
                warn!(job_id = %share.job_id, error = %e, "Share dropped");
                Err(e)
            }
        }
    }

    /// Refuse further submits. In-flight writes finish or time out.
    pub fn stop_submitting(&self) {
        if self.link.submits_open.swap(false, Ordering::AcqRel) {
            debug!(pool = %self.endpoint, "Submissions stopped");
        }
    }

    pub fn accepts_submits(&self) -> bool {
        self.link.submits_open.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    /// Observe state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth_lock().status
    }

    pub fn notifies_received(&self) -> u64 {
        self.notifies.load(Ordering::Relaxed)
    }

    pub fn pending_submits(&self) -> usize {
        self.pending_lock().len()
    }

    pub fn endpoint(&self) -> &PoolEndpoint {
        &self.endpoint
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, msg: &JsonRpcMessage) -> io::Result<()> {
        let line = msg
            .to_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.link.write_line(&line).await
    }

    fn track_auth_request(&self, id: u64) {
        self.auth_lock().track(id);
    }

    fn is_auth_request(&self, id: u64) -> bool {
        self.auth_lock().is_tracked(id)
    }

    fn sweep_expired_submits(&self) {
        let limit = self.settings.submit_timeout;
        let expired: Vec<(u64, PendingSubmit)> = {
            let mut pending = self.pending_lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.sent_at.elapsed() > limit)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, p) in expired {
            self.stats.record_unconfirmed();
            warn!(id, job_id = %p.job_id, timeout = ?limit, "No verdict for share, counting it as unconfirmed");
        }
    }

    fn drain_pending(&self) -> usize {
        let drained: Vec<_> = self.pending_lock().drain().collect();
        for _ in &drained {
            self.stats.record_unconfirmed();
        }
        drained.len()
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingSubmit>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn auth_lock(&self) -> std::sync::MutexGuard<'_, AuthTracker> {
        self.auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("auth", &self.auth_status())
            .finish()
    }
}
