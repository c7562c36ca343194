//! Data shared between the pool connection, the job board and the workers.

use std::fmt;

/// Where to mine and as whom. Immutable once a connection attempt begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl PoolEndpoint {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `host:port`, optionally prefixed with `stratum+tcp://`.
    pub fn parse(url: &str, username: impl Into<String>, password: impl Into<String>) -> Result<Self, String> {
        let trimmed = url.trim();
        let without_scheme = trimmed.strip_prefix("stratum+tcp://").unwrap_or(trimmed);
        let (host, port) = without_scheme
            .rsplit_once(':')
            .ok_or_else(|| format!("pool address '{}' is missing a port", url))?;
        if host.is_empty() {
            return Err(format!("pool address '{}' is missing a host", url));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| format!("pool address '{}' has an invalid port: {}", url, e))?;
        Ok(Self::new(host, port, username, password))
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A block header template from `mining.notify`, hex fields already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub previous_block_hash: Vec<u8>,
    pub coinbase_part1: Vec<u8>,
    pub coinbase_part2: Vec<u8>,
    pub merkle_branches: Vec<Vec<u8>>,
    pub version: Vec<u8>,
    pub bits: Vec<u8>,
    pub time: Vec<u8>,
    /// Abandon all outstanding work for earlier jobs.
    pub clean_jobs: bool,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job(id: {}, prev: {}, branches: {}, ntime: {}, clean: {})",
            self.job_id,
            hex::encode(&self.previous_block_hash),
            self.merkle_branches.len(),
            hex::encode(&self.time),
            self.clean_jobs
        )
    }
}

/// Pool-assigned nonce prefix from the subscribe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extranonce {
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

/// A nonce whose digest met the target of the snapshot it was found under.
///
/// `job_id` and `ntime` come from that snapshot, not from whatever job is
/// current when the share is finally submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCandidate {
    pub job_id: String,
    pub nonce: u32,
    pub extranonce2: Vec<u8>,
    pub ntime: Vec<u8>,
    pub digest: [u8; 32],
}

/// Lifecycle of one pool connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Subscribed,
    Authorized,
    Closing,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Subscribed => 2,
            ConnectionState::Authorized => 3,
            ConnectionState::Closing => 4,
            ConnectionState::Closed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    /// Handshake states only move forward. `Closing`/`Closed` are reachable
    /// from anywhere and never left (except `Closing -> Closed`). A live
    /// connection that loses its socket drops back to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match (self, next) {
            (ConnectionState::Closed, _) => false,
            (ConnectionState::Closing, ConnectionState::Closed) => true,
            (ConnectionState::Closing, _) => false,
            (_, ConnectionState::Closing) | (_, ConnectionState::Closed) => true,
            (current, ConnectionState::Disconnected) => current != ConnectionState::Disconnected,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Authorized => "authorized",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of `mining.authorize` as far as it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No result yet; mining may already be running on streamed work.
    Pending,
    Authorized,
    Rejected,
}
