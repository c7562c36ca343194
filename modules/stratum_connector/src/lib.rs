//! # Pool Stratum Connector
//!
//! Everything on the network side of the miner: the line-delimited JSON-RPC
//! wire format, the pool session (`ProtocolClient`), the `JobBoard` through
//! which work reaches the hashing threads, difficulty-to-target conversion and
//! the shared engine counters.

pub mod client;
pub mod error;
pub mod job_board;
pub mod messages;
pub mod stats;
pub mod target;
pub mod types;

pub use client::{ClientSettings, ProtocolClient, ReceiveOutcome, SocketCloser};
pub use error::{ConnectError, ConnectResult, ProtocolError, SubmitError};
pub use job_board::{BoardSnapshot, JobBoard};
pub use stats::{EngineStats, HashrateMeter, StatsSnapshot};
pub use target::{is_share, Difficulty, Target};
pub use types::{AuthStatus, ConnectionState, Extranonce, Job, PoolEndpoint, ShareCandidate};

#[cfg(test)]
mod tests;
