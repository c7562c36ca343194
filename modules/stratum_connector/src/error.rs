//! Error taxonomy for the pool connection.
//!
//! `ConnectError` is fatal to one connection attempt and feeds the engine's
//! reconnect policy. `ProtocolError` is always recovered locally (the line is
//! skipped, the previous target is kept). `SubmitError` drops the share.

use thiserror::Error;

/// Failure to bring up a pool session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP connect refused, timed out, or the pool hung up mid-handshake.
    #[error("pool unreachable: {0}")]
    Unreachable(String),

    /// The subscribe response did not carry `[subscriptions, extranonce1, extranonce2_size]`.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    /// Neither an authorize result nor any work arrived within `auth_wait`.
    #[error("no authorize result or work within {0:?}")]
    AuthTimeout(std::time::Duration),

    /// The pool answered the authorize request with `false` or an error.
    #[error("pool refused authorization: {0}")]
    Unauthorized(String),
}

/// A pool message that could not be applied.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("invalid difficulty {0}")]
    InvalidDifficulty(f64),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Failure to hand a share to the pool.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("submit timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Submissions were stopped because the connection is shutting down.
    #[error("submissions closed")]
    Closed,
}

pub type ConnectResult<T> = Result<T, ConnectError>;
