//! # Pool Mining Engine
//!
//! The CPU side of the miner and the glue around it: proof-of-work hashers,
//! header assembly, the worker thread pool, the submission queue, ordered
//! shutdown and `MiningEngine`, which ties them to a pool connection.

pub mod facade;
pub mod header;
pub mod pow;
pub mod shutdown;
pub mod submission;
pub mod worker;

pub use facade::{
    EngineExit, EngineHandle, EngineOptions, EngineOutcome, EngineStatus, LogStatsSink, MiningEngine, ReconnectPolicy,
    StartError, StatsSink,
};
pub use pow::{hasher_by_name, ChainedHasher, PowHasher, Sha256dHasher, ALGORITHMS};
pub use shutdown::{LiveConnection, ShutdownCoordinator, ShutdownPhase, ShutdownSettings, TeardownParts, TeardownReport};
pub use submission::{submission_queue, SubmissionReceiver, SubmissionSender};
pub use worker::{JoinSummary, WorkerConfig, WorkerPool, DEFAULT_BATCH_SIZE};

#[cfg(test)]
mod tests;
