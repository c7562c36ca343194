//! Block header assembly from a pool job.
//!
//! ```text
//! coinbase    = coinb1 || extranonce1 || extranonce2 || coinb2
//! merkle_root = fold(sha256d(coinbase), |root, branch| sha256d(root || branch))
//! prefix      = version || prevhash || merkle_root || ntime || nbits
//! ```
//!
//! The nonce is appended by the hasher, so workers hash `prefix` repeatedly.

use pool_stratum_connector::{Extranonce, Job};
use sha2::{Digest, Sha256};

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn coinbase(job: &Job, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(job.coinbase_part1.len() + extranonce1.len() + extranonce2.len() + job.coinbase_part2.len());
    out.extend_from_slice(&job.coinbase_part1);
    out.extend_from_slice(extranonce1);
    out.extend_from_slice(extranonce2);
    out.extend_from_slice(&job.coinbase_part2);
    out
}

pub fn merkle_root(coinbase: &[u8], branches: &[Vec<u8>]) -> [u8; 32] {
    let mut root = sha256d(coinbase);
    let mut buf = Vec::with_capacity(64);
    for branch in branches {
        buf.clear();
        buf.extend_from_slice(&root);
        buf.extend_from_slice(branch);
        root = sha256d(&buf);
    }
    root
}

/// Header bytes without the nonce for one `(job, extranonce2)` pair.
pub fn header_prefix(job: &Job, extranonce: &Extranonce, extranonce2: &[u8]) -> Vec<u8> {
    let root = merkle_root(&coinbase(job, &extranonce.extranonce1, extranonce2), &job.merkle_branches);
    let mut out = Vec::with_capacity(
        job.version.len() + job.previous_block_hash.len() + root.len() + job.time.len() + job.bits.len(),
    );
    out.extend_from_slice(&job.version);
    out.extend_from_slice(&job.previous_block_hash);
    out.extend_from_slice(&root);
    out.extend_from_slice(&job.time);
    out.extend_from_slice(&job.bits);
    out
}

/// Big-endian `counter`, left-padded or truncated to `size` bytes.
pub fn extranonce2_bytes(counter: u64, size: usize) -> Vec<u8> {
    let be = counter.to_be_bytes();
    if size >= be.len() {
        let mut out = vec![0u8; size - be.len()];
        out.extend_from_slice(&be);
        out
    } else {
        be[be.len() - size..].to_vec()
    }
}
