//! Proof-of-work capability.
//!
//! The engine only needs `hash(header, nonce) -> digest` to be deterministic;
//! share classification happens against the pool target elsewhere. Neither
//! hasher here is a consensus algorithm.

use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A deterministic digest over a header prefix and a nonce.
pub trait PowHasher: Send + Sync {
    fn name(&self) -> &'static str;

    fn hash(&self, header: &[u8], nonce: u32) -> [u8; 32];
}

/// Names accepted by [`hasher_by_name`].
pub const ALGORITHMS: &[&str] = &["chained", "sha256d"];

fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// SHA-256, then BLAKE3, then SHA-256 over `header || nonce_le`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChainedHasher;

impl PowHasher for ChainedHasher {
    fn name(&self) -> &'static str {
        "chained"
    }

    #[inline]
    fn hash(&self, header: &[u8], nonce: u32) -> [u8; 32] {
        let first = sha256_parts(&[header, &nonce.to_le_bytes()]);
        let second = blake3::hash(&first);
        sha256_parts(&[second.as_bytes()])
    }
}

/// Double SHA-256 over `header || nonce_le`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256dHasher;

impl PowHasher for Sha256dHasher {
    fn name(&self) -> &'static str {
        "sha256d"
    }

    #[inline]
    fn hash(&self, header: &[u8], nonce: u32) -> [u8; 32] {
        let first = sha256_parts(&[header, &nonce.to_le_bytes()]);
        sha256_parts(&[&first])
    }
}

pub fn hasher_by_name(name: &str) -> Option<Arc<dyn PowHasher>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "chained" => Some(Arc::new(ChainedHasher)),
        "sha256d" => Some(Arc::new(Sha256dHasher)),
        _ => None,
    }
}
