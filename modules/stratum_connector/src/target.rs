//! Pool difficulty and the 256-bit acceptance target derived from it.
//!
//! Pools speak in difficulty multipliers; workers compare digests against a
//! target. The two are related by
//!
//! ```text
//! target = (0xFFFF << 208) / difficulty
//! ```
//!
//! Difficulty is a rational number on the wire (`5000`, `0.5`, `1024.25`), so
//! the division is done exactly: the `f64` is decomposed into
//! `mantissa * 2^exponent` and the quotient is computed with `BigUint`.

use crate::error::ProtocolError;
use num_bigint::BigUint;
use num_traits::{Float, ToPrimitive, Zero};
use std::fmt;

/// Bits the difficulty-1 mantissa is shifted by.
const DIFF1_SHIFT: usize = 208;

fn diff1_target() -> BigUint {
    BigUint::from(0xFFFFu32) << DIFF1_SHIFT
}

/// Pool-assigned work scaling factor. Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Difficulty in effect before the pool sends `mining.set_difficulty`.
    pub const ONE: Self = Self(1.0);

    pub fn new(value: f64) -> Result<Self, ProtocolError> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(ProtocolError::InvalidDifficulty(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn to_target(self) -> Target {
        Target::from_difficulty(self)
    }

    /// Difficulty a digest would satisfy, for share logging.
    ///
    /// Returns `f64::INFINITY` for an all-zero digest.
    pub fn from_digest(digest: &[u8; 32]) -> f64 {
        let value = BigUint::from_bytes_be(digest);
        if value.is_zero() {
            return f64::INFINITY;
        }
        let numerator = diff1_target().to_f64().unwrap_or(f64::MAX);
        let denominator = value.to_f64().unwrap_or(f64::MAX);
        numerator / denominator
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit acceptance threshold, stored big-endian.
///
/// Byte-wise ordering of big-endian arrays equals numeric ordering, so the
/// derived `Ord` compares targets numerically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    pub const MAX: Self = Self([0xFF; 32]);

    /// Exact `(0xFFFF << 208) / difficulty`, saturating at `2^256 - 1`.
    pub fn from_difficulty(difficulty: Difficulty) -> Self {
        let (mantissa, exponent, _sign) = difficulty.0.integer_decode();
        let mantissa = BigUint::from(mantissa);
        let quotient = if exponent < 0 {
            (diff1_target() << (-(exponent as i32)) as usize) / mantissa
        } else {
            diff1_target() / (mantissa << exponent as usize)
        };
        Self::from_biguint(&quotient)
    }

    /// Saturates values wider than 256 bits to [`Target::MAX`].
    pub fn from_biguint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return Self::MAX;
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(out)
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }
}

impl Default for Target {
    fn default() -> Self {
        Difficulty::ONE.to_target()
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", hex::encode(self.0))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// `true` iff the digest, read as a big-endian integer, is strictly below the target.
#[inline(always)]
pub fn is_share(digest: &[u8; 32], target: &Target) -> bool {
    digest < &target.0
}
