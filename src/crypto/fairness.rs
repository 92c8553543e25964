use serde::{Deserialize, Serialize};

use crate::constants::{
    HASH_SIGNIFICANT_BITS, HIGH_OUTCOME_THRESHOLD, HIGH_OUTCOME_TOLERANCE, INSTANT_BUST_MODULUS,
};
use crate::crypto::hash::{hmac_sha256_hex, sha256_hex};

/// Outcome classification exposed downstream. A mismatch is data, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Scam,
}

/// Whether the revealed secret hashes to the commitment published at round start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentCheck {
    Verified,
    Mismatch,
    /// No commitment was seen for this round (e.g. joined mid-round).
    Unknown,
}

/// Whether a new round's commitment equals the previous round's revealed secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainLink {
    Linked,
    Broken,
    /// Nothing revealed yet since connecting.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub computed: i64,
    pub declared: f64,
    pub verdict: Verdict,
    pub commitment: CommitmentCheck,
}

impl Verification {
    pub fn is_fair(&self) -> bool {
        self.verdict == Verdict::Ok && self.commitment != CommitmentCheck::Mismatch
    }
}

// Internal helper that folds hex digits into `value mod modulus` without overflow.
fn hex_residue(hash: &str, modulus: u32) -> Option<u32> {
    hash.chars().try_fold(0u32, |acc, c| {
        let digit = c.to_digit(16)?;
        Some((acc * 16 + digit) % modulus)
    })
}

// Internal helper that maps the top 52 bits of a hash to a x100 crash point.
fn outcome_from_bits(h: u64) -> i64 {
    let e = 2f64.powi(HASH_SIGNIFICANT_BITS as i32);
    let h = h as f64;
    ((100.0 * e - h) / (e - h)).floor() as i64
}

/// Crash point (x100) encoded by a hex digest, or `None` when the input is not
/// hex or carries fewer than 52 bits.
pub fn outcome_from_hash(hash: &str) -> Option<i64> {
    let nibbles = (HASH_SIGNIFICANT_BITS / 4) as usize;
    if hash.len() < nibbles {
        return None;
    }
    if hex_residue(hash, INSTANT_BUST_MODULUS)? == 0 {
        return Some(0);
    }
    let h = u64::from_str_radix(hash.get(..nibbles)?, 16).ok()?;
    Some(outcome_from_bits(h))
}

/// Crash point (x100) of a round given its revealed secret.
pub fn crash_point(secret: &str, public_seed: &str) -> i64 {
    let hash = hmac_sha256_hex(secret, public_seed);
    // An HMAC hex digest is always 64 hex chars, so the fallback is never taken.
    outcome_from_hash(&hash).unwrap_or(0)
}

/// Exact match, except above 10000x where implementations may diverge in the
/// last float bits.
pub fn classify(computed: i64, declared: f64) -> Verdict {
    let computed = computed as f64;
    let diff = (computed - declared).abs();
    if diff == 0.0 || (computed > HIGH_OUTCOME_THRESHOLD && diff < HIGH_OUTCOME_TOLERANCE) {
        Verdict::Ok
    } else {
        Verdict::Scam
    }
}

pub fn check_commitment(secret: &str, secret_hash: Option<&str>) -> CommitmentCheck {
    match secret_hash {
        None => CommitmentCheck::Unknown,
        Some(expected) if sha256_hex(secret).eq_ignore_ascii_case(expected) => {
            CommitmentCheck::Verified
        }
        Some(_) => CommitmentCheck::Mismatch,
    }
}

pub fn check_chain_link(previous_secret: Option<&str>, commitment: &str) -> ChainLink {
    match previous_secret {
        None => ChainLink::Unknown,
        Some(secret) if secret.eq_ignore_ascii_case(commitment) => ChainLink::Linked,
        Some(_) => ChainLink::Broken,
    }
}

#[derive(Debug, Clone)]
pub struct FairnessVerifier {
    public_seed: String,
}

impl FairnessVerifier {
    pub fn new(public_seed: impl Into<String>) -> Self {
        Self {
            public_seed: public_seed.into(),
        }
    }

    pub fn crash_point(&self, secret: &str) -> i64 {
        crash_point(secret, &self.public_seed)
    }

    pub fn verify(&self, secret: &str, declared: f64, secret_hash: Option<&str>) -> Verification {
        let computed = self.crash_point(secret);
        let verification = Verification {
            computed,
            declared,
            verdict: classify(computed, declared),
            commitment: check_commitment(secret, secret_hash),
        };
        tracing::trace!(
            "Verified secret {}: computed={} declared={} -> {:?}",
            secret,
            computed,
            declared,
            verification.verdict
        );
        verification
    }
}
