//! Hash-based variant assignment.
//!
//! A session's bucket is a pure function of `(experiment_id, session_id)`:
//! SHA-256 over both ids (separated by a unit-separator byte), the first
//! eight bytes read big-endian, and the top 53 bits scaled into `[0, 1)`.
//! The bucket is then located on the cumulative allocation weights.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Variant;

/// How an assignment was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Hashed,
    /// Loaded from a persisted assignment record.
    Pinned,
    /// One-shot override to control after a guard-rail breach.
    GuardRail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub session_id: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub source: AssignmentSource,
}

/// Stable bucket in `[0, 1)` for a session within an experiment.
pub fn bucket(experiment_id: &str, session_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(session_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// The variant whose cumulative weight interval contains `bucket`.
///
/// Zero-weight variants are never chosen. If rounding leaves the bucket
/// past the final boundary, the last positively weighted variant wins.
pub fn choose_variant(variants: &[Variant], bucket: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for v in variants {
        cumulative += v.allocation_weight;
        if bucket < cumulative {
            return Some(v);
        }
    }
    variants.iter().rev().find(|v| v.allocation_weight > 0.0)
}
