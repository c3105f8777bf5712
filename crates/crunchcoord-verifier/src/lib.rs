// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dependency-light verification of crunchcoord tamper evidence.
//!
//! Everything here operates on lowercase hex digests so an auditor can verify
//! a proof straight from the reporting API without touching the coordinator's
//! store. Pair hashing is `SHA256(utf8(left_hex || right_hex))`.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("cycle {index}: chained_root mismatch (expected {expected}, stored {stored})")]
    ChainedRootMismatch {
        index: usize,
        expected: String,
        stored: String,
    },
    #[error("cycle {index}: previous_cycle_root does not match predecessor chained_root")]
    BrokenLink { index: usize },
}

/// Sibling side relative to the node being proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub position: Side,
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash two hex digests together: `SHA256(left || right)` over the UTF-8
/// concatenation of the hex strings.
pub fn sha256_concat(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Root convention for a cycle that produced no leaves.
pub fn empty_tree_root() -> String {
    sha256_hex(b"")
}

/// Recompute the root from a leaf and its sibling path.
pub fn resolve_proof(leaf_hash: &str, path: &[ProofStep]) -> String {
    let mut current = leaf_hash.to_string();
    for step in path {
        current = match step.position {
            Side::Right => sha256_concat(&current, &step.hash),
            Side::Left => sha256_concat(&step.hash, &current),
        };
    }
    current
}

/// Verify a Merkle inclusion proof against an expected root.
pub fn verify_inclusion_proof(leaf_hash: &str, path: &[ProofStep], expected_root: &str) -> bool {
    resolve_proof(leaf_hash, path) == expected_root
}

/// Chaining rule for score cycles. The first cycle chains to the empty
/// string, so its chained root is `SHA256(snapshots_root)`.
pub fn chained_root(previous_chained_root: Option<&str>, snapshots_root: &str) -> String {
    sha256_concat(previous_chained_root.unwrap_or(""), snapshots_root)
}

/// One cycle's commitment fields as served by the reporting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCommitment {
    pub previous_cycle_root: Option<String>,
    pub snapshots_root: String,
    pub chained_root: String,
}

/// Verify an ordered run of cycle commitments. Detects both a recomputed
/// chained root that no longer matches and a broken predecessor link, which
/// is what a retroactive snapshot edit produces.
pub fn verify_cycle_chain(cycles: &[CycleCommitment]) -> Result<(), ChainError> {
    let mut previous: Option<&str> = None;
    for (index, cycle) in cycles.iter().enumerate() {
        if index > 0 && cycle.previous_cycle_root.as_deref() != previous {
            return Err(ChainError::BrokenLink { index });
        }
        let expected = chained_root(cycle.previous_cycle_root.as_deref(), &cycle.snapshots_root);
        if expected != cycle.chained_root {
            return Err(ChainError::ChainedRootMismatch {
                index,
                expected,
                stored: cycle.chained_root.clone(),
            });
        }
        previous = Some(cycle.chained_root.as_str());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(seed: &str) -> String {
        sha256_hex(seed.as_bytes())
    }

    #[test]
    fn proof_resolves_left_and_right_siblings() {
        let a = leaf("a");
        let b = leaf("b");
        let root = sha256_concat(&a, &b);

        let proof_for_a = vec![ProofStep {
            hash: b.clone(),
            position: Side::Right,
        }];
        assert!(verify_inclusion_proof(&a, &proof_for_a, &root));

        let proof_for_b = vec![ProofStep {
            hash: a.clone(),
            position: Side::Left,
        }];
        assert!(verify_inclusion_proof(&b, &proof_for_b, &root));

        assert!(!verify_inclusion_proof(&b, &proof_for_a, &root));
    }

    #[test]
    fn first_cycle_chains_to_empty_string() {
        let snapshots_root = leaf("root");
        assert_eq!(
            chained_root(None, &snapshots_root),
            sha256_concat("", &snapshots_root)
        );
    }

    #[test]
    fn chain_verification_flags_retro_edit() {
        let r1 = leaf("cycle-1");
        let c1 = chained_root(None, &r1);
        let r2 = leaf("cycle-2");
        let c2 = chained_root(Some(&c1), &r2);
        let r3 = leaf("cycle-3");
        let c3 = chained_root(Some(&c2), &r3);

        let mut cycles = vec![
            CycleCommitment {
                previous_cycle_root: None,
                snapshots_root: r1,
                chained_root: c1.clone(),
            },
            CycleCommitment {
                previous_cycle_root: Some(c1),
                snapshots_root: r2,
                chained_root: c2.clone(),
            },
            CycleCommitment {
                previous_cycle_root: Some(c2),
                snapshots_root: r3,
                chained_root: c3,
            },
        ];
        verify_cycle_chain(&cycles).unwrap();

        // Tampering with the middle cycle's leaves breaks cycle 2's root and
        // cycle 3's link.
        cycles[1].snapshots_root = leaf("tampered");
        let err = verify_cycle_chain(&cycles).unwrap_err();
        assert!(matches!(
            err,
            ChainError::ChainedRootMismatch { index: 1, .. }
        ));
    }

    #[test]
    fn empty_root_is_hash_of_empty_bytes() {
        assert_eq!(
            empty_tree_root(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
