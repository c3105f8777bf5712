// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![forbid(unsafe_code)]

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod pb {
    pub mod v1 {
        tonic::include_proto!("crunchcoord.runner.v1");
    }

    pub use v1::*;
}

pub const PROTOCOL_SEMVER: &str = "1.0.0";

/// frac64 reward encoding: 1_000_000_000 == 100%.
pub const FRAC64_MULTIPLIER: u64 = 1_000_000_000;

pub const DOMAIN_SNAPSHOT_HASH: &[u8] = b"crunchcoord:snapshot:v1";
pub const DOMAIN_CYCLE_CHAIN: &[u8] = b"crunchcoord:cycle_chain:v1";

/// Convert a percentage (0..=100) to frac64, truncating toward zero.
#[must_use]
pub fn pct_to_frac64(pct: f64) -> u64 {
    if !pct.is_finite() || pct <= 0.0 {
        return 0;
    }
    let frac = pct / 100.0 * FRAC64_MULTIPLIER as f64;
    frac.min(FRAC64_MULTIPLIER as f64) as u64
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    EOk = 0,
    EInvalidArgument = 1,
    ENotFound = 2,
    EInvalidState = 3,
    EEmissionImbalance = 4,
    EAdmissionDenied = 5,
    EConfig = 6,
    EInternal = 7,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reward line for one ranked participant. `reward_pct` is frac64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CruncherReward {
    pub cruncher_index: u32,
    pub reward_pct: u64,
}

/// Reward line for an infrastructure provider wallet. `reward_pct` is frac64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReward {
    pub provider: String,
    pub reward_pct: u64,
}

/// Settlement-facing checkpoint payload. Signed and submitted elsewhere;
/// the coordinator only produces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionPayload {
    pub crunch: String,
    pub cruncher_rewards: Vec<CruncherReward>,
    pub compute_provider_rewards: Vec<ProviderReward>,
    pub data_provider_rewards: Vec<ProviderReward>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmissionError {
    #[error("cruncher rewards sum to {actual}, expected {expected}")]
    Imbalanced { actual: u64, expected: u64 },
    #[error("duplicate cruncher_index {0}")]
    DuplicateIndex(u32),
}

impl EmissionPayload {
    pub fn empty(crunch: impl Into<String>) -> Self {
        Self {
            crunch: crunch.into(),
            cruncher_rewards: Vec::new(),
            compute_provider_rewards: Vec::new(),
            data_provider_rewards: Vec::new(),
        }
    }

    /// Check the frac64 conservation invariant. An empty reward list is
    /// valid (a checkpoint over a period with no ranked models).
    pub fn validate(&self) -> Result<(), EmissionError> {
        if self.cruncher_rewards.is_empty() {
            return Ok(());
        }
        let mut seen = std::collections::BTreeSet::new();
        for reward in &self.cruncher_rewards {
            if !seen.insert(reward.cruncher_index) {
                return Err(EmissionError::DuplicateIndex(reward.cruncher_index));
            }
        }
        let total: u64 = self.cruncher_rewards.iter().map(|r| r.reward_pct).sum();
        if total != FRAC64_MULTIPLIER {
            return Err(EmissionError::Imbalanced {
                actual: total,
                expected: FRAC64_MULTIPLIER,
            });
        }
        Ok(())
    }
}

/// Returns `SHA256(domain || payload)` as lowercase hex.
///
/// Shared by the coordinator and external verifiers; do not modify without
/// a coordinated protocol version bump.
#[must_use]
pub fn sha256_domain_hex(domain: &[u8], payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_to_frac64_handles_bounds() {
        assert_eq!(pct_to_frac64(100.0), FRAC64_MULTIPLIER);
        assert_eq!(pct_to_frac64(35.0), 350_000_000);
        assert_eq!(pct_to_frac64(0.0), 0);
        assert_eq!(pct_to_frac64(-3.0), 0);
        assert_eq!(pct_to_frac64(f64::NAN), 0);
        assert_eq!(pct_to_frac64(250.0), FRAC64_MULTIPLIER);
    }

    #[test]
    fn emission_validation_enforces_conservation() {
        let mut payload = EmissionPayload::empty("crunch-pubkey");
        payload.validate().unwrap();

        payload.cruncher_rewards = vec![
            CruncherReward {
                cruncher_index: 0,
                reward_pct: 600_000_000,
            },
            CruncherReward {
                cruncher_index: 1,
                reward_pct: 400_000_000,
            },
        ];
        payload.validate().unwrap();

        payload.cruncher_rewards[1].reward_pct = 399_999_999;
        assert_eq!(
            payload.validate().unwrap_err(),
            EmissionError::Imbalanced {
                actual: 999_999_999,
                expected: FRAC64_MULTIPLIER
            }
        );
    }

    #[test]
    fn emission_validation_rejects_duplicate_indexes() {
        let mut payload = EmissionPayload::empty("crunch-pubkey");
        payload.cruncher_rewards = vec![
            CruncherReward {
                cruncher_index: 3,
                reward_pct: 500_000_000,
            },
            CruncherReward {
                cruncher_index: 3,
                reward_pct: 500_000_000,
            },
        ];
        assert_eq!(
            payload.validate().unwrap_err(),
            EmissionError::DuplicateIndex(3)
        );
    }

    #[test]
    fn payload_serializes_to_settlement_shape() {
        let payload = EmissionPayload {
            crunch: "crunch-pubkey".to_string(),
            cruncher_rewards: vec![CruncherReward {
                cruncher_index: 0,
                reward_pct: FRAC64_MULTIPLIER,
            }],
            compute_provider_rewards: vec![ProviderReward {
                provider: "cp-wallet".to_string(),
                reward_pct: FRAC64_MULTIPLIER,
            }],
            data_provider_rewards: vec![],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["crunch"], "crunch-pubkey");
        assert_eq!(value["cruncher_rewards"][0]["reward_pct"], 1_000_000_000u64);
        assert_eq!(value["compute_provider_rewards"][0]["provider"], "cp-wallet");
    }

    #[test]
    fn sha256_domain_matches_snapshot() {
        let digest = sha256_domain_hex(b"crunchcoord:test:v1", b"payload");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_domain_hex(b"crunchcoord:test:v1", b"payload"));
    }
}
