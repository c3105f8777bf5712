// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reward emission builders. All strategies must satisfy the frac64
//! conservation invariant; the checkpoint builder validates before persist
//! and aborts the checkpoint on violation.

use crunchcoord_protocol::{
    pct_to_frac64, CruncherReward, EmissionPayload, ProviderReward, FRAC64_MULTIPLIER,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One model's aggregate standing over a checkpoint period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedModelEntry {
    pub rank: u32,
    pub model_id: String,
    pub model_name: Option<String>,
    pub cruncher_name: Option<String>,
    pub prediction_count: u64,
    pub snapshot_count: u64,
    pub result_summary: BTreeMap<String, f64>,
}

/// On-chain identities attached to every emission. Opaque to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmissionParties {
    pub crunch: String,
    pub compute_provider: Option<String>,
    pub data_provider: Option<String>,
}

pub type EmissionStrategyFn = fn(&[RankedModelEntry], &EmissionParties) -> EmissionPayload;

/// Base tier shares in frac64: 35% to rank 1, 10% to ranks 2-5, 5% to
/// ranks 6-10, nothing below.
const TIER_SHARES: [u64; 10] = [
    350_000_000,
    100_000_000,
    100_000_000,
    100_000_000,
    100_000_000,
    50_000_000,
    50_000_000,
    50_000_000,
    50_000_000,
    50_000_000,
];

/// Default emission: tier schedule with unfilled tiers redistributed
/// equally across the ranked entries. Integer rounding drift lands on
/// rank 1 so the total is exact.
pub fn tier_schedule_emission(
    ranked: &[RankedModelEntry],
    parties: &EmissionParties,
) -> EmissionPayload {
    let mut payload = EmissionPayload::empty(parties.crunch.clone());
    attach_provider_rewards(&mut payload, parties);

    let paid = ranked.len().min(TIER_SHARES.len());
    if paid == 0 {
        return payload;
    }

    let mut shares: Vec<u64> = TIER_SHARES[..paid].to_vec();
    let assigned: u64 = shares.iter().sum();
    let residual = FRAC64_MULTIPLIER - assigned;
    let per_entry = residual / paid as u64;
    for share in &mut shares {
        *share += per_entry;
    }
    shares[0] += residual - per_entry * paid as u64;

    payload.cruncher_rewards = shares
        .into_iter()
        .enumerate()
        .map(|(index, reward_pct)| CruncherReward {
            cruncher_index: index as u32,
            reward_pct,
        })
        .collect();
    payload
}

/// Blend weights for [`contribution_weighted_emission`]. The three weights
/// must sum to 1.0.
#[derive(Debug, Clone, Copy)]
pub struct ContributionWeights {
    pub rank_weight: f64,
    pub contribution_weight: f64,
    pub diversity_weight: f64,
    /// Minimum reward percentage per model before re-normalization.
    pub min_pct: f64,
}

impl Default for ContributionWeights {
    fn default() -> Self {
        Self {
            rank_weight: 0.5,
            contribution_weight: 0.3,
            diversity_weight: 0.2,
            min_pct: 1.0,
        }
    }
}

/// Alternative emission that blends inverse rank, ensemble contribution and
/// diversity (1 − model_correlation) into a composite share.
pub fn contribution_weighted_emission(
    ranked: &[RankedModelEntry],
    parties: &EmissionParties,
) -> EmissionPayload {
    contribution_weighted_emission_with(ranked, parties, ContributionWeights::default())
}

pub fn contribution_weighted_emission_with(
    ranked: &[RankedModelEntry],
    parties: &EmissionParties,
    weights: ContributionWeights,
) -> EmissionPayload {
    let mut payload = EmissionPayload::empty(parties.crunch.clone());
    attach_provider_rewards(&mut payload, parties);

    let n = ranked.len();
    if n == 0 {
        return payload;
    }

    let contributions: Vec<f64> = ranked
        .iter()
        .map(|e| e.result_summary.get("contribution").copied().unwrap_or(0.0))
        .collect();
    let correlations: Vec<f64> = ranked
        .iter()
        .map(|e| {
            e.result_summary
                .get("model_correlation")
                .copied()
                .unwrap_or(0.0)
        })
        .collect();

    let normalize = |values: &[f64]| -> Vec<f64> {
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max - min < 1e-12 {
            return vec![1.0 / n as f64; n];
        }
        values.iter().map(|v| (v - min) / (max - min)).collect()
    };

    let rank_scores = normalize(
        &ranked
            .iter()
            .map(|e| 1.0 / e.rank.max(1) as f64)
            .collect::<Vec<f64>>(),
    );
    let contribution_scores = normalize(&contributions);
    let diversity_scores = normalize(&correlations.iter().map(|c| 1.0 - c).collect::<Vec<f64>>());

    let composite: Vec<f64> = (0..n)
        .map(|i| {
            weights.rank_weight * rank_scores[i]
                + weights.contribution_weight * contribution_scores[i]
                + weights.diversity_weight * diversity_scores[i]
        })
        .collect();

    let total: f64 = composite.iter().sum();
    let mut raw_pcts: Vec<f64> = if total < 1e-12 {
        vec![100.0 / n as f64; n]
    } else {
        composite
            .iter()
            .map(|c| (c / total * 100.0).max(weights.min_pct))
            .collect()
    };

    let pct_sum: f64 = raw_pcts.iter().sum();
    for pct in &mut raw_pcts {
        *pct = *pct / pct_sum * 100.0;
    }

    let mut frac64_values: Vec<u64> = raw_pcts.iter().map(|p| pct_to_frac64(*p)).collect();
    let drift = FRAC64_MULTIPLIER - frac64_values.iter().sum::<u64>();
    frac64_values[0] += drift;

    payload.cruncher_rewards = frac64_values
        .into_iter()
        .enumerate()
        .map(|(index, reward_pct)| CruncherReward {
            cruncher_index: index as u32,
            reward_pct,
        })
        .collect();
    payload
}

fn attach_provider_rewards(payload: &mut EmissionPayload, parties: &EmissionParties) {
    if let Some(provider) = &parties.compute_provider {
        payload.compute_provider_rewards = vec![ProviderReward {
            provider: provider.clone(),
            reward_pct: FRAC64_MULTIPLIER,
        }];
    }
    if let Some(provider) = &parties.data_provider {
        payload.data_provider_rewards = vec![ProviderReward {
            provider: provider.clone(),
            reward_pct: FRAC64_MULTIPLIER,
        }];
    }
}
