// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Identifier construction. Ids embed the creating timestamp so rows sort
//! naturally and operators can read them.

use chrono::{DateTime, Utc};

fn stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S_%6f").to_string()
}

pub fn input_id(ts: DateTime<Utc>) -> String {
    format!("INP_{}", stamp(ts))
}

pub fn prediction_id(model_id: &str, scope_key: &str, ts: DateTime<Utc>) -> String {
    let safe_key: String = scope_key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("PRE_{model_id}_{safe_key}_{}", stamp(ts))
}

pub fn snapshot_id(model_id: &str, ts: DateTime<Utc>) -> String {
    format!("SNAP_{model_id}_{}", stamp(ts))
}

pub fn cycle_id(ts: DateTime<Utc>) -> String {
    format!("CYC_{}", stamp(ts))
}

pub fn checkpoint_id(ts: DateTime<Utc>) -> String {
    format!("CKP_{}", stamp(ts))
}

pub fn merkle_node_id(owner_id: &str, level: u32, position: u32) -> String {
    format!("MRK_{owner_id}_{level}_{position}")
}

pub fn leaderboard_id(ts: DateTime<Utc>) -> String {
    format!("LDB_{}", stamp(ts))
}

pub fn backfill_job_id(ts: DateTime<Utc>) -> String {
    format!("BFJ_{}", stamp(ts))
}

pub fn feed_record_id(scope: &crunchcoord_core::entities::FeedScope, ts_event: DateTime<Utc>) -> String {
    format!(
        "FR_{}_{}_{}_{}_{}",
        scope.source,
        scope.subject,
        scope.kind,
        scope.granularity,
        ts_event.timestamp()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ids_embed_timestamp_and_sanitize_scope_keys() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(input_id(ts), "INP_20260301_123005_000000");
        let pred = prediction_id("model-1", "btc/5m step", ts);
        assert!(pred.starts_with("PRE_model-1_btc_5m_step_"));
    }
}
