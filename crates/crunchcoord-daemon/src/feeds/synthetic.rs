// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use serde_json::{json, Map};

use super::{DataFeed, FeedDataRecord, FeedError, FeedFetchRequest};
use crate::config::granularity_seconds;

/// Deterministic offline source for development and tests: a slow sine wave
/// around a base price, one candle per granularity step. The same request
/// always produces the same records.
pub struct SyntheticFeed {
    pub base_price: f64,
    pub amplitude: f64,
    pub period_seconds: f64,
}

impl Default for SyntheticFeed {
    fn default() -> Self {
        Self {
            base_price: 100.0,
            amplitude: 10.0,
            period_seconds: 3600.0,
        }
    }
}

impl SyntheticFeed {
    pub fn price_at(&self, ts: i64) -> f64 {
        self.base_price
            + self.amplitude * (ts as f64 * std::f64::consts::TAU / self.period_seconds).sin()
    }
}

#[async_trait::async_trait]
impl DataFeed for SyntheticFeed {
    fn source(&self) -> &str {
        "synthetic"
    }

    async fn fetch(&self, request: &FeedFetchRequest) -> Result<Vec<FeedDataRecord>, FeedError> {
        let step = granularity_seconds(&request.granularity)
            .ok_or_else(|| {
                FeedError::Permanent(format!("unknown granularity `{}`", request.granularity))
            })? as i64;

        let end_ts = request
            .end_ts
            .ok_or_else(|| FeedError::Permanent("synthetic feed requires end_ts".to_string()))?;
        let start_ts = request.start_ts.unwrap_or(end_ts - step * 120);
        let limit = request.limit.unwrap_or(1000) as i64;

        let mut records = Vec::new();
        let mut ts = (start_ts / step) * step;
        if ts < start_ts {
            ts += step;
        }
        for subject in &request.subjects {
            let mut cursor = ts;
            let mut emitted = 0i64;
            while cursor <= end_ts && emitted < limit {
                let open = self.price_at(cursor);
                let close = self.price_at(cursor + step - 1);
                let mut values = Map::new();
                values.insert("open".to_string(), json!(open));
                values.insert("high".to_string(), json!(open.max(close) + 0.1));
                values.insert("low".to_string(), json!(open.min(close) - 0.1));
                values.insert("close".to_string(), json!(close));
                values.insert("volume".to_string(), json!(1.0));
                records.push(FeedDataRecord {
                    source: "synthetic".to_string(),
                    subject: subject.clone(),
                    kind: request.kind.clone(),
                    granularity: request.granularity.clone(),
                    ts_event: cursor,
                    values,
                    metadata: Map::new(),
                });
                cursor += step;
                emitted += 1;
            }
        }
        records.sort_by_key(|r| r.ts_event);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_is_deterministic_and_step_aligned() {
        let feed = SyntheticFeed::default();
        let request = FeedFetchRequest {
            subjects: vec!["BTC".to_string()],
            kind: "candle".to_string(),
            granularity: "1m".to_string(),
            start_ts: Some(90),
            end_ts: Some(600),
            limit: None,
        };

        let first = feed.fetch(&request).await.unwrap();
        let second = feed.fetch(&request).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert!(!first.is_empty());
        assert_eq!(first[0].ts_event % 60, 0);
        assert!(first[0].ts_event >= 90);
        assert_eq!(first[0].values["close"], second[0].values["close"]);
    }

    #[tokio::test]
    async fn fetch_respects_limit() {
        let feed = SyntheticFeed::default();
        let request = FeedFetchRequest {
            subjects: vec!["BTC".to_string()],
            kind: "candle".to_string(),
            granularity: "1m".to_string(),
            start_ts: Some(0),
            end_ts: Some(6000),
            limit: Some(5),
        };
        let records = feed.fetch(&request).await.unwrap();
        assert_eq!(records.len(), 5);
    }
}
