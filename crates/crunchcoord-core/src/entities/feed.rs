// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The four dimensions that identify one ingestion tape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedScope {
    pub source: String,
    pub subject: String,
    pub kind: String,
    pub granularity: String,
}

impl FeedScope {
    pub fn new(
        source: impl Into<String>,
        subject: impl Into<String>,
        kind: impl Into<String>,
        granularity: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            kind: kind.into(),
            granularity: granularity.into(),
        }
    }
}

impl fmt::Display for FeedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.source, self.subject, self.kind, self.granularity
        )
    }
}

/// One observation from an external data source. `(scope, ts_event)` is
/// unique; records are never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub id: String,
    #[serde(flatten)]
    pub scope: FeedScope,
    pub ts_event: DateTime<Utc>,
    pub ts_ingested: DateTime<Utc>,
    pub values: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl FeedRecord {
    /// Preferred price for tick-or-candle payloads.
    pub fn close_price(&self) -> Option<f64> {
        for key in ["close", "price"] {
            if let Some(v) = self.values.get(key).and_then(Value::as_f64) {
                return Some(v);
            }
        }
        None
    }
}

/// High-water mark per ingestion tape. Monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedIngestionState {
    pub scope: FeedScope,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Running => "running",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BackfillStatus::Pending),
            "running" => Some(BackfillStatus::Running),
            "completed" => Some(BackfillStatus::Completed),
            "failed" => Some(BackfillStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }
}

/// A paginated historical ingestion job. At most one job is `running`
/// system-wide; `cursor_ts` makes a restart resumable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: String,
    pub source: String,
    pub subjects: Vec<String>,
    pub kind: String,
    pub granularity: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub cursor_ts: Option<DateTime<Utc>>,
    pub records_written: u64,
    pub pages_fetched: u64,
    pub status: BackfillStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn close_price_prefers_close_over_price() {
        let mut values = Map::new();
        values.insert("price".to_string(), json!(99.0));
        values.insert("close".to_string(), json!(101.5));
        let record = FeedRecord {
            id: "FR_1".to_string(),
            scope: FeedScope::new("binance", "BTC", "candle", "1m"),
            ts_event: Utc::now(),
            ts_ingested: Utc::now(),
            values,
            meta: Map::new(),
        };
        assert_eq!(record.close_price(), Some(101.5));
    }

    #[test]
    fn backfill_status_round_trips() {
        for status in [
            BackfillStatus::Pending,
            BackfillStatus::Running,
            BackfillStatus::Completed,
            BackfillStatus::Failed,
        ] {
            assert_eq!(BackfillStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BackfillStatus::parse("bogus"), None);
    }
}
