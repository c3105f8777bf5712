// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Data source adapters. Each adapter normalizes a provider's records into
//! the canonical feed shape; the worker and backfill service only speak the
//! trait.

pub mod binance;
pub mod synthetic;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crunchcoord_core::entities::{FeedRecord, FeedScope};
use crunchcoord_core::{CoordError, CoordResult};

/// Pull-mode request used by live polling, truth windows and backfill.
#[derive(Debug, Clone)]
pub struct FeedFetchRequest {
    pub subjects: Vec<String>,
    pub kind: String,
    pub granularity: String,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub limit: Option<u32>,
}

/// Provider-normalized record. `ts_event` is unix seconds.
#[derive(Debug, Clone)]
pub struct FeedDataRecord {
    pub source: String,
    pub subject: String,
    pub kind: String,
    pub granularity: String,
    pub ts_event: i64,
    pub values: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// Retried with backoff; the watermark stays put.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Not retried; surfaces as a failed job / operator alert.
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait DataFeed: Send + Sync {
    fn source(&self) -> &str;
    async fn fetch(&self, request: &FeedFetchRequest) -> Result<Vec<FeedDataRecord>, FeedError>;
}

/// Resolve a configured source name to an adapter. Unknown names fail fast
/// at startup.
pub fn create_feed(source: &str, fetch_timeout: Duration) -> CoordResult<Arc<dyn DataFeed>> {
    match source {
        "binance" => Ok(Arc::new(binance::BinanceFeed::new(fetch_timeout))),
        "synthetic" => Ok(Arc::new(synthetic::SyntheticFeed::default())),
        other => Err(CoordError::Config(format!("unknown feed source `{other}`"))),
    }
}

pub fn ts_from_unix(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

/// Normalize a provider record into a stored feed record.
pub fn to_feed_record(record: &FeedDataRecord, ingested_at: DateTime<Utc>) -> FeedRecord {
    let scope = FeedScope::new(
        record.source.clone(),
        record.subject.clone(),
        record.kind.clone(),
        record.granularity.clone(),
    );
    let ts_event = ts_from_unix(record.ts_event);
    FeedRecord {
        id: crate::ids::feed_record_id(&scope, ts_event),
        scope,
        ts_event,
        ts_ingested: ingested_at,
        values: record.values.clone(),
        meta: record.metadata.clone(),
    }
}
