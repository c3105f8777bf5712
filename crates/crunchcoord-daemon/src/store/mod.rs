// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! SQLite-backed transactional store. The store exclusively owns all
//! persisted entities; workers operate through scoped methods that commit
//! atomically. JSON-valued columns hold the competition-specific payloads.

mod feed;
mod merkle;
mod models;
mod pipeline;

pub use pipeline::ScoreTickCommit;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crunchcoord_core::canonical::ts_rfc3339;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("admission denied: {0}")]
    AdmissionDenied(String),
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feed_records (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    subject TEXT NOT NULL,
    kind TEXT NOT NULL,
    granularity TEXT NOT NULL,
    ts_event TEXT NOT NULL,
    ts_ingested TEXT NOT NULL,
    values_json TEXT NOT NULL DEFAULT '{}',
    meta_json TEXT NOT NULL DEFAULT '{}',
    UNIQUE (source, subject, kind, granularity, ts_event)
);
CREATE INDEX IF NOT EXISTS idx_feed_records_scope_ts
    ON feed_records (source, subject, kind, granularity, ts_event);

CREATE TABLE IF NOT EXISTS feed_ingestion_state (
    source TEXT NOT NULL,
    subject TEXT NOT NULL,
    kind TEXT NOT NULL,
    granularity TEXT NOT NULL,
    last_event_ts TEXT,
    updated_at TEXT NOT NULL,
    meta_json TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (source, subject, kind, granularity)
);

CREATE TABLE IF NOT EXISTS backfill_jobs (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    subjects_json TEXT NOT NULL,
    kind TEXT NOT NULL,
    granularity TEXT NOT NULL,
    start_ts TEXT NOT NULL,
    end_ts TEXT NOT NULL,
    cursor_ts TEXT,
    records_written INTEGER NOT NULL DEFAULT 0,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prediction_configs (
    id TEXT PRIMARY KEY,
    scope_key TEXT NOT NULL,
    scope_json TEXT NOT NULL,
    every_seconds INTEGER NOT NULL,
    resolve_after_seconds INTEGER,
    active INTEGER NOT NULL DEFAULT 1,
    ord INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS inputs (
    id TEXT PRIMARY KEY,
    config_id TEXT,
    scope_json TEXT NOT NULL,
    raw_input_json TEXT NOT NULL,
    actuals_json TEXT,
    status TEXT NOT NULL,
    performed_at TEXT NOT NULL,
    resolvable_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inputs_status_resolvable
    ON inputs (status, resolvable_at);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    input_id TEXT NOT NULL REFERENCES inputs (id),
    model_id TEXT NOT NULL,
    config_id TEXT,
    scope_key TEXT NOT NULL,
    scope_json TEXT NOT NULL,
    status TEXT NOT NULL,
    exec_time_us INTEGER NOT NULL DEFAULT 0,
    inference_output_json TEXT NOT NULL DEFAULT '{}',
    score_json TEXT,
    meta_json TEXT NOT NULL DEFAULT '{}',
    performed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_predictions_status ON predictions (status);
CREATE INDEX IF NOT EXISTS idx_predictions_model ON predictions (model_id, performed_at);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    prediction_count INTEGER NOT NULL DEFAULT 0,
    result_summary_json TEXT NOT NULL DEFAULT '{}',
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (model_id, period_end)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_model_period ON snapshots (model_id, period_end);

CREATE TABLE IF NOT EXISTS merkle_cycles (
    id TEXT PRIMARY KEY,
    previous_cycle_id TEXT,
    previous_cycle_root TEXT,
    snapshots_root TEXT NOT NULL,
    chained_root TEXT NOT NULL,
    snapshot_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_merkle_cycles_created ON merkle_cycles (created_at);

CREATE TABLE IF NOT EXISTS merkle_nodes (
    id TEXT PRIMARY KEY,
    cycle_id TEXT,
    checkpoint_id TEXT,
    level INTEGER NOT NULL,
    position INTEGER NOT NULL,
    hash TEXT NOT NULL,
    left_child_id TEXT,
    right_child_id TEXT,
    snapshot_id TEXT,
    snapshot_content_hash TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_merkle_nodes_cycle ON merkle_nodes (cycle_id);
CREATE INDEX IF NOT EXISTS idx_merkle_nodes_checkpoint ON merkle_nodes (checkpoint_id);
CREATE INDEX IF NOT EXISTS idx_merkle_nodes_snapshot ON merkle_nodes (snapshot_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    merkle_root TEXT,
    emission_json TEXT NOT NULL,
    status TEXT NOT NULL,
    tx_hash TEXT,
    meta_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    emitted_at TEXT
);

CREATE TABLE IF NOT EXISTS models (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    deployment_id TEXT NOT NULL DEFAULT '',
    owner_id TEXT NOT NULL DEFAULT '',
    owner_name TEXT NOT NULL DEFAULT '',
    overall_score_json TEXT,
    meta_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leaderboards (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    entries_json TEXT NOT NULL,
    meta_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS leases (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Take a named lease for `ttl`. Returns false when another live owner
    /// holds it; an expired lease is stolen.
    pub fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT owner, expires_at FROM leases WHERE name = ?1",
                rusqlite::params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((current_owner, expires_at)) = existing {
            if current_owner != owner && expires_at > ts_rfc3339(now) {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT INTO leases (name, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET owner = ?2, expires_at = ?3",
            rusqlite::params![name, owner, ts_rfc3339(now + ttl)],
        )?;
        Ok(true)
    }

    pub fn release_lease(&self, name: &str, owner: &str) -> StoreResult<()> {
        self.lock().execute(
            "DELETE FROM leases WHERE name = ?1 AND owner = ?2",
            rusqlite::params![name, owner],
        )?;
        Ok(())
    }
}

pub(crate) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("unparseable timestamp `{raw}`")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(&r)).transpose()
}

pub(crate) fn json_object(
    raw: &str,
) -> StoreResult<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(StoreError::Corrupt(format!(
            "expected JSON object, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(store.acquire_lease("score-tick", "worker-a", ttl, now).unwrap());
        assert!(!store.acquire_lease("score-tick", "worker-b", ttl, now).unwrap());
        // The holder can renew.
        assert!(store.acquire_lease("score-tick", "worker-a", ttl, now).unwrap());

        // After expiry anyone can steal it.
        let later = now + Duration::seconds(60);
        assert!(store.acquire_lease("score-tick", "worker-b", ttl, later).unwrap());

        store.release_lease("score-tick", "worker-b").unwrap();
        assert!(store.acquire_lease("score-tick", "worker-c", ttl, later).unwrap());
    }
}
