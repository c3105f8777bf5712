// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crunchcoord_core::canonical::ts_rfc3339;
use crunchcoord_core::entities::{BackfillJob, BackfillStatus, FeedRecord, FeedScope};

use super::{json_object, parse_opt_ts, parse_ts, Store, StoreError, StoreResult};

fn feed_record_from_row(row: &Row<'_>) -> rusqlite::Result<(FeedRecord, String, String)> {
    Ok((
        FeedRecord {
            id: row.get(0)?,
            scope: FeedScope {
                source: row.get(1)?,
                subject: row.get(2)?,
                kind: row.get(3)?,
                granularity: row.get(4)?,
            },
            ts_event: Utc::now(),    // replaced below from the raw column
            ts_ingested: Utc::now(), // replaced below from the raw column
            values: serde_json::Map::new(),
            meta: serde_json::Map::new(),
        },
        row.get::<_, String>(5)?,
        row.get::<_, String>(6)?,
    ))
}

impl Store {
    /// Insert a batch of feed records and advance the scope watermark in one
    /// transaction. Conflicting `(scope, ts_event)` rows keep the existing
    /// record, so replay is a no-op; the watermark never moves backwards.
    pub fn ingest_feed_batch(
        &self,
        scope: &FeedScope,
        records: &[FeedRecord],
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut inserted = 0u64;
        let mut max_ts: Option<DateTime<Utc>> = None;
        for record in records {
            let changed = tx.execute(
                "INSERT INTO feed_records
                     (id, source, subject, kind, granularity, ts_event, ts_ingested, values_json, meta_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (source, subject, kind, granularity, ts_event) DO NOTHING",
                params![
                    record.id,
                    record.scope.source,
                    record.scope.subject,
                    record.scope.kind,
                    record.scope.granularity,
                    ts_rfc3339(record.ts_event),
                    ts_rfc3339(record.ts_ingested),
                    serde_json::Value::Object(record.values.clone()).to_string(),
                    serde_json::Value::Object(record.meta.clone()).to_string(),
                ],
            )?;
            inserted += changed as u64;
            max_ts = Some(max_ts.map_or(record.ts_event, |m: DateTime<Utc>| m.max(record.ts_event)));
        }

        if let Some(max_ts) = max_ts {
            tx.execute(
                "INSERT INTO feed_ingestion_state
                     (source, subject, kind, granularity, last_event_ts, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (source, subject, kind, granularity) DO UPDATE
                     SET last_event_ts = MAX(COALESCE(last_event_ts, ''), excluded.last_event_ts),
                         updated_at = excluded.updated_at",
                params![
                    scope.source,
                    scope.subject,
                    scope.kind,
                    scope.granularity,
                    ts_rfc3339(max_ts),
                    ts_rfc3339(now),
                ],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    pub fn watermark(&self, scope: &FeedScope) -> StoreResult<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = self
            .lock()
            .query_row(
                "SELECT last_event_ts FROM feed_ingestion_state
                 WHERE source = ?1 AND subject = ?2 AND kind = ?3 AND granularity = ?4",
                params![scope.source, scope.subject, scope.kind, scope.granularity],
                |row| row.get(0),
            )
            .optional()?;
        parse_opt_ts(raw.flatten())
    }

    /// Most recent `limit` records for a scope, oldest first.
    pub fn recent_feed_records(&self, scope: &FeedScope, limit: u32) -> StoreResult<Vec<FeedRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, subject, kind, granularity, ts_event, ts_ingested, values_json, meta_json
             FROM feed_records
             WHERE source = ?1 AND subject = ?2 AND kind = ?3 AND granularity = ?4
             ORDER BY ts_event DESC LIMIT ?5",
        )?;
        let mut records = collect_feed_records(stmt.query_map(
            params![scope.source, scope.subject, scope.kind, scope.granularity, limit],
            row_to_parts,
        )?)?;
        records.reverse();
        Ok(records)
    }

    /// Records with `start <= ts_event <= end`, oldest first.
    pub fn feed_window(
        &self,
        scope: &FeedScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<FeedRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, subject, kind, granularity, ts_event, ts_ingested, values_json, meta_json
             FROM feed_records
             WHERE source = ?1 AND subject = ?2 AND kind = ?3 AND granularity = ?4
               AND ts_event >= ?5 AND ts_event <= ?6
             ORDER BY ts_event ASC",
        )?;
        let records = collect_feed_records(stmt.query_map(
            params![
                scope.source,
                scope.subject,
                scope.kind,
                scope.granularity,
                ts_rfc3339(start),
                ts_rfc3339(end)
            ],
            row_to_parts,
        )?)?;
        Ok(records)
    }

    /// Retention: drop records older than the cutoff. Merkle nodes are never
    /// touched by this.
    pub fn prune_feed_records(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let deleted = self.lock().execute(
            "DELETE FROM feed_records WHERE ts_event < ?1",
            params![ts_rfc3339(cutoff)],
        )?;
        Ok(deleted as u64)
    }

    // ── backfill jobs ──

    /// Create a job in `pending`. Admission control lives in
    /// [`Store::start_backfill_job`].
    pub fn create_backfill_job(&self, job: &BackfillJob) -> StoreResult<()> {
        self.lock().execute(
            "INSERT INTO backfill_jobs
                 (id, source, subjects_json, kind, granularity, start_ts, end_ts, cursor_ts,
                  records_written, pages_fetched, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.source,
                serde_json::to_string(&job.subjects)?,
                job.kind,
                job.granularity,
                ts_rfc3339(job.start_ts),
                ts_rfc3339(job.end_ts),
                job.cursor_ts.map(ts_rfc3339),
                job.records_written,
                job.pages_fetched,
                job.status.as_str(),
                job.error,
                ts_rfc3339(job.created_at),
                ts_rfc3339(job.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Flip a job to `running`, enforcing the single-runner admission rule
    /// inside one transaction.
    pub fn start_backfill_job(&self, job_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let running: Option<String> = tx
            .query_row(
                "SELECT id FROM backfill_jobs WHERE status = 'running' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(running_id) = running {
            if running_id != job_id {
                return Err(StoreError::AdmissionDenied(format!(
                    "backfill job {running_id} is already running"
                )));
            }
        }

        let changed = tx.execute(
            "UPDATE backfill_jobs SET status = 'running', updated_at = ?2 WHERE id = ?1",
            params![job_id, ts_rfc3339(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("backfill job {job_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_backfill_progress(
        &self,
        job_id: &str,
        cursor_ts: DateTime<Utc>,
        records_written: u64,
        pages_fetched: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.lock().execute(
            "UPDATE backfill_jobs
             SET cursor_ts = ?2, records_written = ?3, pages_fetched = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                job_id,
                ts_rfc3339(cursor_ts),
                records_written,
                pages_fetched,
                ts_rfc3339(now)
            ],
        )?;
        Ok(())
    }

    pub fn finish_backfill_job(
        &self,
        job_id: &str,
        status: BackfillStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.lock().execute(
            "UPDATE backfill_jobs SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![job_id, status.as_str(), error, ts_rfc3339(now)],
        )?;
        Ok(())
    }

    pub fn backfill_job(&self, job_id: &str) -> StoreResult<Option<BackfillJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, subjects_json, kind, granularity, start_ts, end_ts, cursor_ts,
                    records_written, pages_fetched, status, error, created_at, updated_at
             FROM backfill_jobs WHERE id = ?1",
        )?;
        let row = stmt
            .query_map(params![job_id], backfill_row_to_parts)?
            .next()
            .transpose()?;
        row.map(backfill_job_from_parts).transpose()
    }

    pub fn list_backfill_jobs(&self, limit: u32) -> StoreResult<Vec<BackfillJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source, subjects_json, kind, granularity, start_ts, end_ts, cursor_ts,
                    records_written, pages_fetched, status, error, created_at, updated_at
             FROM backfill_jobs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], backfill_row_to_parts)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(backfill_job_from_parts(row?)?);
        }
        Ok(jobs)
    }
}

type FeedRowParts = (FeedRecord, String, String, String, String);

fn row_to_parts(row: &Row<'_>) -> rusqlite::Result<FeedRowParts> {
    let (record, ts_event_raw, ts_ingested_raw) = feed_record_from_row(row)?;
    Ok((
        record,
        ts_event_raw,
        ts_ingested_raw,
        row.get::<_, String>(7)?,
        row.get::<_, String>(8)?,
    ))
}

fn collect_feed_records(
    rows: impl Iterator<Item = rusqlite::Result<FeedRowParts>>,
) -> StoreResult<Vec<FeedRecord>> {
    let mut records = Vec::new();
    for row in rows {
        let (mut record, ts_event_raw, ts_ingested_raw, values_raw, meta_raw) = row?;
        record.ts_event = parse_ts(&ts_event_raw)?;
        record.ts_ingested = parse_ts(&ts_ingested_raw)?;
        record.values = json_object(&values_raw)?;
        record.meta = json_object(&meta_raw)?;
        records.push(record);
    }
    Ok(records)
}

type BackfillRowParts = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    u64,
    u64,
    String,
    Option<String>,
    String,
    String,
);

fn backfill_row_to_parts(row: &Row<'_>) -> rusqlite::Result<BackfillRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn backfill_job_from_parts(parts: BackfillRowParts) -> StoreResult<BackfillJob> {
    let (
        id,
        source,
        subjects_json,
        kind,
        granularity,
        start_raw,
        end_raw,
        cursor_raw,
        records_written,
        pages_fetched,
        status_raw,
        error,
        created_raw,
        updated_raw,
    ) = parts;
    Ok(BackfillJob {
        id,
        source,
        subjects: serde_json::from_str(&subjects_json)?,
        kind,
        granularity,
        start_ts: parse_ts(&start_raw)?,
        end_ts: parse_ts(&end_raw)?,
        cursor_ts: parse_opt_ts(cursor_raw)?,
        records_written,
        pages_fetched,
        status: BackfillStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown backfill status `{status_raw}`")))?,
        error,
        created_at: parse_ts(&created_raw)?,
        updated_at: parse_ts(&updated_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn scope() -> FeedScope {
        FeedScope::new("binance", "BTC", "candle", "1m")
    }

    fn record(minute: u32, close: f64) -> FeedRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap();
        let mut values = serde_json::Map::new();
        values.insert("close".to_string(), json!(close));
        FeedRecord {
            id: crate::ids::feed_record_id(&scope(), ts),
            scope: scope(),
            ts_event: ts,
            ts_ingested: ts,
            values,
            meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn ingest_is_idempotent_and_watermark_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let batch = vec![record(0, 100.0), record(1, 101.0)];

        assert_eq!(store.ingest_feed_batch(&scope(), &batch, now).unwrap(), 2);
        let w1 = store.watermark(&scope()).unwrap().unwrap();

        // Replaying the same batch inserts nothing and leaves the watermark.
        assert_eq!(store.ingest_feed_batch(&scope(), &batch, now).unwrap(), 0);
        assert_eq!(store.watermark(&scope()).unwrap().unwrap(), w1);

        // Newer records advance it.
        assert_eq!(
            store
                .ingest_feed_batch(&scope(), &[record(2, 102.0)], now)
                .unwrap(),
            1
        );
        assert!(store.watermark(&scope()).unwrap().unwrap() > w1);
    }

    #[test]
    fn windows_and_recent_queries_are_ordered() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let batch: Vec<FeedRecord> = (0..5).map(|m| record(m, 100.0 + m as f64)).collect();
        store.ingest_feed_batch(&scope(), &batch, now).unwrap();

        let recent = store.recent_feed_records(&scope(), 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].ts_event < recent[2].ts_event);
        assert_eq!(recent[2].close_price(), Some(104.0));

        let window = store
            .feed_window(&scope(), batch[1].ts_event, batch[3].ts_event)
            .unwrap();
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn backfill_admission_allows_one_running_job() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let job = |id: &str| BackfillJob {
            id: id.to_string(),
            source: "binance".to_string(),
            subjects: vec!["BTC".to_string()],
            kind: "candle".to_string(),
            granularity: "1m".to_string(),
            start_ts: now - chrono::Duration::days(2),
            end_ts: now,
            cursor_ts: None,
            records_written: 0,
            pages_fetched: 0,
            status: BackfillStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };

        store.create_backfill_job(&job("BFJ_a")).unwrap();
        store.create_backfill_job(&job("BFJ_b")).unwrap();

        store.start_backfill_job("BFJ_a", now).unwrap();
        let err = store.start_backfill_job("BFJ_b", now).unwrap_err();
        assert!(matches!(err, StoreError::AdmissionDenied(_)));

        store
            .finish_backfill_job("BFJ_a", BackfillStatus::Completed, None, now)
            .unwrap();
        store.start_backfill_job("BFJ_b", now).unwrap();

        let fetched = store.backfill_job("BFJ_b").unwrap().unwrap();
        assert_eq!(fetched.status, BackfillStatus::Running);
    }

    #[test]
    fn prune_respects_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let batch: Vec<FeedRecord> = (0..4).map(|m| record(m, 100.0)).collect();
        store.ingest_feed_batch(&scope(), &batch, now).unwrap();

        let cutoff = batch[2].ts_event;
        assert_eq!(store.prune_feed_records(cutoff).unwrap(), 2);
        let remaining = store.recent_feed_records(&scope(), 10).unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
