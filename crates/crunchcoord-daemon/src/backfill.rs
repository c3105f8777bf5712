// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Paginated historical backfill into the parquet lake. Admission control
//! allows a single running job; the cursor makes an interrupted job
//! resumable from where it stopped. Backfill never mutates the live tape.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crunchcoord_core::entities::{BackfillJob, BackfillStatus};
use crunchcoord_core::{CoordError, CoordResult};

use crate::feeds::{to_feed_record, DataFeed, FeedError, FeedFetchRequest};
use crate::ids;
use crate::parquet_sink::ParquetSink;
use crate::store::{Store, StoreError};
use crate::telemetry::{AuditLog, Telemetry};

const TRANSIENT_RETRY_LIMIT: u32 = 3;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub source: String,
    pub subjects: Vec<String>,
    pub kind: String,
    pub granularity: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillResult {
    pub records_written: u64,
    pub pages_fetched: u64,
}

#[derive(Clone)]
pub struct BackfillService {
    store: Store,
    sink: ParquetSink,
    feed: Arc<dyn DataFeed>,
    page_size: u32,
    telemetry: Telemetry,
    audit: AuditLog,
}

impl BackfillService {
    pub fn new(
        store: Store,
        sink: ParquetSink,
        feed: Arc<dyn DataFeed>,
        page_size: u32,
        telemetry: Telemetry,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            sink,
            feed,
            page_size,
            telemetry,
            audit,
        }
    }

    /// Create a job row in `pending` and return it.
    pub fn create_job(&self, request: &BackfillRequest, now: DateTime<Utc>) -> CoordResult<BackfillJob> {
        if request.start >= request.end {
            return Err(CoordError::InvalidArgument(
                "backfill start must precede end".to_string(),
            ));
        }
        let job = BackfillJob {
            id: ids::backfill_job_id(now),
            source: request.source.clone(),
            subjects: request.subjects.clone(),
            kind: request.kind.clone(),
            granularity: request.granularity.clone(),
            start_ts: request.start,
            end_ts: request.end,
            cursor_ts: None,
            records_written: 0,
            pages_fetched: 0,
            status: BackfillStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_backfill_job(&job).map_err(internal)?;
        Ok(job)
    }

    /// Run a job to completion. Takes the single-runner admission slot, then
    /// paginates from the cursor. A transient page failure retries a bounded
    /// number of times; exhaustion or a permanent failure marks the job
    /// `failed` with the error and raises an operator alert.
    pub async fn run_job(&self, job_id: &str) -> CoordResult<BackfillResult> {
        let job = self
            .store
            .backfill_job(job_id)
            .map_err(internal)?
            .ok_or_else(|| CoordError::NotFound(format!("backfill job {job_id}")))?;

        match self.store.start_backfill_job(job_id, Utc::now()) {
            Ok(()) => {}
            Err(StoreError::AdmissionDenied(reason)) => {
                return Err(CoordError::AdmissionDenied(reason));
            }
            Err(err) => return Err(internal(err)),
        }
        self.audit
            .event("backfill_started", json!({"job_id": job_id}));

        match self.paginate(&job).await {
            Ok(result) => {
                self.store
                    .finish_backfill_job(job_id, BackfillStatus::Completed, None, Utc::now())
                    .map_err(internal)?;
                self.audit.event(
                    "backfill_completed",
                    json!({
                        "job_id": job_id,
                        "records_written": result.records_written,
                        "pages_fetched": result.pages_fetched,
                    }),
                );
                tracing::info!(
                    job_id=%job_id,
                    records=%result.records_written,
                    pages=%result.pages_fetched,
                    "backfill completed"
                );
                Ok(result)
            }
            Err(err) => {
                let reason = err.to_string();
                self.store
                    .finish_backfill_job(job_id, BackfillStatus::Failed, Some(&reason), Utc::now())
                    .map_err(internal)?;
                self.audit.event(
                    "backfill_failed",
                    json!({"job_id": job_id, "error": reason}),
                );
                tracing::error!(job_id=%job_id, error=%reason, "backfill failed");
                Err(err)
            }
        }
    }

    async fn paginate(&self, job: &BackfillJob) -> CoordResult<BackfillResult> {
        let mut result = BackfillResult {
            records_written: job.records_written,
            pages_fetched: job.pages_fetched,
        };
        let end_ts = job.end_ts.timestamp();

        for subject in &job.subjects {
            // Resume from the persisted cursor on restart.
            let mut cursor = job.cursor_ts.map(|c| c.timestamp()).unwrap_or_else(|| job.start_ts.timestamp());

            while cursor < end_ts {
                let request = FeedFetchRequest {
                    subjects: vec![subject.clone()],
                    kind: job.kind.clone(),
                    granularity: job.granularity.clone(),
                    start_ts: Some(cursor),
                    end_ts: Some(end_ts),
                    limit: Some(self.page_size),
                };

                let page = self.fetch_with_retry(&request).await?;
                result.pages_fetched += 1;
                if page.is_empty() {
                    break;
                }

                let now = Utc::now();
                let records: Vec<_> = page.iter().map(|r| to_feed_record(r, now)).collect();
                let written = self.sink.append_records(&records)?;
                result.records_written += written;
                self.telemetry.record_backfill_page(written);

                let max_ts = page.iter().map(|r| r.ts_event).max().unwrap_or(cursor);
                let next_cursor = max_ts + 1;
                if next_cursor <= cursor {
                    break;
                }
                cursor = next_cursor;

                self.store
                    .update_backfill_progress(
                        &job.id,
                        crate::feeds::ts_from_unix(cursor),
                        result.records_written,
                        result.pages_fetched,
                        now,
                    )
                    .map_err(internal)?;

                tracing::info!(
                    job_id=%job.id,
                    subject=%subject,
                    wrote=%written,
                    cursor=%cursor,
                    "backfill page"
                );
            }
        }
        Ok(result)
    }

    async fn fetch_with_retry(
        &self,
        request: &FeedFetchRequest,
    ) -> CoordResult<Vec<crate::feeds::FeedDataRecord>> {
        let mut attempt = 0u32;
        loop {
            match self.feed.fetch(request).await {
                Ok(page) => return Ok(page),
                Err(FeedError::Transient(reason)) if attempt < TRANSIENT_RETRY_LIMIT => {
                    attempt += 1;
                    tracing::warn!(attempt=%attempt, error=%reason, "backfill page fetch failed, retrying");
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY * attempt).await;
                }
                Err(err) => {
                    return Err(CoordError::Internal(err.to_string()));
                }
            }
        }
    }
}

fn internal(err: StoreError) -> CoordError {
    CoordError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::synthetic::SyntheticFeed;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn service(store: Store, dir: &TempDir) -> BackfillService {
        BackfillService::new(
            store,
            ParquetSink::new(dir.path().join("backfill")),
            Arc::new(SyntheticFeed::default()),
            100,
            Telemetry::new(),
            AuditLog::new(dir.path().join("audit")),
        )
    }

    fn request() -> BackfillRequest {
        BackfillRequest {
            source: "synthetic".to_string(),
            subjects: vec!["BTC".to_string()],
            kind: "candle".to_string(),
            granularity: "1m".to_string(),
            start: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn job_paginates_and_completes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let service = service(store.clone(), &dir);

        let job = service.create_job(&request(), Utc::now()).unwrap();
        let result = service.run_job(&job.id).await.unwrap();

        // Six hours of 1m candles at 100 per page.
        assert_eq!(result.records_written, 361);
        assert!(result.pages_fetched >= 4);

        let finished = store.backfill_job(&job.id).unwrap().unwrap();
        assert_eq!(finished.status, BackfillStatus::Completed);
        assert!(finished.cursor_ts.is_some());
        assert_eq!(finished.records_written, 361);
    }

    #[tokio::test]
    async fn second_job_is_denied_while_first_runs() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let service = service(store.clone(), &dir);

        let now = Utc::now();
        let job_a = service.create_job(&request(), now).unwrap();
        let job_b = service
            .create_job(&request(), now + chrono::Duration::seconds(1))
            .unwrap();

        store.start_backfill_job(&job_a.id, now).unwrap();
        let err = service.run_job(&job_b.id).await.unwrap_err();
        assert!(matches!(err, CoordError::AdmissionDenied(_)));
    }

    #[test]
    fn create_job_rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let service = service(store, &dir);

        let mut bad = request();
        bad.end = bad.start;
        let err = service.create_job(&bad, Utc::now()).unwrap_err();
        assert!(matches!(err, CoordError::InvalidArgument(_)));
    }
}
