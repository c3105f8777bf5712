// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Live feed ingestion: poll the source past the watermark, upsert into the
//! tape, advance the watermark atomically, and wake the predict worker.
//! Transient source failures back off exponentially with jitter and leave
//! the watermark untouched.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crunchcoord_core::entities::FeedScope;
use crunchcoord_core::CoordResult;

use crate::bus::{Bus, Event};
use crate::feeds::{to_feed_record, DataFeed, FeedError, FeedFetchRequest};
use crate::store::Store;
use crate::telemetry::{AuditLog, Telemetry};

const MAX_BACKOFF_MULTIPLIER: u32 = 16;
const PRUNE_EVERY_POLLS: u64 = 60;

pub struct FeedWorker {
    store: Store,
    feed: Arc<dyn DataFeed>,
    scopes: Vec<FeedScope>,
    kind: String,
    granularity: String,
    poll_interval: Duration,
    record_ttl_days: i64,
    telemetry: Telemetry,
    audit: AuditLog,
    bus: Bus,
}

impl FeedWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        feed: Arc<dyn DataFeed>,
        subjects: &[String],
        kind: String,
        granularity: String,
        poll_interval: Duration,
        record_ttl_days: i64,
        telemetry: Telemetry,
        audit: AuditLog,
        bus: Bus,
    ) -> Self {
        let scopes = subjects
            .iter()
            .map(|subject| {
                FeedScope::new(
                    feed.source().to_string(),
                    subject.clone(),
                    kind.clone(),
                    granularity.clone(),
                )
            })
            .collect();
        Self {
            store,
            feed,
            scopes,
            kind,
            granularity,
            poll_interval,
            record_ttl_days,
            telemetry,
            audit,
            bus,
        }
    }

    /// One poll round over every scope. Returns the number of new records.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<u64, FeedError> {
        let mut total = 0u64;
        for scope in &self.scopes {
            total += self.poll_scope(scope, now).await?;
        }
        Ok(total)
    }

    async fn poll_scope(&self, scope: &FeedScope, now: DateTime<Utc>) -> Result<u64, FeedError> {
        let watermark = self
            .store
            .watermark(scope)
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let request = FeedFetchRequest {
            subjects: vec![scope.subject.clone()],
            kind: self.kind.clone(),
            granularity: self.granularity.clone(),
            start_ts: watermark.map(|w| w.timestamp() + 1),
            end_ts: Some(now.timestamp()),
            limit: None,
        };

        let fetched = self.feed.fetch(&request).await?;
        // Nothing at or below the watermark is ever inserted; replays are
        // no-ops at the unique index anyway, this keeps them off the wire.
        let records: Vec<_> = fetched
            .iter()
            .filter(|r| watermark.map_or(true, |w| r.ts_event > w.timestamp()))
            .map(|r| to_feed_record(r, now))
            .collect();
        if records.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .store
            .ingest_feed_batch(scope, &records, now)
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        if inserted > 0 {
            self.telemetry
                .record_feed_ingested(&scope.to_string(), inserted);
            self.bus.publish(Event::FeedUpdated {
                scope: scope.clone(),
                records: inserted,
            });
            tracing::info!(scope=%scope, records=%inserted, "feed batch ingested");
        }
        Ok(inserted)
    }

    pub fn prune(&self, now: DateTime<Utc>) -> CoordResult<u64> {
        let cutoff = now - ChronoDuration::days(self.record_ttl_days);
        let deleted = self
            .store
            .prune_feed_records(cutoff)
            .map_err(|e| crunchcoord_core::CoordError::Internal(e.to_string()))?;
        if deleted > 0 {
            tracing::info!(deleted=%deleted, cutoff=%cutoff, "pruned expired feed records");
        }
        Ok(deleted)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.audit.service("feed", "started", None);
        let mut backoff_multiplier = 1u32;
        let mut polls = 0u64;

        loop {
            let delay = if backoff_multiplier > 1 {
                let base = self.poll_interval * backoff_multiplier;
                let jitter = rand::thread_rng().gen_range(0..500);
                base + Duration::from_millis(jitter)
            } else {
                self.poll_interval
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            match self.poll_once(now).await {
                Ok(_) => {
                    backoff_multiplier = 1;
                }
                Err(FeedError::Transient(reason)) => {
                    backoff_multiplier = (backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
                    for scope in &self.scopes {
                        self.telemetry.record_feed_poll_failure(&scope.to_string());
                    }
                    tracing::warn!(
                        error=%reason,
                        backoff_multiplier=%backoff_multiplier,
                        "feed poll failed, backing off"
                    );
                }
                Err(FeedError::Permanent(reason)) => {
                    tracing::error!(error=%reason, "feed poll failed permanently");
                    self.audit.event(
                        "feed_source_alert",
                        serde_json::json!({"source": self.feed.source(), "error": reason}),
                    );
                }
            }

            polls += 1;
            if polls % PRUNE_EVERY_POLLS == 0 {
                if let Err(err) = self.prune(now) {
                    tracing::warn!(error=%err, "feed prune failed");
                }
            }
        }
        self.audit.service("feed", "stopped", None);
    }
}
