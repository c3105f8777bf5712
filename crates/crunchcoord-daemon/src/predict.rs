// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Predict orchestration: fire scheduled configs, build inference inputs
//! from the feed tape, fan out to every live model, classify outcomes and
//! commit each cycle atomically.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crunchcoord_core::contract::{CrunchConfig, FrozenCallables};
use crunchcoord_core::entities::{
    FeedScope, InputRecord, InputStatus, PredictionRecord, PredictionStatus,
    ScheduledPredictionConfig,
};
use crunchcoord_core::CoordResult;

use crate::bus::{Bus, Event};
use crate::ids;
use crate::runner::{ModelCallResult, ModelRunner};
use crate::store::Store;
use crate::telemetry::{AuditLog, Telemetry};

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub fired: u32,
    pub skipped: u32,
    pub predictions: u32,
}

pub struct PredictOrchestrator {
    store: Store,
    runner: Arc<ModelRunner>,
    callables: FrozenCallables,
    contract: CrunchConfig,
    feed_source: String,
    feed_kind: String,
    feed_granularity: String,
    feed_interval_seconds: u64,
    telemetry: Telemetry,
    audit: AuditLog,
    next_run: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PredictOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        runner: Arc<ModelRunner>,
        callables: FrozenCallables,
        contract: CrunchConfig,
        feed_source: String,
        feed_kind: String,
        feed_granularity: String,
        feed_interval_seconds: u64,
        telemetry: Telemetry,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            runner,
            callables,
            contract,
            feed_source,
            feed_kind,
            feed_granularity,
            feed_interval_seconds,
            telemetry,
            audit,
            next_run: Mutex::new(HashMap::new()),
        }
    }

    fn feed_scope_for(&self, subject: &str) -> FeedScope {
        FeedScope::new(
            self.feed_source.clone(),
            subject.to_string(),
            self.feed_kind.clone(),
            self.feed_granularity.clone(),
        )
    }

    /// One pass over all active configs. The scheduler guarantees one call
    /// per tick; within a call each config fires at most once.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CoordResult<CycleReport> {
        let configs = self.store.active_prediction_configs().map_err(internal)?;
        let mut report = CycleReport::default();

        for config in configs {
            if !self.due(&config, now) {
                continue;
            }

            match self.fire_config(&config, now).await {
                Ok(Some(count)) => {
                    report.fired += 1;
                    report.predictions += count;
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    report.skipped += 1;
                    tracing::error!(config_id=%config.id, error=%err, "prediction cycle failed");
                    self.telemetry
                        .record_predict_cycle_skipped(&config.id, "error");
                    self.audit.event(
                        "predict_cycle_failed",
                        json!({"config_id": config.id, "error": err.to_string()}),
                    );
                }
            }

            self.next_run
                .lock()
                .insert(config.id.clone(), config.schedule.next_fire(now));
        }

        Ok(report)
    }

    fn due(&self, config: &ScheduledPredictionConfig, now: DateTime<Utc>) -> bool {
        self.next_run
            .lock()
            .get(&config.id)
            .map(|next| now >= *next)
            .unwrap_or(true)
    }

    /// Returns `Ok(Some(predictions))` when a cycle committed, `Ok(None)`
    /// when the cycle was skipped without side effects.
    async fn fire_config(
        &self,
        config: &ScheduledPredictionConfig,
        now: DateTime<Utc>,
    ) -> CoordResult<Option<u32>> {
        let resolve_after = config.schedule.resolve_after(config.scope.horizon_seconds);
        if resolve_after <= self.feed_interval_seconds {
            tracing::warn!(
                config_id=%config.id,
                resolve_after_seconds=%resolve_after,
                feed_interval_seconds=%self.feed_interval_seconds,
                "resolve_after_seconds does not exceed the feed interval; predictions for this config will never score"
            );
        }

        let feed_scope = self.feed_scope_for(&config.scope.subject);
        let window = self
            .store
            .recent_feed_records(&feed_scope, self.contract.input_window as u32)
            .map_err(internal)?;
        if window.is_empty() {
            tracing::info!(config_id=%config.id, scope=%feed_scope, "no feed data, skipping cycle");
            self.telemetry
                .record_predict_cycle_skipped(&config.id, "no_feed_data");
            return Ok(None);
        }

        // Fail closed: a rejected input produces no persistence side effects.
        let inference_input = match self.callables.input_builder.build(&window, &config.scope) {
            Ok(input) => input,
            Err(err) => {
                tracing::error!(config_id=%config.id, error=%err, "inference input rejected");
                self.telemetry
                    .record_predict_cycle_skipped(&config.id, "input_rejected");
                self.audit.event(
                    "inference_input_rejected",
                    json!({"config_id": config.id, "error": err.to_string()}),
                );
                return Ok(None);
            }
        };

        let input = InputRecord {
            id: ids::input_id(now),
            config_id: Some(config.id.clone()),
            scope: config.scope.clone(),
            raw_input: inference_input.clone(),
            actuals: None,
            status: InputStatus::Received,
            performed_at: now,
            resolvable_at: now + ChronoDuration::seconds(resolve_after as i64),
        };

        let scope_value = serde_json::to_value(&config.scope).map_err(|e| {
            crunchcoord_core::CoordError::Internal(format!("scope encoding failed: {e}"))
        })?;
        let outcomes = self
            .runner
            .fan_out(&inference_input, &config.scope_key, &scope_value, true)
            .await;

        let mut predictions = Vec::with_capacity(outcomes.len());
        for (model_id, outcome) in outcomes {
            let (status, output, exec_time_us, score) = match outcome {
                ModelCallResult::Replied { output, exec_time_us } => {
                    match self.callables.output_validator.validate(&output) {
                        Ok(normalized) => (PredictionStatus::Pending, normalized, exec_time_us, None),
                        Err(reason) => {
                            self.runner.note_validation_failure(&model_id);
                            tracing::warn!(model_id=%model_id, reason=%reason, "inference output rejected");
                            (
                                PredictionStatus::Failed,
                                json!({"raw_output": output}),
                                exec_time_us,
                                Some(crunchcoord_core::entities::ScoreOutcome::failure(reason)),
                            )
                        }
                    }
                }
                ModelCallResult::Failed { reason } => (
                    PredictionStatus::Failed,
                    json!({}),
                    0,
                    Some(crunchcoord_core::entities::ScoreOutcome::failure(reason)),
                ),
                ModelCallResult::TimedOut => (
                    PredictionStatus::Failed,
                    json!({}),
                    0,
                    Some(crunchcoord_core::entities::ScoreOutcome::failure("timeout")),
                ),
                ModelCallResult::Absent => (PredictionStatus::Absent, json!({}), 0, None),
            };

            self.telemetry.record_predictions(status.as_str(), 1);
            predictions.push(PredictionRecord {
                id: ids::prediction_id(&model_id, &config.scope_key, now),
                input_id: input.id.clone(),
                model_id,
                config_id: Some(config.id.clone()),
                scope_key: config.scope_key.clone(),
                scope: config.scope.clone(),
                status,
                exec_time_us,
                inference_output: output,
                score,
                meta: serde_json::Map::new(),
                performed_at: now,
            });
        }

        // An empty live set still persists the input so scoring and the
        // Merkle chain advance a tick.
        self.store
            .commit_predict_cycle(&input, &predictions)
            .map_err(internal)?;

        self.telemetry.record_predict_cycle(&config.id);
        tracing::info!(
            config_id=%config.id,
            input_id=%input.id,
            predictions=%predictions.len(),
            "prediction cycle committed"
        );
        Ok(Some(predictions.len() as u32))
    }

    /// Interval loop with event-driven wake-ups from the feed worker.
    pub async fn run(
        self: Arc<Self>,
        bus: Bus,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.audit.service("predict", "started", None);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = bus.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                event = events.recv() => {
                    match event {
                        Ok(Event::FeedUpdated { .. }) => {}
                        Ok(_) => continue,
                        Err(_) => continue,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.run_cycle(Utc::now()).await {
                tracing::error!(error=%err, "predict loop error");
                self.audit
                    .service("predict", "error", Some(&err.to_string()));
            }
        }
        self.audit.service("predict", "stopped", None);
    }
}

fn internal(err: crate::store::StoreError) -> crunchcoord_core::CoordError {
    crunchcoord_core::CoordError::Internal(err.to_string())
}
