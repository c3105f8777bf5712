// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! The score engine. Each tick runs the full loop in order: resolve inputs
//! whose horizon elapsed, score pending predictions against ground truth,
//! write per-model snapshots with multi-metric enrichment, compute ensemble
//! virtual models, commit the Merkle cycle and rebuild the leaderboard.
//! Everything a tick produces lands in one transaction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use crunchcoord_core::canonical::snapshot_content_hash;
use crunchcoord_core::contract::{CrunchConfig, FrozenCallables, RankingDirection};
use crunchcoord_core::ensemble::{
    apply_model_filter, build_ensemble_predictions, compute_weights, ensemble_model_id,
    is_ensemble_model,
};
use crunchcoord_core::entities::{
    FeedScope, InputRecord, LeaderboardEntry, LeaderboardRecord, Model, PredictionRecord,
    PredictionStatus, ScoreOutcome, SnapshotRecord,
};
use crunchcoord_core::merkle::{
    build_tree, chained_root, empty_tree_root, root_hash, MerkleCycleRecord, MerkleNodeRecord,
    TreeNode,
};
use crunchcoord_core::metrics::{MetricsContext, MetricsRegistry, PredictionView, ScoreView};
use crunchcoord_core::{CoordError, CoordResult};

use crate::bus::{Bus, Event};
use crate::ids;
use crate::store::{ScoreTickCommit, Store, StoreError};
use crate::telemetry::{AuditLog, Telemetry};

const NO_GROUND_TRUTH: &str = "no ground truth";

#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub inputs_resolved: u64,
    pub inputs_expired: u64,
    pub predictions_scored: u64,
    pub predictions_failed: u64,
    pub snapshots_written: u64,
    pub cycle_id: Option<String>,
}

pub struct ScoreEngine {
    store: Store,
    callables: FrozenCallables,
    contract: CrunchConfig,
    metrics: MetricsRegistry,
    feed_source: String,
    feed_kind: String,
    feed_granularity: String,
    grace: ChronoDuration,
    input_ttl: ChronoDuration,
    telemetry: Telemetry,
    audit: AuditLog,
    bus: Bus,
}

impl ScoreEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        callables: FrozenCallables,
        contract: CrunchConfig,
        metrics: MetricsRegistry,
        feed_source: String,
        feed_kind: String,
        feed_granularity: String,
        feed_interval_seconds: u64,
        input_ttl: std::time::Duration,
        telemetry: Telemetry,
        audit: AuditLog,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            callables,
            contract,
            metrics,
            feed_source,
            feed_kind,
            feed_granularity,
            grace: ChronoDuration::seconds(feed_interval_seconds as i64),
            input_ttl: ChronoDuration::seconds(input_ttl.as_secs() as i64),
            telemetry,
            audit,
            bus,
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

    /// One tick, phases in order. A tick that finds no work commits nothing,
    /// so replays are no-ops; a tick that did work always advances the
    /// Merkle chain, even with zero snapshots.
    pub fn run_tick(&self, now: DateTime<Utc>) -> CoordResult<TickReport> {
        let mut report = TickReport::default();

        // Phase A: resolve inputs past their horizon.
        self.resolve_inputs(now, &mut report)?;

        // Phase B: score pending predictions whose input resolved.
        let scored_pairs = self.score_predictions(now, &mut report)?;

        if report.inputs_resolved == 0
            && report.inputs_expired == 0
            && scored_pairs.is_empty()
            && report.predictions_failed == 0
        {
            return Ok(report);
        }

        let mut updated_predictions: Vec<PredictionRecord> = Vec::new();
        let mut inputs_by_id: BTreeMap<String, InputRecord> = BTreeMap::new();
        let mut scored: Vec<PredictionRecord> = Vec::new();
        for (prediction, input) in scored_pairs {
            inputs_by_id.insert(input.id.clone(), input);
            if prediction.status == PredictionStatus::Scored {
                scored.push(prediction.clone());
            }
            updated_predictions.push(prediction);
        }

        // Phases C + D: snapshots with metric enrichment for real models.
        let context = self.build_metrics_context(&scored, now);
        let mut snapshots = Vec::new();
        let mut summaries: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let by_model = group_by_model(&scored);
        for (model_id, predictions) in &by_model {
            let snapshot =
                self.build_snapshot(model_id, predictions, &context, &[], now)?;
            summaries.insert(model_id.clone(), numeric_summary(&snapshot.result_summary));
            snapshots.push(snapshot);
        }

        // Phase E: ensemble virtual models.
        let mut new_predictions = Vec::new();
        self.compute_ensembles(
            &scored,
            &inputs_by_id,
            &summaries,
            &context,
            now,
            &mut new_predictions,
            &mut snapshots,
        )?;

        report.snapshots_written = snapshots.len() as u64;

        // Phase F: Merkle cycle commit, chained to the previous cycle.
        let (cycle, nodes) = self.build_cycle(&snapshots, now)?;
        let cycle_id = cycle.id.clone();

        // Phase G: leaderboard rebuild from latest snapshots.
        let leaderboard = self.build_leaderboard(&snapshots, now)?;

        let commit = ScoreTickCommit {
            updated_predictions,
            new_predictions,
            snapshots,
            cycle: Some(cycle),
            nodes,
            leaderboard: Some(leaderboard),
        };
        self.store.commit_score_tick(&commit).map_err(internal)?;

        self.telemetry.record_snapshots_written(report.snapshots_written);
        self.bus.publish(Event::CycleScored {
            cycle_id: cycle_id.clone(),
        });
        self.audit.event(
            "score_tick",
            json!({
                "cycle_id": cycle_id,
                "inputs_resolved": report.inputs_resolved,
                "predictions_scored": report.predictions_scored,
                "snapshots": report.snapshots_written,
            }),
        );
        report.cycle_id = Some(cycle_id);
        Ok(report)
    }

    // ── Phase A ──

    fn resolve_inputs(&self, now: DateTime<Utc>, report: &mut TickReport) -> CoordResult<()> {
        let unresolved = self.store.unresolved_inputs(now).map_err(internal)?;
        if unresolved.is_empty() {
            return Ok(());
        }

        let mut resolutions: Vec<(String, Option<Value>)> = Vec::new();
        let mut expired: Vec<String> = Vec::new();
        for input in &unresolved {
            let scope = self.feed_scope_for(&input.scope.subject);
            let window = self
                .store
                .feed_window(
                    &scope,
                    input.performed_at - self.grace,
                    input.resolvable_at + self.grace,
                )
                .map_err(internal)?;

            match self.callables.ground_truth.resolve(&input.scope, &window) {
                Some(actuals) => {
                    resolutions.push((input.id.clone(), Some(actuals)));
                    report.inputs_resolved += 1;
                }
                None => {
                    // Bounded retry: past the TTL the input resolves to the
                    // null sentinel and its predictions fail.
                    if now - input.performed_at > self.input_ttl {
                        resolutions.push((input.id.clone(), None));
                        expired.push(input.id.clone());
                        report.inputs_expired += 1;
                    }
                }
            }
        }

        if !resolutions.is_empty() {
            self.store.resolve_inputs(&resolutions).map_err(internal)?;
        }
        for input_id in &expired {
            let failed = self
                .store
                .fail_predictions_for_input(input_id, NO_GROUND_TRUTH)
                .map_err(internal)?;
            report.predictions_failed += failed;
            tracing::warn!(input_id=%input_id, predictions=%failed, "input expired without ground truth");
        }

        self.telemetry
            .record_inputs_resolved("resolved", report.inputs_resolved);
        self.telemetry
            .record_inputs_resolved("sentinel", report.inputs_expired);
        Ok(())
    }

    // ── Phase B ──

    fn score_predictions(
        &self,
        _now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> CoordResult<Vec<(PredictionRecord, InputRecord)>> {
        let pending = self
            .store
            .pending_predictions_with_resolved_inputs()
            .map_err(internal)?;

        let mut out = Vec::with_capacity(pending.len());
        for (mut prediction, input) in pending {
            let outcome = match &input.actuals {
                Some(actuals) if !actuals.is_null() => {
                    let outcome = self
                        .callables
                        .scoring
                        .score(&prediction.inference_output, actuals);
                    // Scoring callables never take the cycle down; a
                    // non-finite value is converted to a failure.
                    if outcome.success && !outcome.value.is_finite() {
                        ScoreOutcome::failure("non-finite score value")
                    } else {
                        outcome
                    }
                }
                _ => ScoreOutcome::failure(NO_GROUND_TRUTH),
            };

            if outcome.success {
                prediction.status = PredictionStatus::Scored;
                report.predictions_scored += 1;
            } else {
                prediction.status = PredictionStatus::Failed;
                report.predictions_failed += 1;
                tracing::debug!(
                    prediction_id=%prediction.id,
                    reason=?outcome.failed_reason,
                    "prediction failed scoring"
                );
            }
            prediction.score = Some(outcome);
            out.push((prediction, input));
        }

        if report.predictions_scored > 0 || report.predictions_failed > 0 {
            tracing::info!(
                scored=%report.predictions_scored,
                failed=%report.predictions_failed,
                "scored pending predictions"
            );
        }
        Ok(out)
    }

    // ── Phases C + D ──

    fn build_metrics_context(&self, scored: &[PredictionRecord], now: DateTime<Utc>) -> MetricsContext {
        let mut context = MetricsContext {
            model_id: String::new(),
            window_start: scored.iter().map(|p| p.performed_at).min(),
            window_end: Some(now),
            all_model_predictions: BTreeMap::new(),
            ensemble_predictions: BTreeMap::new(),
        };
        for prediction in scored {
            if is_ensemble_model(&prediction.model_id) {
                continue;
            }
            context
                .all_model_predictions
                .entry(prediction.model_id.clone())
                .or_default()
                .push(prediction_view(prediction));
        }
        context
    }

    fn build_snapshot(
        &self,
        model_id: &str,
        predictions: &[&PredictionRecord],
        context: &MetricsContext,
        extra_metrics: &[String],
        now: DateTime<Utc>,
    ) -> CoordResult<SnapshotRecord> {
        let score_results: Vec<Value> = predictions
            .iter()
            .filter_map(|p| p.score.as_ref().map(score_result_value))
            .collect();
        let mut summary = self.callables.aggregator.aggregate(&score_results);

        let mut metric_names = self.contract.metrics.clone();
        metric_names.extend(extra_metrics.iter().cloned());
        if !metric_names.is_empty() {
            let views: Vec<PredictionView> = predictions.iter().map(|p| prediction_view(p)).collect();
            let score_views: Vec<ScoreView> = predictions
                .iter()
                .filter_map(|p| {
                    p.score.as_ref().map(|s| ScoreView {
                        result: score_result_value(s),
                        scored_at: now,
                    })
                })
                .collect();
            let ctx = context.for_model(model_id);
            for (name, value) in self.metrics.compute(&metric_names, &views, &score_views, &ctx) {
                summary.insert(name, json!(value));
            }
        }

        let period_start = predictions
            .iter()
            .map(|p| p.performed_at)
            .min()
            .unwrap_or(now);
        let content_hash = snapshot_content_hash(
            model_id,
            period_start,
            now,
            predictions.len() as u64,
            &summary,
        )?;

        Ok(SnapshotRecord {
            id: ids::snapshot_id(model_id, now),
            model_id: model_id.to_string(),
            period_start,
            period_end: now,
            prediction_count: predictions.len() as u64,
            result_summary: summary,
            content_hash,
            created_at: now,
        })
    }

    // ── Phase E ──

    #[allow(clippy::too_many_arguments)]
    fn compute_ensembles(
        &self,
        scored: &[PredictionRecord],
        inputs_by_id: &BTreeMap<String, InputRecord>,
        summaries: &BTreeMap<String, BTreeMap<String, f64>>,
        base_context: &MetricsContext,
        now: DateTime<Utc>,
        new_predictions: &mut Vec<PredictionRecord>,
        snapshots: &mut Vec<SnapshotRecord>,
    ) -> CoordResult<()> {
        let enabled: Vec<_> = self.contract.ensembles.iter().filter(|e| e.enabled).collect();
        if enabled.is_empty() || scored.is_empty() {
            return Ok(());
        }

        // Score-value series per real model over the recent window, for
        // inverse-variance weighting.
        let window_start = now - ChronoDuration::hours(24);
        let recent = self
            .store
            .scored_predictions_between(window_start, now)
            .map_err(internal)?;
        let mut score_series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for prediction in recent.iter().chain(scored.iter()) {
            if is_ensemble_model(&prediction.model_id) {
                continue;
            }
            if let Some(score) = &prediction.score {
                score_series
                    .entry(prediction.model_id.clone())
                    .or_default()
                    .push(score.value);
            }
        }

        let mut by_model_refs: BTreeMap<String, Vec<&PredictionRecord>> = BTreeMap::new();
        for prediction in scored {
            if is_ensemble_model(&prediction.model_id) {
                continue;
            }
            by_model_refs
                .entry(prediction.model_id.clone())
                .or_default()
                .push(prediction);
        }

        let ensemble_metric_names = self.contract.ensemble_metrics();
        let mut context = base_context.clone();

        for config in enabled {
            let filtered =
                apply_model_filter(config.model_filter.as_ref(), summaries, score_series.clone());
            if filtered.is_empty() {
                tracing::info!(ensemble=%config.name, "no models after filtering");
                continue;
            }

            let weights = compute_weights(config.strategy, &filtered);
            let ensemble_rows =
                build_ensemble_predictions(&config.name, &weights, &by_model_refs, now);
            if ensemble_rows.is_empty() {
                continue;
            }

            // Score the synthetic predictions against the same actuals.
            let mut scored_rows: Vec<PredictionRecord> = Vec::new();
            for mut row in ensemble_rows {
                let outcome = match inputs_by_id
                    .get(&row.input_id)
                    .and_then(|input| input.actuals.clone())
                {
                    Some(actuals) if !actuals.is_null() => {
                        self.callables.scoring.score(&row.inference_output, &actuals)
                    }
                    _ => ScoreOutcome::failure(NO_GROUND_TRUTH),
                };
                row.status = if outcome.success {
                    PredictionStatus::Scored
                } else {
                    PredictionStatus::Failed
                };
                row.score = Some(outcome);
                scored_rows.push(row);
            }

            context.ensemble_predictions.insert(
                config.name.clone(),
                scored_rows.iter().map(prediction_view).collect(),
            );

            let virtual_id = ensemble_model_id(&config.name);
            let successful: Vec<&PredictionRecord> = scored_rows
                .iter()
                .filter(|p| p.status == PredictionStatus::Scored)
                .collect();
            if !successful.is_empty() {
                let snapshot = self.build_snapshot(
                    &virtual_id,
                    &successful,
                    &context,
                    &ensemble_metric_names,
                    now,
                )?;
                snapshots.push(snapshot);
            }

            self.telemetry.record_ensemble_built(&config.name);
            tracing::info!(
                ensemble=%config.name,
                models=%weights.len(),
                predictions=%scored_rows.len(),
                "ensemble predictions built"
            );
            new_predictions.extend(scored_rows);
        }

        // Tier-3 metrics for real models once ensembles exist.
        if !context.ensemble_predictions.is_empty() && !ensemble_metric_names.is_empty() {
            for snapshot in snapshots.iter_mut() {
                if is_ensemble_model(&snapshot.model_id) {
                    continue;
                }
                let Some(predictions) = by_model_refs.get(&snapshot.model_id) else {
                    continue;
                };
                let views: Vec<PredictionView> =
                    predictions.iter().map(|p| prediction_view(p)).collect();
                let score_views: Vec<ScoreView> = predictions
                    .iter()
                    .filter_map(|p| {
                        p.score.as_ref().map(|s| ScoreView {
                            result: score_result_value(s),
                            scored_at: now,
                        })
                    })
                    .collect();
                let ctx = context.for_model(snapshot.model_id.as_str());
                for (name, value) in
                    self.metrics
                        .compute(&ensemble_metric_names, &views, &score_views, &ctx)
                {
                    snapshot.result_summary.insert(name, json!(value));
                }
                snapshot.content_hash = snapshot_content_hash(
                    &snapshot.model_id,
                    snapshot.period_start,
                    snapshot.period_end,
                    snapshot.prediction_count,
                    &snapshot.result_summary,
                )?;
            }
        }

        Ok(())
    }

    // ── Phase F ──

    fn build_cycle(
        &self,
        snapshots: &[SnapshotRecord],
        now: DateTime<Utc>,
    ) -> CoordResult<(MerkleCycleRecord, Vec<MerkleNodeRecord>)> {
        let cycle_id = ids::cycle_id(now);

        let mut sorted: Vec<&SnapshotRecord> = snapshots.iter().collect();
        sorted.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let leaves: Vec<TreeNode> = sorted
            .iter()
            .enumerate()
            .map(|(position, snapshot)| {
                TreeNode::snapshot_leaf(
                    position as u32,
                    snapshot.id.clone(),
                    snapshot.content_hash.clone(),
                )
            })
            .collect();

        let tree = build_tree(leaves);
        let snapshots_root = root_hash(&tree)
            .map(str::to_string)
            .unwrap_or_else(empty_tree_root);

        let previous = self.store.latest_cycle().map_err(internal)?;
        let previous_root = previous.as_ref().map(|c| c.chained_root.clone());
        let chained = chained_root(previous_root.as_deref(), &snapshots_root);

        let cycle = MerkleCycleRecord {
            id: cycle_id.clone(),
            previous_cycle_id: previous.as_ref().map(|c| c.id.clone()),
            previous_cycle_root: previous_root,
            snapshots_root: snapshots_root.clone(),
            chained_root: chained,
            snapshot_count: snapshots.len() as u64,
            created_at: now,
        };

        let nodes = tree_to_records(&tree, Some(&cycle_id), None, now);
        tracing::info!(
            cycle_id=%cycle.id,
            snapshots=%cycle.snapshot_count,
            snapshots_root=%truncated(&cycle.snapshots_root),
            chained_root=%truncated(&cycle.chained_root),
            "merkle cycle built"
        );
        Ok((cycle, nodes))
    }

    // ── Phase G ──

    fn build_leaderboard(
        &self,
        tick_snapshots: &[SnapshotRecord],
        now: DateTime<Utc>,
    ) -> CoordResult<LeaderboardRecord> {
        // The tick's snapshots are not yet visible in the store; merge them
        // over the persisted history.
        let mut all = self.store.all_snapshots().map_err(internal)?;
        all.extend(tick_snapshots.iter().cloned());

        let models: BTreeMap<String, Model> = self
            .store
            .all_models()
            .map_err(internal)?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut by_model: BTreeMap<String, Vec<&SnapshotRecord>> = BTreeMap::new();
        for snapshot in &all {
            by_model
                .entry(snapshot.model_id.clone())
                .or_default()
                .push(snapshot);
        }

        let aggregation = &self.contract.aggregation;
        let mut entries: Vec<LeaderboardEntry> = Vec::new();
        for (model_id, snapshots) in by_model {
            let mut metrics = Map::new();

            for (window_name, window) in &aggregation.windows {
                let cutoff = now - ChronoDuration::seconds((window.hours * 3600.0) as i64);
                let values: Vec<f64> = snapshots
                    .iter()
                    .filter(|s| s.period_end >= cutoff)
                    .filter_map(|s| {
                        s.result_summary
                            .get(&aggregation.ranking_key)
                            .and_then(Value::as_f64)
                    })
                    .collect();
                let mean = if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                };
                metrics.insert(window_name.clone(), json!(mean));
            }

            let latest = snapshots
                .iter()
                .max_by_key(|s| s.period_end)
                .ok_or_else(|| CoordError::Internal("empty snapshot group".to_string()))?;
            for (key, value) in &latest.result_summary {
                if value.is_number() && !metrics.contains_key(key) {
                    metrics.insert(key.clone(), value.clone());
                }
            }

            let score = latest
                .result_summary
                .get(&aggregation.ranking_key)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            let model = models.get(&model_id);
            entries.push(LeaderboardEntry {
                rank: 0,
                model_id,
                model_name: model.map(|m| m.name.clone()),
                cruncher_name: model.map(|m| m.owner_name.clone()),
                score,
                metrics,
            });
        }

        entries.sort_by(|a, b| {
            let ordering = a
                .score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal);
            match aggregation.ranking_direction {
                RankingDirection::Desc => ordering.reverse(),
                RankingDirection::Asc => ordering,
            }
            .then_with(|| a.model_id.cmp(&b.model_id))
        });
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.rank = index as u32 + 1;
        }

        Ok(LeaderboardRecord {
            id: ids::leaderboard_id(now),
            created_at: now,
            entries,
            meta: Map::new(),
        })
    }

    /// Fixed-cadence loop guarded by the tick lease so only one engine runs
    /// a tick at a time.
    pub async fn run(
        self: Arc<Self>,
        interval: std::time::Duration,
        owner: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.audit.service("score", "started", None);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let lease_ttl = ChronoDuration::seconds((interval.as_secs() * 2).max(30) as i64);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            match self.store.acquire_lease("score-tick", &owner, lease_ttl, now) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("score tick lease held elsewhere, skipping");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error=%err, "score tick lease check failed");
                    continue;
                }
            }

            let engine = self.clone();
            let result = tokio::task::block_in_place(move || engine.run_tick(now));
            match result {
                Ok(report) => {
                    self.telemetry.record_score_tick(false);
                    if let Some(cycle_id) = &report.cycle_id {
                        tracing::info!(cycle_id=%cycle_id, scored=%report.predictions_scored, "score tick complete");
                    }
                }
                Err(err) => {
                    self.telemetry.record_score_tick(true);
                    tracing::error!(error=%err, "score tick failed");
                    self.audit.service("score", "error", Some(&err.to_string()));
                }
            }

            if let Err(err) = self.store.release_lease("score-tick", &owner) {
                tracing::warn!(error=%err, "score tick lease release failed");
            }
        }
        self.audit.service("score", "stopped", None);
    }
}

// ── helpers ──

fn group_by_model(predictions: &[PredictionRecord]) -> BTreeMap<String, Vec<&PredictionRecord>> {
    let mut by_model: BTreeMap<String, Vec<&PredictionRecord>> = BTreeMap::new();
    for prediction in predictions {
        by_model
            .entry(prediction.model_id.clone())
            .or_default()
            .push(prediction);
    }
    by_model
}

fn prediction_view(prediction: &PredictionRecord) -> PredictionView {
    PredictionView {
        model_id: prediction.model_id.clone(),
        input_id: prediction.input_id.clone(),
        scope_key: prediction.scope_key.clone(),
        inference_output: prediction.inference_output.clone(),
        performed_at: prediction.performed_at,
    }
}

/// Flatten a score outcome into the result object metric functions and the
/// aggregator consume.
fn score_result_value(score: &ScoreOutcome) -> Value {
    let mut result = Map::new();
    result.insert("value".to_string(), json!(score.value));
    result.insert("success".to_string(), json!(score.success));
    if let Some(reason) = &score.failed_reason {
        result.insert("failed_reason".to_string(), json!(reason));
    }
    for (key, value) in &score.extra {
        result.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(result)
}

fn numeric_summary(summary: &Map<String, Value>) -> BTreeMap<String, f64> {
    summary
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
        .collect()
}

pub(crate) fn tree_to_records(
    tree: &[TreeNode],
    cycle_id: Option<&str>,
    checkpoint_id: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<MerkleNodeRecord> {
    let owner = cycle_id.or(checkpoint_id).unwrap_or_default();
    tree.iter()
        .map(|node| MerkleNodeRecord {
            id: ids::merkle_node_id(owner, node.level, node.position),
            cycle_id: cycle_id.map(str::to_string),
            checkpoint_id: checkpoint_id.map(str::to_string),
            level: node.level,
            position: node.position,
            hash: node.hash.clone(),
            left_child_id: node
                .left
                .map(|i| ids::merkle_node_id(owner, tree[i].level, tree[i].position)),
            right_child_id: node
                .right
                .map(|i| ids::merkle_node_id(owner, tree[i].level, tree[i].position)),
            snapshot_id: node.snapshot_id.clone(),
            snapshot_content_hash: node.snapshot_content_hash.clone(),
            created_at: now,
        })
        .collect()
}

fn truncated(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

fn internal(err: StoreError) -> CoordError {
    CoordError::Internal(err.to_string())
}
