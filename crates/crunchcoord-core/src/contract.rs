// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! The competition contract layer.
//!
//! Behavior-defining callables are resolved by string path from a registry
//! populated at startup. `freeze` checks every required slot and fails fast
//! before any worker starts; the hot path then performs direct calls through
//! the frozen handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::emission::{
    contribution_weighted_emission, tier_schedule_emission, EmissionParties, EmissionStrategyFn,
};
use crate::ensemble::EnsembleConfig;
use crate::entities::{FeedRecord, PredictionScope, ScoreOutcome};
use crate::error::{CoordError, CoordResult};

// ── contract configuration ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationWindow {
    pub hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub windows: BTreeMap<String, AggregationWindow>,
    pub ranking_key: String,
    pub ranking_direction: RankingDirection,
}

impl Default for Aggregation {
    fn default() -> Self {
        let mut windows = BTreeMap::new();
        windows.insert("24h".to_string(), AggregationWindow { hours: 24.0 });
        windows.insert("7d".to_string(), AggregationWindow { hours: 168.0 });
        Self {
            windows,
            ranking_key: "value".to_string(),
            ranking_direction: RankingDirection::Desc,
        }
    }
}

/// String paths for each callable slot. Required slots have no default and
/// must resolve at freeze time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallableSlots {
    pub inference_input_builder: String,
    pub inference_output_validator: String,
    pub scoring_function: String,
    pub resolve_ground_truth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_emission: Option<String>,
}

impl Default for CallableSlots {
    fn default() -> Self {
        Self {
            inference_input_builder: "builtin.candles_window".to_string(),
            inference_output_validator: "builtin.expected_return".to_string(),
            scoring_function: "builtin.signed_return".to_string(),
            resolve_ground_truth: "builtin.return_over_horizon".to_string(),
            aggregate_snapshot: None,
            build_emission: None,
        }
    }
}

/// The single declaration a competition ships: shapes, scope, aggregation,
/// metrics, ensembles and callable slots. Read once at startup, never
/// mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrunchConfig {
    pub crunch_id: String,
    #[serde(default)]
    pub parties: EmissionParties,
    pub scope: PredictionScope,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub ensembles: Vec<EnsembleConfig>,
    #[serde(default)]
    pub callables: CallableSlots,
    /// How many records of the feed window the input builder receives.
    #[serde(default = "default_input_window")]
    pub input_window: usize,
}

fn default_input_window() -> usize {
    120
}

impl Default for CrunchConfig {
    fn default() -> Self {
        Self {
            crunch_id: "starter-challenge".to_string(),
            parties: EmissionParties::default(),
            scope: PredictionScope {
                subject: "BTC".to_string(),
                horizon_seconds: 300,
                step_seconds: 60,
                extra: Map::new(),
            },
            aggregation: Aggregation::default(),
            metrics: vec![
                "ic".to_string(),
                "ic_sharpe".to_string(),
                "hit_rate".to_string(),
                "mean_return".to_string(),
                "max_drawdown".to_string(),
                "sortino_ratio".to_string(),
                "turnover".to_string(),
                "model_correlation".to_string(),
            ],
            ensembles: Vec::new(),
            callables: CallableSlots::default(),
            input_window: default_input_window(),
        }
    }
}

impl CrunchConfig {
    /// Metrics that only run when ensembles are configured and populated.
    pub fn ensemble_metrics(&self) -> Vec<String> {
        if self.ensembles.iter().any(|e| e.enabled) {
            ["fnc", "contribution", "ensemble_correlation"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        }
    }
}

// ── callable traits ──

pub trait InferenceInputBuilder: Send + Sync {
    fn build(&self, window: &[FeedRecord], scope: &PredictionScope) -> CoordResult<Value>;
}

pub trait InferenceOutputValidator: Send + Sync {
    /// Returns the normalized output, or the reason it was rejected.
    fn validate(&self, output: &Value) -> Result<Value, String>;
}

pub trait ScoringFunction: Send + Sync {
    fn score(&self, inference_output: &Value, actuals: &Value) -> ScoreOutcome;
}

pub trait GroundTruthResolver: Send + Sync {
    /// `None` means the feed window cannot answer yet; the input stays
    /// unresolved and is retried until its TTL.
    fn resolve(&self, scope: &PredictionScope, window: &[FeedRecord]) -> Option<Value>;
}

pub trait SnapshotAggregator: Send + Sync {
    fn aggregate(&self, score_results: &[Value]) -> Map<String, Value>;
}

/// The frozen, validated callable set the workers run with.
#[derive(Clone)]
pub struct FrozenCallables {
    pub input_builder: Arc<dyn InferenceInputBuilder>,
    pub output_validator: Arc<dyn InferenceOutputValidator>,
    pub scoring: Arc<dyn ScoringFunction>,
    pub ground_truth: Arc<dyn GroundTruthResolver>,
    pub aggregator: Arc<dyn SnapshotAggregator>,
    pub emission: EmissionStrategyFn,
}

impl std::fmt::Debug for FrozenCallables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenCallables").finish_non_exhaustive()
    }
}

/// Startup-time registry keyed by string path.
pub struct CallableRegistry {
    input_builders: BTreeMap<String, Arc<dyn InferenceInputBuilder>>,
    output_validators: BTreeMap<String, Arc<dyn InferenceOutputValidator>>,
    scoring_functions: BTreeMap<String, Arc<dyn ScoringFunction>>,
    ground_truth_resolvers: BTreeMap<String, Arc<dyn GroundTruthResolver>>,
    snapshot_aggregators: BTreeMap<String, Arc<dyn SnapshotAggregator>>,
    emission_strategies: BTreeMap<String, EmissionStrategyFn>,
}

impl CallableRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            input_builders: BTreeMap::new(),
            output_validators: BTreeMap::new(),
            scoring_functions: BTreeMap::new(),
            ground_truth_resolvers: BTreeMap::new(),
            snapshot_aggregators: BTreeMap::new(),
            emission_strategies: BTreeMap::new(),
        };

        registry.register_input_builder("builtin.candles_window", Arc::new(CandlesWindowBuilder));
        registry.register_input_builder("builtin.latest_price", Arc::new(LatestPriceBuilder));
        registry
            .register_output_validator("builtin.expected_return", Arc::new(ExpectedReturnValidator));
        registry
            .register_output_validator("builtin.probability_up", Arc::new(ProbabilityUpValidator));
        registry.register_scoring_function("builtin.signed_return", Arc::new(SignedReturnScoring));
        registry.register_scoring_function("builtin.updown_brier", Arc::new(UpdownBrierScoring));
        registry.register_ground_truth_resolver(
            "builtin.return_over_horizon",
            Arc::new(ReturnOverHorizonResolver),
        );
        registry.register_snapshot_aggregator("builtin.numeric_mean", Arc::new(NumericMeanAggregator));
        registry.register_emission_strategy("builtin.tier_schedule", tier_schedule_emission);
        registry.register_emission_strategy(
            "builtin.contribution_weighted",
            contribution_weighted_emission,
        );
        registry
    }

    pub fn register_input_builder(&mut self, path: &str, f: Arc<dyn InferenceInputBuilder>) {
        self.input_builders.insert(path.to_string(), f);
    }

    pub fn register_output_validator(&mut self, path: &str, f: Arc<dyn InferenceOutputValidator>) {
        self.output_validators.insert(path.to_string(), f);
    }

    pub fn register_scoring_function(&mut self, path: &str, f: Arc<dyn ScoringFunction>) {
        self.scoring_functions.insert(path.to_string(), f);
    }

    pub fn register_ground_truth_resolver(&mut self, path: &str, f: Arc<dyn GroundTruthResolver>) {
        self.ground_truth_resolvers.insert(path.to_string(), f);
    }

    pub fn register_snapshot_aggregator(&mut self, path: &str, f: Arc<dyn SnapshotAggregator>) {
        self.snapshot_aggregators.insert(path.to_string(), f);
    }

    pub fn register_emission_strategy(&mut self, path: &str, f: EmissionStrategyFn) {
        self.emission_strategies.insert(path.to_string(), f);
    }

    /// Resolve every slot. Any missing required callable aborts startup.
    pub fn freeze(&self, slots: &CallableSlots) -> CoordResult<FrozenCallables> {
        let input_builder = self
            .input_builders
            .get(&slots.inference_input_builder)
            .cloned()
            .ok_or_else(|| missing("inference_input_builder", &slots.inference_input_builder))?;
        let output_validator = self
            .output_validators
            .get(&slots.inference_output_validator)
            .cloned()
            .ok_or_else(|| {
                missing("inference_output_validator", &slots.inference_output_validator)
            })?;
        let scoring = self
            .scoring_functions
            .get(&slots.scoring_function)
            .cloned()
            .ok_or_else(|| missing("scoring_function", &slots.scoring_function))?;
        let ground_truth = self
            .ground_truth_resolvers
            .get(&slots.resolve_ground_truth)
            .cloned()
            .ok_or_else(|| missing("resolve_ground_truth", &slots.resolve_ground_truth))?;

        let aggregator = match &slots.aggregate_snapshot {
            Some(path) => self
                .snapshot_aggregators
                .get(path)
                .cloned()
                .ok_or_else(|| missing("aggregate_snapshot", path))?,
            None => Arc::new(NumericMeanAggregator),
        };
        let emission = match &slots.build_emission {
            Some(path) => self
                .emission_strategies
                .get(path)
                .copied()
                .ok_or_else(|| missing("build_emission", path))?,
            None => tier_schedule_emission as EmissionStrategyFn,
        };

        Ok(FrozenCallables {
            input_builder,
            output_validator,
            scoring,
            ground_truth,
            aggregator,
            emission,
        })
    }
}

fn missing(slot: &str, path: &str) -> CoordError {
    CoordError::Config(format!("callable slot `{slot}` has no registration for `{path}`"))
}

// ── candle helpers ──

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Normalize a feed record into a candle. Tick records become flat candles
/// at the tick price.
pub fn candle_from_record(record: &FeedRecord) -> Option<Candle> {
    let price = record.close_price()?;
    let ts = record.ts_event.timestamp();
    if record.scope.kind == "candle" {
        let get = |key: &str| record.values.get(key).and_then(Value::as_f64).unwrap_or(price);
        Some(Candle {
            ts,
            open: get("open"),
            high: get("high"),
            low: get("low"),
            close: get("close"),
            volume: record.values.get("volume").and_then(Value::as_f64).unwrap_or(0.0),
        })
    } else {
        Some(Candle {
            ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        })
    }
}

/// Roll 1-minute candles up into higher-timeframe bars by flooring each
/// timestamp to the target boundary. Returns at most `max_output` bars,
/// most recent last.
pub fn aggregate_candles(candles: &[Candle], target_minutes: i64, max_output: usize) -> Vec<Candle> {
    if candles.is_empty() || target_minutes <= 1 {
        let start = candles.len().saturating_sub(max_output);
        return candles[start..].to_vec();
    }

    let interval_s = target_minutes * 60;
    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();
    for c in candles {
        let bucket_ts = (c.ts / interval_s) * interval_s;
        buckets
            .entry(bucket_ts)
            .and_modify(|bar| {
                bar.high = bar.high.max(c.high);
                bar.low = bar.low.min(c.low);
                bar.close = c.close;
                bar.volume += c.volume;
            })
            .or_insert(Candle {
                ts: bucket_ts,
                ..*c
            });
    }

    let bars: Vec<Candle> = buckets.into_values().collect();
    let start = bars.len().saturating_sub(max_output);
    bars[start..].to_vec()
}

// ── built-in callables ──

/// Multi-timeframe settings: (target minutes, window count).
const MULTI_TF: [(i64, usize); 3] = [(5, 60), (15, 40), (60, 24)];

/// Default input builder: 1m candles plus 5m/15m/1h roll-ups.
struct CandlesWindowBuilder;

impl InferenceInputBuilder for CandlesWindowBuilder {
    fn build(&self, window: &[FeedRecord], scope: &PredictionScope) -> CoordResult<Value> {
        let candles: Vec<Candle> = window.iter().filter_map(candle_from_record).collect();
        if candles.is_empty() {
            return Err(CoordError::InputRejected(
                "feed window contains no usable candles".to_string(),
            ));
        }

        let asof_ts = candles.last().map(|c| c.ts).unwrap_or_default();
        let mut payload = json!({
            "symbol": scope.subject,
            "asof_ts": asof_ts,
            "candles_1m": &candles,
        });

        for (target_minutes, count) in MULTI_TF {
            let key = if target_minutes < 60 {
                format!("candles_{target_minutes}m")
            } else {
                format!("candles_{}h", target_minutes / 60)
            };
            payload[key] = json!(aggregate_candles(&candles, target_minutes, count));
        }

        Ok(payload)
    }
}

/// Minimal input builder: just the latest observed price.
struct LatestPriceBuilder;

impl InferenceInputBuilder for LatestPriceBuilder {
    fn build(&self, window: &[FeedRecord], scope: &PredictionScope) -> CoordResult<Value> {
        let latest = window
            .iter()
            .max_by_key(|r| r.ts_event)
            .and_then(|r| r.close_price().map(|p| (r.ts_event, p)));
        let Some((ts_event, price)) = latest else {
            return Err(CoordError::InputRejected(
                "feed window contains no priced records".to_string(),
            ));
        };
        Ok(json!({
            "symbol": scope.subject,
            "price": price,
            "asof_ts": ts_event.timestamp(),
        }))
    }
}

/// Accepts `{"value": <finite number>, ...}` and preserves extra fields.
struct ExpectedReturnValidator;

impl InferenceOutputValidator for ExpectedReturnValidator {
    fn validate(&self, output: &Value) -> Result<Value, String> {
        let Some(object) = output.as_object() else {
            return Err("inference output must be an object".to_string());
        };
        let Some(value) = object.get("value").and_then(Value::as_f64) else {
            return Err("inference output must contain numeric 'value'".to_string());
        };
        if !value.is_finite() {
            return Err("'value' must be finite".to_string());
        }
        let mut normalized = object.clone();
        normalized.insert("value".to_string(), json!(value));
        Ok(Value::Object(normalized))
    }
}

/// Accepts `{"p_up": <0..=1>}`.
struct ProbabilityUpValidator;

impl InferenceOutputValidator for ProbabilityUpValidator {
    fn validate(&self, output: &Value) -> Result<Value, String> {
        let Some(p_up) = output.get("p_up").and_then(Value::as_f64) else {
            return Err("inference output must contain 'p_up'".to_string());
        };
        if !(0.0..=1.0).contains(&p_up) {
            return Err("'p_up' must be within [0, 1]".to_string());
        }
        Ok(json!({"p_up": p_up}))
    }
}

/// Long-short directional score: `sign(value) * actual_return`.
struct SignedReturnScoring;

impl ScoringFunction for SignedReturnScoring {
    fn score(&self, inference_output: &Value, actuals: &Value) -> ScoreOutcome {
        let Some(signal) = inference_output.get("value").and_then(Value::as_f64) else {
            return ScoreOutcome::failure("inference output missing 'value'");
        };
        let Some(actual_return) = actuals.get("return_pct").and_then(Value::as_f64) else {
            return ScoreOutcome::failure("actuals missing 'return_pct'");
        };

        let direction = if signal >= 0.0 { 1.0 } else { -1.0 };
        let mut extra = Map::new();
        extra.insert("actual_return".to_string(), json!(actual_return));
        ScoreOutcome {
            value: direction * actual_return,
            success: true,
            failed_reason: None,
            extra,
        }
    }
}

/// Brier-style score for probability-of-up outputs: `1 - (p_up - up)^2`.
struct UpdownBrierScoring;

impl ScoringFunction for UpdownBrierScoring {
    fn score(&self, inference_output: &Value, actuals: &Value) -> ScoreOutcome {
        let Some(p_up) = inference_output.get("p_up").and_then(Value::as_f64) else {
            return ScoreOutcome::failure("inference output missing 'p_up'");
        };
        let Some(actual_return) = actuals.get("return_pct").and_then(Value::as_f64) else {
            return ScoreOutcome::failure("actuals missing 'return_pct'");
        };

        let up = if actual_return >= 0.0 { 1.0 } else { 0.0 };
        let mut extra = Map::new();
        extra.insert("actual_return".to_string(), json!(actual_return));
        ScoreOutcome {
            value: 1.0 - (p_up - up).powi(2),
            success: true,
            failed_reason: None,
            extra,
        }
    }
}

/// Realized return between the first and last priced record of the
/// resolution window.
struct ReturnOverHorizonResolver;

impl GroundTruthResolver for ReturnOverHorizonResolver {
    fn resolve(&self, _scope: &PredictionScope, window: &[FeedRecord]) -> Option<Value> {
        let mut priced: Vec<(DateTime<Utc>, f64)> = window
            .iter()
            .filter_map(|r| r.close_price().map(|p| (r.ts_event, p)))
            .collect();
        if priced.len() < 2 {
            return None;
        }
        priced.sort_by_key(|(ts, _)| *ts);

        let (_, open_price) = priced[0];
        let (_, close_price) = priced[priced.len() - 1];
        if open_price.abs() < 1e-12 {
            return None;
        }
        let return_pct = (close_price - open_price) / open_price;
        Some(json!({
            "open_price": open_price,
            "close_price": close_price,
            "return_pct": return_pct,
            "direction": if return_pct >= 0.0 { 1 } else { -1 },
        }))
    }
}

/// Default aggregator: field-wise mean of every numeric field across the
/// score results.
struct NumericMeanAggregator;

impl SnapshotAggregator for NumericMeanAggregator {
    fn aggregate(&self, score_results: &[Value]) -> Map<String, Value> {
        let mut sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        for result in score_results {
            let Some(object) = result.as_object() else {
                continue;
            };
            for (key, value) in object {
                if let Some(v) = value.as_f64() {
                    let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                    entry.0 += v;
                    entry.1 += 1;
                }
            }
        }

        let mut out = Map::new();
        for (key, (sum, count)) in sums {
            out.insert(key, json!(sum / count as f64));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::FeedScope;
    use chrono::TimeZone;

    fn record(minute: u32, close: f64) -> FeedRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap();
        let mut values = Map::new();
        values.insert("open".to_string(), json!(close - 1.0));
        values.insert("high".to_string(), json!(close + 1.0));
        values.insert("low".to_string(), json!(close - 2.0));
        values.insert("close".to_string(), json!(close));
        values.insert("volume".to_string(), json!(10.0));
        FeedRecord {
            id: format!("FR_{minute}"),
            scope: FeedScope::new("binance", "BTC", "candle", "1m"),
            ts_event: ts,
            ts_ingested: ts,
            values,
            meta: Map::new(),
        }
    }

    fn scope() -> PredictionScope {
        PredictionScope {
            subject: "BTC".to_string(),
            horizon_seconds: 300,
            step_seconds: 60,
            extra: Map::new(),
        }
    }

    #[test]
    fn freeze_fails_fast_on_unknown_slot() {
        let registry = CallableRegistry::with_builtins();
        let mut slots = CallableSlots::default();
        registry.freeze(&slots).unwrap();

        slots.scoring_function = "plugins.does_not_exist".to_string();
        let err = registry.freeze(&slots).unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
        assert!(err.to_string().contains("scoring_function"));
    }

    #[test]
    fn optional_slots_default_when_unset() {
        let registry = CallableRegistry::with_builtins();
        let frozen = registry.freeze(&CallableSlots::default()).unwrap();
        let summary = frozen.aggregator.aggregate(&[
            json!({"value": 1.0, "actual_return": 0.5}),
            json!({"value": 3.0, "actual_return": 0.5, "note": "ignored"}),
        ]);
        assert_eq!(summary["value"], json!(2.0));
        assert_eq!(summary["actual_return"], json!(0.5));
        assert!(!summary.contains_key("note"));
    }

    #[test]
    fn candles_builder_assembles_multi_timeframe_payload() {
        let window: Vec<FeedRecord> = (0..30).map(|m| record(m, 100.0 + m as f64)).collect();
        let registry = CallableRegistry::with_builtins();
        let frozen = registry.freeze(&CallableSlots::default()).unwrap();

        let input = frozen.input_builder.build(&window, &scope()).unwrap();
        assert_eq!(input["symbol"], json!("BTC"));
        assert_eq!(input["candles_1m"].as_array().unwrap().len(), 30);
        // 30 one-minute candles span 12:00-12:29 → six 5m bars.
        assert_eq!(input["candles_5m"].as_array().unwrap().len(), 6);
        assert_eq!(input["candles_1h"].as_array().unwrap().len(), 1);

        let hour_bar = &input["candles_1h"][0];
        assert_eq!(hour_bar["close"], json!(129.0));
        assert_eq!(hour_bar["volume"], json!(300.0));
    }

    #[test]
    fn candles_builder_rejects_empty_window() {
        let registry = CallableRegistry::with_builtins();
        let frozen = registry.freeze(&CallableSlots::default()).unwrap();
        let err = frozen.input_builder.build(&[], &scope()).unwrap_err();
        assert!(matches!(err, CoordError::InputRejected(_)));
    }

    #[test]
    fn expected_return_validator_normalizes_and_rejects() {
        let validator = ExpectedReturnValidator;
        let ok = validator.validate(&json!({"value": 0.5, "confidence": 0.9})).unwrap();
        assert_eq!(ok["value"], json!(0.5));
        assert_eq!(ok["confidence"], json!(0.9));

        assert!(validator.validate(&json!({"value": "high"})).is_err());
        assert!(validator.validate(&json!({"other": 1.0})).is_err());
        assert!(validator.validate(&json!(42)).is_err());
    }

    #[test]
    fn probability_validator_enforces_unit_interval() {
        let validator = ProbabilityUpValidator;
        assert!(validator.validate(&json!({"p_up": 0.7})).is_ok());
        assert!(validator.validate(&json!({"p_up": 1.2})).is_err());
        assert!(validator.validate(&json!({"p_up": -0.1})).is_err());
    }

    #[test]
    fn signed_return_scores_direction() {
        let scoring = SignedReturnScoring;
        let long = scoring.score(&json!({"value": 0.8}), &json!({"return_pct": 0.02}));
        assert!(long.success);
        assert!((long.value - 0.02).abs() < 1e-12);

        let short = scoring.score(&json!({"value": -0.8}), &json!({"return_pct": 0.02}));
        assert!((short.value + 0.02).abs() < 1e-12);
        assert_eq!(short.extra["actual_return"], json!(0.02));

        let failed = scoring.score(&json!({}), &json!({"return_pct": 0.02}));
        assert!(!failed.success);
        assert!(failed.failed_reason.is_some());
    }

    #[test]
    fn ground_truth_needs_two_priced_records() {
        let resolver = ReturnOverHorizonResolver;
        assert!(resolver.resolve(&scope(), &[record(0, 100.0)]).is_none());

        let actuals = resolver
            .resolve(&scope(), &[record(0, 100.0), record(1, 102.0)])
            .unwrap();
        assert!((actuals["return_pct"].as_f64().unwrap() - 0.02).abs() < 1e-12);
        assert_eq!(actuals["direction"], json!(1));
    }
}
