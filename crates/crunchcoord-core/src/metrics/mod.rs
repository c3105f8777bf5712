// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable multi-metric enrichment.
//!
//! Metric functions share one signature and are resolved by name from the
//! registry. The context is built once per score cycle so cross-model
//! metrics (correlation, contribution) never re-fetch data.

pub mod builtins;
pub mod ensemble;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// A model's prediction as seen by metric functions.
#[derive(Debug, Clone)]
pub struct PredictionView {
    pub model_id: String,
    pub input_id: String,
    pub scope_key: String,
    pub inference_output: Value,
    pub performed_at: DateTime<Utc>,
}

/// A scoring result as seen by metric functions. `result` carries the score
/// fields plus whatever the ground-truth resolver attached.
#[derive(Debug, Clone)]
pub struct ScoreView {
    pub result: Value,
    pub scored_at: DateTime<Utc>,
}

/// Shared evaluation state for one cycle's metric computations.
#[derive(Debug, Clone, Default)]
pub struct MetricsContext {
    pub model_id: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    /// All real models' predictions in this window.
    pub all_model_predictions: BTreeMap<String, Vec<PredictionView>>,
    /// Ensemble predictions keyed by ensemble name, when ensembling is on.
    pub ensemble_predictions: BTreeMap<String, Vec<PredictionView>>,
}

impl MetricsContext {
    pub fn for_model(&self, model_id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.model_id = model_id.into();
        ctx
    }
}

pub type MetricFn = fn(&[PredictionView], &[ScoreView], &MetricsContext) -> f64;

/// Registry of named metric functions, frozen at startup.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    metrics: BTreeMap<String, MetricFn>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in metric.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ic", builtins::compute_ic);
        registry.register("ic_sharpe", builtins::compute_ic_sharpe);
        registry.register("mean_return", builtins::compute_mean_return);
        registry.register("hit_rate", builtins::compute_hit_rate);
        registry.register("model_correlation", builtins::compute_model_correlation);
        registry.register("max_drawdown", builtins::compute_max_drawdown);
        registry.register("sortino_ratio", builtins::compute_sortino_ratio);
        registry.register("turnover", builtins::compute_turnover);
        registry.register("fnc", ensemble::compute_fnc);
        registry.register("contribution", ensemble::compute_contribution);
        registry.register("ensemble_correlation", ensemble::compute_ensemble_correlation);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, f: MetricFn) {
        self.metrics.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<MetricFn> {
        self.metrics.get(name).copied()
    }

    pub fn available(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }

    /// Compute the requested metrics. Unregistered names are skipped with a
    /// warning; non-finite results are clamped to 0.0 so a degenerate window
    /// cannot poison a snapshot summary.
    pub fn compute(
        &self,
        names: &[String],
        predictions: &[PredictionView],
        scores: &[ScoreView],
        context: &MetricsContext,
    ) -> BTreeMap<String, f64> {
        let mut results = BTreeMap::new();
        for name in names {
            let Some(f) = self.get(name) else {
                tracing::warn!(metric = %name, "metric not registered, skipping");
                continue;
            };
            let raw = f(predictions, scores, context);
            results.insert(name.clone(), if raw.is_finite() { raw } else { 0.0 });
        }
        results
    }
}

// ── shared extraction helpers ──

const SIGNAL_KEYS: [&str; 4] = ["value", "expected_return", "signal", "prediction"];

/// Pull the numeric signal out of each prediction output. Tries the common
/// field names in order, then falls back to the first numeric field.
pub fn extract_signal_values(predictions: &[PredictionView]) -> Vec<f64> {
    let mut values = Vec::with_capacity(predictions.len());
    for p in predictions {
        let Some(output) = p.inference_output.as_object() else {
            continue;
        };
        let mut v = SIGNAL_KEYS
            .iter()
            .find_map(|key| output.get(*key).and_then(Value::as_f64));
        if v.is_none() {
            v = output.values().find_map(Value::as_f64);
        }
        if let Some(v) = v {
            values.push(v);
        }
    }
    values
}

/// Primary score value from each score result.
pub fn extract_score_values(scores: &[ScoreView]) -> Vec<f64> {
    scores
        .iter()
        .filter_map(|s| s.result.get("value").and_then(Value::as_f64))
        .collect()
}

/// Realized returns attached by the ground-truth resolver. Missing values
/// contribute 0.0 so the series stays aligned with the predictions.
pub fn extract_actual_returns(scores: &[ScoreView]) -> Vec<f64> {
    scores
        .iter()
        .map(|s| {
            ["actual_return", "return"]
                .iter()
                .find_map(|key| s.result.get(*key).and_then(Value::as_f64))
                .unwrap_or(0.0)
        })
        .collect()
}

/// Spearman rank correlation of two aligned series.
pub fn spearman_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }

    let rank = |values: &[f64]| -> Vec<f64> {
        let mut indexed: Vec<usize> = (0..n).collect();
        indexed.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal));
        let mut ranks = vec![0.0; n];
        for (rank, idx) in indexed.into_iter().enumerate() {
            ranks[idx] = rank as f64;
        }
        ranks
    };

    let rx = rank(&x[..n]);
    let ry = rank(&y[..n]);

    let mean_rx = rx.iter().sum::<f64>() / n as f64;
    let mean_ry = ry.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = rx[i] - mean_rx;
        let dy = ry[i] - mean_ry;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let std_x = var_x.sqrt();
    let std_y = var_y.sqrt();
    if std_x < 1e-12 || std_y < 1e-12 {
        return 0.0;
    }
    cov / (std_x * std_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pred(model: &str, value: f64) -> PredictionView {
        PredictionView {
            model_id: model.to_string(),
            input_id: "INP_1".to_string(),
            scope_key: "default".to_string(),
            inference_output: json!({"value": value}),
            performed_at: Utc::now(),
        }
    }

    #[test]
    fn signal_extraction_tries_known_keys_then_any_numeric() {
        let mut p = pred("m1", 0.5);
        assert_eq!(extract_signal_values(std::slice::from_ref(&p)), vec![0.5]);

        p.inference_output = json!({"expected_return": 0.25});
        assert_eq!(extract_signal_values(std::slice::from_ref(&p)), vec![0.25]);

        p.inference_output = json!({"custom_field": 3.0});
        assert_eq!(extract_signal_values(std::slice::from_ref(&p)), vec![3.0]);

        p.inference_output = json!({"label": "up"});
        assert!(extract_signal_values(std::slice::from_ref(&p)).is_empty());
    }

    #[test]
    fn spearman_handles_perfect_and_inverse_rank_order() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let inverse = [4.0, 3.0, 2.0, 1.0];
        assert!((spearman_correlation(&x, &x) - 1.0).abs() < 1e-12);
        assert!((spearman_correlation(&x, &inverse) + 1.0).abs() < 1e-12);
        // Monotone transforms do not change rank correlation.
        let squared = [1.0, 4.0, 9.0, 16.0];
        assert!((spearman_correlation(&x, &squared) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn spearman_degenerate_series_is_zero() {
        assert_eq!(spearman_correlation(&[1.0], &[1.0]), 0.0);
        assert_eq!(spearman_correlation(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn compute_clamps_non_finite_results() {
        fn exploding(_: &[PredictionView], _: &[ScoreView], _: &MetricsContext) -> f64 {
            f64::INFINITY
        }
        let mut registry = MetricsRegistry::new();
        registry.register("exploding", exploding);
        let out = registry.compute(
            &["exploding".to_string(), "missing".to_string()],
            &[],
            &[],
            &MetricsContext::default(),
        );
        assert_eq!(out.get("exploding"), Some(&0.0));
        assert!(!out.contains_key("missing"));
    }
}
