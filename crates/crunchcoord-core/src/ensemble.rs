// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ensemble virtual models: synthetic participants whose predictions are a
//! deterministic weighted combination of real models' outputs. They flow
//! through scoring, snapshots and the leaderboard like any other model;
//! only the reserved id prefix sets them apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::entities::{PredictionRecord, PredictionStatus};

pub const ENSEMBLE_PREFIX: &str = "__ensemble_";
pub const ENSEMBLE_SUFFIX: &str = "__";

pub fn ensemble_model_id(name: &str) -> String {
    format!("{ENSEMBLE_PREFIX}{name}{ENSEMBLE_SUFFIX}")
}

pub fn is_ensemble_model(model_id: &str) -> bool {
    model_id.starts_with(ENSEMBLE_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightStrategy {
    InverseVariance,
    EqualWeight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ModelFilter {
    TopN { n: usize },
    MinMetric { name: String, threshold: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub name: String,
    pub strategy: WeightStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_filter: Option<ModelFilter>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Compute normalized weights over the candidate models.
///
/// `score_series` carries each model's score values over the window;
/// inverse-variance weighting uses their population variance. Degenerate
/// series (fewer than two points, or zero variance) weigh in at 1.0 before
/// normalization, and a fully degenerate pool falls back to equal weight.
pub fn compute_weights(
    strategy: WeightStrategy,
    score_series: &BTreeMap<String, Vec<f64>>,
) -> BTreeMap<String, f64> {
    if score_series.is_empty() {
        return BTreeMap::new();
    }

    match strategy {
        WeightStrategy::EqualWeight => {
            let w = 1.0 / score_series.len() as f64;
            score_series.keys().map(|m| (m.clone(), w)).collect()
        }
        WeightStrategy::InverseVariance => {
            let mut raw: BTreeMap<String, f64> = BTreeMap::new();
            for (model_id, values) in score_series {
                let weight = if values.len() < 2 {
                    1.0
                } else {
                    let mean = values.iter().sum::<f64>() / values.len() as f64;
                    let variance =
                        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                    if variance < 1e-12 {
                        1.0
                    } else {
                        1.0 / variance
                    }
                };
                raw.insert(model_id.clone(), weight);
            }

            let total: f64 = raw.values().sum();
            if total < 1e-12 {
                let w = 1.0 / raw.len() as f64;
                return raw.keys().map(|m| (m.clone(), w)).collect();
            }
            raw.into_iter().map(|(m, w)| (m, w / total)).collect()
        }
    }
}

/// Apply the configured model filter to the candidate set.
///
/// `model_metrics` carries each model's latest snapshot metrics; `top_n`
/// ranks by the primary `value` metric descending.
pub fn apply_model_filter(
    filter: Option<&ModelFilter>,
    model_metrics: &BTreeMap<String, BTreeMap<String, f64>>,
    mut candidates: BTreeMap<String, Vec<f64>>,
) -> BTreeMap<String, Vec<f64>> {
    match filter {
        None => candidates,
        Some(ModelFilter::TopN { n }) => {
            let mut ranked: Vec<&String> = candidates.keys().collect();
            ranked.sort_by(|a, b| {
                let score_a = model_metrics.get(*a).and_then(|m| m.get("value")).copied().unwrap_or(0.0);
                let score_b = model_metrics.get(*b).and_then(|m| m.get("value")).copied().unwrap_or(0.0);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            let kept: std::collections::BTreeSet<String> =
                ranked.into_iter().take(*n).cloned().collect();
            candidates.retain(|m, _| kept.contains(m));
            candidates
        }
        Some(ModelFilter::MinMetric { name, threshold }) => {
            candidates.retain(|m, _| {
                model_metrics
                    .get(m)
                    .and_then(|metrics| metrics.get(name))
                    .copied()
                    .unwrap_or(0.0)
                    >= *threshold
            });
            candidates
        }
    }
}

/// Build the virtual model's prediction rows: one per (input, scope_key)
/// group, holding the weighted average of the contributing signals. The
/// weights ride along in `meta` for auditability.
pub fn build_ensemble_predictions(
    name: &str,
    weights: &BTreeMap<String, f64>,
    predictions_by_model: &BTreeMap<String, Vec<&PredictionRecord>>,
    now: DateTime<Utc>,
) -> Vec<PredictionRecord> {
    let virtual_model_id = ensemble_model_id(name);

    let mut groups: BTreeMap<(String, String), Vec<(&str, &PredictionRecord)>> = BTreeMap::new();
    for (model_id, predictions) in predictions_by_model {
        if !weights.contains_key(model_id) {
            continue;
        }
        for prediction in predictions {
            groups
                .entry((prediction.input_id.clone(), prediction.scope_key.clone()))
                .or_default()
                .push((model_id.as_str(), prediction));
        }
    }

    let mut out = Vec::new();
    for ((input_id, scope_key), members) in groups {
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (model_id, prediction) in &members {
            let Some(weight) = weights.get(*model_id) else {
                continue;
            };
            let Some(value) = prediction
                .inference_output
                .get("value")
                .and_then(Value::as_f64)
            else {
                continue;
            };
            weighted_sum += weight * value;
            weight_sum += weight;
        }

        if weight_sum < 1e-12 {
            continue;
        }

        let Some((_, first)) = members.first() else {
            continue;
        };
        let mut meta = Map::new();
        meta.insert("ensemble_name".to_string(), json!(name));
        meta.insert(
            "weights".to_string(),
            json!(weights.iter().collect::<BTreeMap<_, _>>()),
        );

        out.push(PredictionRecord {
            id: format!("PRE_{virtual_model_id}_{input_id}_{scope_key}"),
            input_id,
            model_id: virtual_model_id.clone(),
            config_id: first.config_id.clone(),
            scope_key,
            scope: first.scope.clone(),
            status: PredictionStatus::Pending,
            exec_time_us: 0,
            inference_output: json!({"value": weighted_sum / weight_sum}),
            score: None,
            meta,
            performed_at: now,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PredictionScope;

    fn scope() -> PredictionScope {
        PredictionScope {
            subject: "BTC".to_string(),
            horizon_seconds: 60,
            step_seconds: 60,
            extra: Map::new(),
        }
    }

    fn prediction(model: &str, input: &str, value: f64) -> PredictionRecord {
        PredictionRecord {
            id: format!("PRE_{model}_{input}"),
            input_id: input.to_string(),
            model_id: model.to_string(),
            config_id: Some("CFG_1".to_string()),
            scope_key: "default".to_string(),
            scope: scope(),
            status: PredictionStatus::Scored,
            exec_time_us: 1_000,
            inference_output: json!({"value": value}),
            score: None,
            meta: Map::new(),
            performed_at: Utc::now(),
        }
    }

    #[test]
    fn ensemble_namespace_is_reserved() {
        assert_eq!(ensemble_model_id("main"), "__ensemble_main__");
        assert!(is_ensemble_model("__ensemble_main__"));
        assert!(!is_ensemble_model("model-7"));
    }

    #[test]
    fn inverse_variance_weights_normalize() {
        // Variances 1 and 4 → raw weights 1 and 0.25 → normalized 0.8 / 0.2.
        let mut series = BTreeMap::new();
        series.insert("a".to_string(), vec![0.0, 2.0]); // var 1
        series.insert("b".to_string(), vec![0.0, 4.0]); // var 4
        let weights = compute_weights(WeightStrategy::InverseVariance, &series);
        assert!((weights["a"] - 0.8).abs() < 1e-12);
        assert!((weights["b"] - 0.2).abs() < 1e-12);
        assert!((weights.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn equal_weight_splits_evenly() {
        let mut series = BTreeMap::new();
        series.insert("a".to_string(), vec![1.0]);
        series.insert("b".to_string(), vec![2.0]);
        series.insert("c".to_string(), vec![3.0]);
        let weights = compute_weights(WeightStrategy::EqualWeight, &series);
        for w in weights.values() {
            assert!((w - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn degenerate_series_fall_back_to_equal_weight() {
        let mut series = BTreeMap::new();
        series.insert("a".to_string(), vec![1.0, 1.0]); // zero variance
        series.insert("b".to_string(), vec![5.0]); // too short
        let weights = compute_weights(WeightStrategy::InverseVariance, &series);
        assert!((weights["a"] - 0.5).abs() < 1e-12);
        assert!((weights["b"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn top_n_filter_keeps_best_by_value() {
        let mut metrics = BTreeMap::new();
        for (model, value) in [("a", 0.3), ("b", 0.9), ("c", 0.5)] {
            let mut m = BTreeMap::new();
            m.insert("value".to_string(), value);
            metrics.insert(model.to_string(), m);
        }
        let candidates: BTreeMap<String, Vec<f64>> = ["a", "b", "c"]
            .iter()
            .map(|m| (m.to_string(), vec![0.0, 1.0]))
            .collect();

        let kept = apply_model_filter(Some(&ModelFilter::TopN { n: 2 }), &metrics, candidates);
        assert!(kept.contains_key("b"));
        assert!(kept.contains_key("c"));
        assert!(!kept.contains_key("a"));
    }

    #[test]
    fn min_metric_filter_applies_threshold() {
        let mut metrics = BTreeMap::new();
        for (model, ic) in [("a", 0.02), ("b", -0.01)] {
            let mut m = BTreeMap::new();
            m.insert("ic".to_string(), ic);
            metrics.insert(model.to_string(), m);
        }
        let candidates: BTreeMap<String, Vec<f64>> = ["a", "b"]
            .iter()
            .map(|m| (m.to_string(), vec![0.0]))
            .collect();

        let kept = apply_model_filter(
            Some(&ModelFilter::MinMetric {
                name: "ic".to_string(),
                threshold: 0.0,
            }),
            &metrics,
            candidates,
        );
        assert!(kept.contains_key("a"));
        assert!(!kept.contains_key("b"));
    }

    #[test]
    fn synthetic_prediction_is_weighted_average() {
        let pa = prediction("a", "INP_1", 1.0);
        let pb = prediction("b", "INP_1", 2.0);
        let mut by_model: BTreeMap<String, Vec<&PredictionRecord>> = BTreeMap::new();
        by_model.insert("a".to_string(), vec![&pa]);
        by_model.insert("b".to_string(), vec![&pb]);

        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), 0.8);
        weights.insert("b".to_string(), 0.2);

        let out = build_ensemble_predictions("main", &weights, &by_model, Utc::now());
        assert_eq!(out.len(), 1);
        let value = out[0].inference_output["value"].as_f64().unwrap();
        assert!((value - 1.2).abs() < 1e-12);
        assert_eq!(out[0].model_id, "__ensemble_main__");
        assert_eq!(out[0].status, PredictionStatus::Pending);
        assert_eq!(out[0].meta["ensemble_name"], json!("main"));
    }

    #[test]
    fn groups_without_weighted_members_are_dropped() {
        let pa = prediction("a", "INP_1", 1.0);
        let mut by_model: BTreeMap<String, Vec<&PredictionRecord>> = BTreeMap::new();
        by_model.insert("a".to_string(), vec![&pa]);

        let weights = BTreeMap::new();
        let out = build_ensemble_predictions("main", &weights, &by_model, Utc::now());
        assert!(out.is_empty());
    }
}
