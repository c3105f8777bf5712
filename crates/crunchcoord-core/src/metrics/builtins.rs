// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Built-in metric implementations.
//!
//! Predictions carry the model's signal; scores carry the per-prediction
//! scoring result including the realized return attached at resolution time.

use super::{
    extract_actual_returns, extract_score_values, extract_signal_values, spearman_correlation,
    MetricsContext, PredictionView, ScoreView,
};
use crate::ensemble::is_ensemble_model;

/// Information coefficient: Spearman rank correlation between prediction
/// signals and realized returns over the window.
pub fn compute_ic(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let signals = extract_signal_values(predictions);
    let returns = extract_actual_returns(scores);
    spearman_correlation(&signals, &returns)
}

/// IC Sharpe: mean over std of per-chunk ICs. Rewards consistency rather
/// than one lucky stretch. Fewer than two chunks is undefined and reports
/// 0.0.
pub fn compute_ic_sharpe(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let signals = extract_signal_values(predictions);
    let returns = extract_actual_returns(scores);
    let n = signals.len().min(returns.len());
    if n < 4 {
        return 0.0;
    }

    let chunk_size = 2.max(n / 3.max(n / 10));
    let mut ics = Vec::new();
    let mut start = 0;
    while start + chunk_size <= n {
        let end = (start + chunk_size).min(n);
        if end - start >= 2 {
            ics.push(spearman_correlation(&signals[start..end], &returns[start..end]));
        }
        start += chunk_size;
    }

    if ics.len() < 2 {
        return 0.0;
    }

    let mean = ics.iter().sum::<f64>() / ics.len() as f64;
    let var = ics.iter().map(|ic| (ic - mean).powi(2)).sum::<f64>() / ics.len() as f64;
    let std = var.sqrt();

    if std < 1e-12 {
        // All chunk ICs identical.
        return if mean.abs() > 1e-12 { f64::INFINITY } else { 0.0 };
    }
    mean / std
}

/// Mean realized return of a long-short portfolio built from the signals:
/// positive signal goes long, negative goes short.
pub fn compute_mean_return(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let returns = strategy_returns(predictions, scores);
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().sum::<f64>() / returns.len() as f64
}

/// Fraction of predictions whose sign matches the realized sign.
pub fn compute_hit_rate(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let signals = extract_signal_values(predictions);
    let returns = extract_actual_returns(scores);
    let n = signals.len().min(returns.len());
    if n == 0 {
        return 0.0;
    }
    let correct = (0..n)
        .filter(|&i| (signals[i] >= 0.0) == (returns[i] >= 0.0))
        .count();
    correct as f64 / n as f64
}

/// Mean pairwise Spearman correlation of this model's signal against every
/// other real model's aligned signal. Ensembles are excluded from the pool.
pub fn compute_model_correlation(
    predictions: &[PredictionView],
    _scores: &[ScoreView],
    context: &MetricsContext,
) -> f64 {
    let my_signals = extract_signal_values(predictions);
    if my_signals.len() < 2 {
        return 0.0;
    }

    let mut correlations = Vec::new();
    for (other_id, other_preds) in &context.all_model_predictions {
        if other_id == &context.model_id || is_ensemble_model(other_id) {
            continue;
        }
        let other_signals = extract_signal_values(other_preds);
        if other_signals.len() < 2 {
            continue;
        }
        correlations.push(spearman_correlation(&my_signals, &other_signals));
    }

    if correlations.is_empty() {
        return 0.0;
    }
    correlations.iter().sum::<f64>() / correlations.len() as f64
}

/// Worst peak-to-trough on the cumulative score series. Zero or negative;
/// more negative is worse.
pub fn compute_max_drawdown(
    _predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let values = extract_score_values(scores);
    if values.len() < 2 {
        return 0.0;
    }

    let mut cumulative = 0.0;
    let mut peak = 0.0;
    let mut max_dd = 0.0;
    for v in values {
        cumulative += v;
        if cumulative > peak {
            peak = cumulative;
        }
        let dd = cumulative - peak;
        if dd < max_dd {
            max_dd = dd;
        }
    }
    max_dd
}

/// Mean strategy return over downside deviation; only negative returns are
/// penalized.
pub fn compute_sortino_ratio(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let returns = strategy_returns(predictions, scores);
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let downside_sq: Vec<f64> = returns.iter().filter(|r| **r < 0.0).map(|r| r * r).collect();

    if downside_sq.is_empty() {
        return if mean != 0.0 { mean / 1e-9 } else { 0.0 };
    }

    let downside_dev = (downside_sq.iter().sum::<f64>() / downside_sq.len() as f64).sqrt();
    if downside_dev < 1e-12 {
        return 0.0;
    }
    mean / downside_dev
}

/// Mean absolute change in signal between consecutive predictions. Lower is
/// a more stable signal.
pub fn compute_turnover(
    predictions: &[PredictionView],
    _scores: &[ScoreView],
    _context: &MetricsContext,
) -> f64 {
    let signals = extract_signal_values(predictions);
    if signals.len() < 2 {
        return 0.0;
    }
    let changes: f64 = signals.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    changes / (signals.len() - 1) as f64
}

fn strategy_returns(predictions: &[PredictionView], scores: &[ScoreView]) -> Vec<f64> {
    let signals = extract_signal_values(predictions);
    let returns = extract_actual_returns(scores);
    let n = signals.len().min(returns.len());
    (0..n)
        .map(|i| if signals[i] >= 0.0 { returns[i] } else { -returns[i] })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn preds(values: &[f64]) -> Vec<PredictionView> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| PredictionView {
                model_id: "m1".to_string(),
                input_id: format!("INP_{i}"),
                scope_key: "default".to_string(),
                inference_output: json!({"value": v}),
                performed_at: Utc::now(),
            })
            .collect()
    }

    fn scores_with_returns(pairs: &[(f64, f64)]) -> Vec<ScoreView> {
        pairs
            .iter()
            .map(|(value, actual)| ScoreView {
                result: json!({"value": value, "actual_return": actual}),
                scored_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn ic_is_one_for_rank_aligned_signals() {
        let p = preds(&[0.1, 0.2, 0.3, 0.4]);
        let s = scores_with_returns(&[(1.0, 0.01), (1.0, 0.02), (1.0, 0.03), (1.0, 0.04)]);
        let ic = compute_ic(&p, &s, &MetricsContext::default());
        assert!((ic - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hit_rate_counts_sign_matches() {
        let p = preds(&[0.5, -0.5, 0.5, -0.5]);
        let s = scores_with_returns(&[(0.0, 0.01), (0.0, 0.01), (0.0, -0.02), (0.0, -0.02)]);
        // signs: (+,+) hit, (-,+) miss, (+,-) miss, (-,-) hit → 0.5
        assert!((compute_hit_rate(&p, &s, &MetricsContext::default()) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mean_return_flips_shorts() {
        let p = preds(&[1.0, -1.0]);
        let s = scores_with_returns(&[(0.0, 0.02), (0.0, -0.04)]);
        // long +0.02, short of -0.04 → +0.04; mean = 0.03
        let mr = compute_mean_return(&p, &s, &MetricsContext::default());
        assert!((mr - 0.03).abs() < 1e-12);
    }

    #[test]
    fn max_drawdown_finds_worst_trough() {
        let s = scores_with_returns(&[(1.0, 0.0), (-3.0, 0.0), (1.0, 0.0), (-2.0, 0.0)]);
        // cumulative: 1, -2, -1, -3; peak 1 → worst dd = -4
        let dd = compute_max_drawdown(&[], &s, &MetricsContext::default());
        assert!((dd + 4.0).abs() < 1e-12);
    }

    #[test]
    fn turnover_averages_absolute_changes() {
        let p = preds(&[0.0, 1.0, -1.0]);
        let t = compute_turnover(&p, &[], &MetricsContext::default());
        assert!((t - 1.5).abs() < 1e-12);
    }

    #[test]
    fn sortino_penalizes_only_downside() {
        let p = preds(&[1.0, 1.0, 1.0, 1.0]);
        let s = scores_with_returns(&[(0.0, 0.02), (0.0, -0.01), (0.0, 0.02), (0.0, -0.01)]);
        let ratio = compute_sortino_ratio(&p, &s, &MetricsContext::default());
        // mean = 0.005, downside dev = 0.01
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn model_correlation_averages_over_peers() {
        let mine = preds(&[1.0, 2.0, 3.0]);
        let mut context = MetricsContext {
            model_id: "m1".to_string(),
            ..MetricsContext::default()
        };
        let mut aligned = preds(&[2.0, 4.0, 6.0]);
        for p in &mut aligned {
            p.model_id = "m2".to_string();
        }
        let mut inverse = preds(&[3.0, 2.0, 1.0]);
        for p in &mut inverse {
            p.model_id = "m3".to_string();
        }
        context
            .all_model_predictions
            .insert("m1".to_string(), mine.clone());
        context.all_model_predictions.insert("m2".to_string(), aligned);
        context.all_model_predictions.insert("m3".to_string(), inverse);

        // corr(m2)=1, corr(m3)=-1 → mean 0
        let corr = compute_model_correlation(&mine, &[], &context);
        assert!(corr.abs() < 1e-12);
    }

    #[test]
    fn ic_sharpe_needs_enough_chunks() {
        let p = preds(&[0.1, 0.2, 0.3]);
        let s = scores_with_returns(&[(0.0, 0.1), (0.0, 0.2), (0.0, 0.3)]);
        assert_eq!(compute_ic_sharpe(&p, &s, &MetricsContext::default()), 0.0);

        let values: Vec<f64> = (0..12).map(|i| i as f64 / 10.0).collect();
        let p = preds(&values);
        let s: Vec<ScoreView> = values
            .iter()
            .map(|v| ScoreView {
                result: json!({"value": 0.0, "actual_return": v}),
                scored_at: Utc::now(),
            })
            .collect();
        // Perfectly rank-aligned in every chunk → identical ICs → infinite
        // consistency, reported as +inf here and clamped by the registry.
        assert!(compute_ic_sharpe(&p, &s, &MetricsContext::default()).is_infinite());
    }
}
