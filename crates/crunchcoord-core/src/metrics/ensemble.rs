// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ensemble-aware metrics. These only produce meaningful values when the
//! context carries ensemble predictions; the score engine schedules them
//! accordingly.

use super::{
    extract_actual_returns, extract_signal_values, spearman_correlation, MetricsContext,
    PredictionView, ScoreView,
};
use crate::ensemble::is_ensemble_model;

/// Spearman correlation of this model's signal to the first configured
/// ensemble's output.
pub fn compute_ensemble_correlation(
    predictions: &[PredictionView],
    _scores: &[ScoreView],
    context: &MetricsContext,
) -> f64 {
    let my_signals = extract_signal_values(predictions);
    if my_signals.len() < 2 {
        return 0.0;
    }

    for ensemble_preds in context.ensemble_predictions.values() {
        let ensemble_signals = extract_signal_values(ensemble_preds);
        if ensemble_signals.len() < 2 {
            continue;
        }
        return spearman_correlation(&my_signals, &ensemble_signals);
    }
    0.0
}

/// Leave-one-out contribution: IC of the full ensemble minus the IC of an
/// equal-weight ensemble of everyone else. Positive means this model helps.
pub fn compute_contribution(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    context: &MetricsContext,
) -> f64 {
    let my_signals = extract_signal_values(predictions);
    if my_signals.len() < 2 {
        return 0.0;
    }

    let Some(ensemble_preds) = context.ensemble_predictions.values().next() else {
        return 0.0;
    };
    let ensemble_signals = extract_signal_values(ensemble_preds);
    if ensemble_signals.len() < 2 {
        return 0.0;
    }

    let others: Vec<&Vec<PredictionView>> = context
        .all_model_predictions
        .iter()
        .filter(|(id, _)| *id != &context.model_id && !is_ensemble_model(id))
        .map(|(_, preds)| preds)
        .collect();
    if others.is_empty() {
        return 0.0;
    }

    let n_preds = my_signals.len().min(ensemble_signals.len());
    let mut loo = vec![0.0; n_preds];
    for other_preds in &others {
        let other_signals = extract_signal_values(other_preds);
        for (i, slot) in loo.iter_mut().enumerate().take(other_signals.len().min(n_preds)) {
            *slot += other_signals[i] / others.len() as f64;
        }
    }

    let returns = extract_actual_returns(scores);
    if returns.len() < 2 {
        return 0.0;
    }

    let ic_full = spearman_correlation(&ensemble_signals[..n_preds], &returns[..n_preds.min(returns.len())]);
    let ic_loo = spearman_correlation(&loo, &returns[..n_preds.min(returns.len())]);
    ic_full - ic_loo
}

/// Feature-neutral correlation: IC of the residual after removing the mean
/// signal across all real models. With a single model it degrades to plain
/// IC.
pub fn compute_fnc(
    predictions: &[PredictionView],
    scores: &[ScoreView],
    context: &MetricsContext,
) -> f64 {
    let my_signals = extract_signal_values(predictions);
    if my_signals.len() < 2 {
        return 0.0;
    }

    let returns = extract_actual_returns(scores);
    let n = my_signals.len().min(returns.len());
    if n < 2 {
        return 0.0;
    }

    let real_models: Vec<&Vec<PredictionView>> = context
        .all_model_predictions
        .iter()
        .filter(|(id, _)| !is_ensemble_model(id))
        .map(|(_, preds)| preds)
        .collect();
    if real_models.len() <= 1 {
        return spearman_correlation(&my_signals[..n], &returns[..n]);
    }

    let mut mean_signals = vec![0.0; n];
    for model_preds in &real_models {
        let signals = extract_signal_values(model_preds);
        for (i, slot) in mean_signals.iter_mut().enumerate().take(signals.len().min(n)) {
            *slot += signals[i] / real_models.len() as f64;
        }
    }

    let residuals: Vec<f64> = (0..n).map(|i| my_signals[i] - mean_signals[i]).collect();
    spearman_correlation(&residuals, &returns[..n])
}
