// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use crunchcoord_core::schedule::CheckpointCadence;
use crunchcoord_core::{CoordError, CoordResult};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> CoordResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| CoordError::Config(format!("invalid value for {key}: `{raw}`"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Environment-driven runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub crunch_id: String,
    pub crunch_pubkey: String,
    pub compute_provider_pubkey: Option<String>,
    pub data_provider_pubkey: Option<String>,

    pub feed_source: String,
    pub feed_subjects: Vec<String>,
    pub feed_kind: String,
    pub feed_granularity: String,
    pub feed_poll_interval: Duration,
    pub feed_fetch_timeout: Duration,
    pub feed_record_ttl_days: i64,

    pub score_interval: Duration,
    pub checkpoint_cadence: CheckpointCadence,
    pub input_resolution_ttl: Duration,

    pub model_runner_host: String,
    pub model_runner_port: u16,
    pub predict_timeout: Duration,
    pub tick_timeout: Duration,
    pub model_sync_interval: Duration,
    pub consecutive_failure_limit: u32,
    pub consecutive_timeout_limit: u32,

    pub scoring_function: Option<String>,
    pub inference_input_builder: Option<String>,
    pub inference_output_validator: Option<String>,

    pub api_key: Option<String>,
    pub api_read_auth: bool,
    pub api_public_prefixes: Vec<String>,
    pub api_admin_prefixes: Vec<String>,

    pub backfill_dir: PathBuf,
    pub backfill_page_size: u32,
}

const DEFAULT_PUBLIC_PREFIXES: &[&str] = &[
    "/healthz",
    "/reports/leaderboard",
    "/reports/models",
    "/reports/merkle",
];

const DEFAULT_ADMIN_PREFIXES: &[&str] = &["/reports/backfill", "/reports/checkpoints/"];

impl RuntimeSettings {
    pub fn from_env() -> CoordResult<Self> {
        let subjects_raw = env_string("FEED_SUBJECTS", "BTC");
        let feed_subjects: Vec<String> = subjects_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if feed_subjects.is_empty() {
            return Err(CoordError::Config("FEED_SUBJECTS must not be empty".to_string()));
        }

        let granularity = env_string("FEED_GRANULARITY", "1m");
        let poll_default = granularity_seconds(&granularity).unwrap_or(60);

        let cadence_raw = env_opt("CHECKPOINT_CRON");
        let checkpoint_cadence = match cadence_raw {
            Some(raw) => CheckpointCadence::parse(&raw)?,
            None => CheckpointCadence {
                interval_seconds: env_parse("CHECKPOINT_INTERVAL_SECONDS", 7 * 24 * 3600u64)?,
            },
        };

        Ok(Self {
            crunch_id: env_string("CRUNCH_ID", "starter-challenge"),
            crunch_pubkey: env_string("CRUNCH_PUBKEY", ""),
            compute_provider_pubkey: env_opt("COMPUTE_PROVIDER_PUBKEY"),
            data_provider_pubkey: env_opt("DATA_PROVIDER_PUBKEY"),

            feed_source: env_string("FEED_SOURCE", "binance"),
            feed_subjects,
            feed_kind: env_string("FEED_KIND", "candle"),
            feed_granularity: granularity,
            feed_poll_interval: Duration::from_secs(env_parse(
                "FEED_POLL_INTERVAL_SECONDS",
                poll_default,
            )?),
            feed_fetch_timeout: Duration::from_secs(env_parse("FEED_FETCH_TIMEOUT_SECONDS", 10u64)?),
            feed_record_ttl_days: env_parse("FEED_RECORD_TTL_DAYS", 90i64)?,

            score_interval: Duration::from_secs(env_parse("SCORE_INTERVAL_SECONDS", 60u64)?),
            checkpoint_cadence,
            input_resolution_ttl: Duration::from_secs(env_parse(
                "INPUT_RESOLUTION_TTL_SECONDS",
                24 * 3600u64,
            )?),

            model_runner_host: env_string("MODEL_RUNNER_HOST", "model-orchestrator"),
            model_runner_port: env_parse("MODEL_RUNNER_PORT", 9091u16)?,
            predict_timeout: Duration::from_millis(env_parse("PREDICT_TIMEOUT_MS", 1_000u64)?),
            tick_timeout: Duration::from_millis(env_parse("TICK_TIMEOUT_MS", 50_000u64)?),
            model_sync_interval: Duration::from_secs(env_parse("MODEL_SYNC_INTERVAL_SECONDS", 30u64)?),
            consecutive_failure_limit: env_parse("MODEL_CONSECUTIVE_FAILURE_LIMIT", 10u32)?,
            consecutive_timeout_limit: env_parse("MODEL_CONSECUTIVE_TIMEOUT_LIMIT", 5u32)?,

            scoring_function: env_opt("SCORING_FUNCTION"),
            inference_input_builder: env_opt("INFERENCE_INPUT_BUILDER"),
            inference_output_validator: env_opt("INFERENCE_OUTPUT_VALIDATOR"),

            api_key: env_opt("API_KEY"),
            api_read_auth: env_bool("API_READ_AUTH", false),
            api_public_prefixes: prefixes_from_env("API_PUBLIC_PREFIXES", DEFAULT_PUBLIC_PREFIXES),
            api_admin_prefixes: prefixes_from_env("API_ADMIN_PREFIXES", DEFAULT_ADMIN_PREFIXES),

            backfill_dir: PathBuf::from(env_string("BACKFILL_DIR", "data/backfill")),
            backfill_page_size: env_parse("BACKFILL_PAGE_SIZE", 500u32)?,
        })
    }

    pub fn feed_interval_seconds(&self) -> u64 {
        granularity_seconds(&self.feed_granularity).unwrap_or(60)
    }
}

fn prefixes_from_env(key: &str, defaults: &[&str]) -> Vec<String> {
    match env_opt(key) {
        Some(raw) => raw
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        None => defaults.iter().map(|p| p.to_string()).collect(),
    }
}

/// Parse `1s`, `30s`, `1m`, `5m`, `1h`, `1d` style granularities.
pub fn granularity_seconds(granularity: &str) -> Option<u64> {
    let granularity = granularity.trim();
    if granularity.is_empty() {
        return None;
    }
    let (digits, unit) = granularity.split_at(granularity.len() - 1);
    let count: u64 = digits.parse().ok()?;
    let seconds = match unit {
        "s" => count,
        "m" => count * 60,
        "h" => count * 3600,
        "d" => count * 86_400,
        _ => return None,
    };
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularities_parse() {
        assert_eq!(granularity_seconds("1s"), Some(1));
        assert_eq!(granularity_seconds("1m"), Some(60));
        assert_eq!(granularity_seconds("15m"), Some(900));
        assert_eq!(granularity_seconds("1h"), Some(3600));
        assert_eq!(granularity_seconds("1d"), Some(86_400));
        assert_eq!(granularity_seconds("tick"), None);
        assert_eq!(granularity_seconds(""), None);
    }
}
