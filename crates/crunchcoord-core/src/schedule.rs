// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};

/// Firing schedule for one prediction config.
///
/// `resolve_after_seconds` must exceed the effective feed interval or the
/// stream's predictions will never score; the orchestrator logs a warning on
/// violation but still fires (the misconfiguration is visible, not fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEnvelope {
    pub every_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_after_seconds: Option<u64>,
}

impl ScheduleEnvelope {
    pub fn every(seconds: u64) -> Self {
        Self {
            every_seconds: seconds,
            resolve_after_seconds: None,
        }
    }

    /// Resolution delay for this schedule, defaulting to the scope horizon.
    pub fn resolve_after(&self, horizon_seconds: u64) -> u64 {
        self.resolve_after_seconds.unwrap_or(horizon_seconds)
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        after + Duration::seconds(self.every_seconds.max(1) as i64)
    }
}

/// Coarse cadence for the checkpoint builder. Accepts either a plain number
/// of seconds or a cron alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCadence {
    pub interval_seconds: u64,
}

impl CheckpointCadence {
    pub const WEEKLY: CheckpointCadence = CheckpointCadence {
        interval_seconds: 7 * 24 * 3600,
    };

    /// Parse `@hourly`, `@daily`, `@weekly`, `@every_<n>s` or a bare number
    /// of seconds.
    pub fn parse(raw: &str) -> CoordResult<Self> {
        let raw = raw.trim();
        let interval_seconds = match raw {
            "@hourly" => 3600,
            "@daily" => 24 * 3600,
            "@weekly" => 7 * 24 * 3600,
            other => {
                if let Some(spec) = other.strip_prefix("@every_") {
                    let digits = spec.strip_suffix('s').unwrap_or(spec);
                    digits.parse::<u64>().map_err(|_| {
                        CoordError::Config(format!("invalid checkpoint cadence `{raw}`"))
                    })?
                } else {
                    other.parse::<u64>().map_err(|_| {
                        CoordError::Config(format!("invalid checkpoint cadence `{raw}`"))
                    })?
                }
            }
        };
        if interval_seconds == 0 {
            return Err(CoordError::Config(
                "checkpoint cadence must be positive".to_string(),
            ));
        }
        Ok(Self { interval_seconds })
    }
}
