// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use crunchcoord_protocol::EmissionPayload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schedule::ScheduleEnvelope;

/// The tuple a prediction is made over. `extra` carries competition-specific
/// dimensions (feed source, lookback, ...) without widening the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionScope {
    pub subject: String,
    pub horizon_seconds: u64,
    pub step_seconds: u64,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputStatus {
    Received,
    Resolved,
}

impl InputStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InputStatus::Received => "RECEIVED",
            InputStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RECEIVED" => Some(InputStatus::Received),
            "RESOLVED" => Some(InputStatus::Resolved),
            _ => None,
        }
    }

    /// The only legal transition is RECEIVED → RESOLVED.
    pub fn can_transition_to(self, next: InputStatus) -> bool {
        matches!((self, next), (InputStatus::Received, InputStatus::Resolved))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionStatus {
    Pending,
    Scored,
    Failed,
    Absent,
}

impl PredictionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionStatus::Pending => "PENDING",
            PredictionStatus::Scored => "SCORED",
            PredictionStatus::Failed => "FAILED",
            PredictionStatus::Absent => "ABSENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(PredictionStatus::Pending),
            "SCORED" => Some(PredictionStatus::Scored),
            "FAILED" => Some(PredictionStatus::Failed),
            "ABSENT" => Some(PredictionStatus::Absent),
            _ => None,
        }
    }

    /// PENDING is the only non-terminal state.
    pub fn can_transition_to(self, next: PredictionStatus) -> bool {
        matches!(
            (self, next),
            (
                PredictionStatus::Pending,
                PredictionStatus::Scored | PredictionStatus::Failed | PredictionStatus::Absent
            )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Pending,
    Submitted,
    Claimable,
    Paid,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "PENDING",
            CheckpointStatus::Submitted => "SUBMITTED",
            CheckpointStatus::Claimable => "CLAIMABLE",
            CheckpointStatus::Paid => "PAID",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(CheckpointStatus::Pending),
            "SUBMITTED" => Some(CheckpointStatus::Submitted),
            "CLAIMABLE" => Some(CheckpointStatus::Claimable),
            "PAID" => Some(CheckpointStatus::Paid),
            _ => None,
        }
    }

    /// Transitions advance one step at a time and never rewind.
    pub fn can_transition_to(self, next: CheckpointStatus) -> bool {
        matches!(
            (self, next),
            (CheckpointStatus::Pending, CheckpointStatus::Submitted)
                | (CheckpointStatus::Submitted, CheckpointStatus::Claimable)
                | (CheckpointStatus::Claimable, CheckpointStatus::Paid)
        )
    }
}

/// Declarative schedule for one prediction stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPredictionConfig {
    pub id: String,
    pub scope_key: String,
    pub scope: PredictionScope,
    pub schedule: ScheduleEnvelope,
    pub active: bool,
    pub order: i64,
}

/// One firing of a scheduled config. Actuals are filled in once the horizon
/// has elapsed; a `null` actuals value on a RESOLVED input is the
/// no-ground-truth sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    pub config_id: Option<String>,
    pub scope: PredictionScope,
    pub raw_input: Value,
    pub actuals: Option<Value>,
    pub status: InputStatus,
    pub performed_at: DateTime<Utc>,
    pub resolvable_at: DateTime<Utc>,
}

impl InputRecord {
    /// True when the input resolved but no ground truth could be derived.
    pub fn resolved_without_truth(&self) -> bool {
        self.status == InputStatus::Resolved
            && matches!(self.actuals, None | Some(Value::Null))
    }
}

/// Scoring outcome attached to a prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub value: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ScoreOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            success: false,
            failed_reason: Some(reason.into()),
            extra: Map::new(),
        }
    }
}

/// What one model answered for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub input_id: String,
    pub model_id: String,
    pub config_id: Option<String>,
    pub scope_key: String,
    pub scope: PredictionScope,
    pub status: PredictionStatus,
    pub exec_time_us: u64,
    pub inference_output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreOutcome>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    pub performed_at: DateTime<Utc>,
}

/// Per-model period summary; its content hash is a Merkle leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub model_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub prediction_count: u64,
    pub result_summary: Map<String, Value>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Coarse aggregation of cycles into one settlement payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub merkle_root: Option<String>,
    pub emission: EmissionPayload,
    pub status: CheckpointStatus,
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub emitted_at: Option<DateTime<Utc>>,
}
