// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A registered participant model. Ensemble virtual models are first-class
/// rows in the same namespace, distinguished only by their id prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub deployment_id: String,
    pub owner_id: String,
    pub owner_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub model_id: String,
    pub model_name: Option<String>,
    pub cruncher_name: Option<String>,
    pub score: f64,
    pub metrics: Map<String, Value>,
}

/// A ranked list at a point in time. Rebuilt each cycle, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}
