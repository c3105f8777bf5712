// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness: an in-memory store, a scripted model transport and the
//! full predict/score/checkpoint pipeline wired the way the daemon wires it.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crunchcoord_core::contract::{CallableRegistry, CrunchConfig};
use crunchcoord_core::emission::EmissionParties;
use crunchcoord_core::entities::{FeedRecord, FeedScope, PredictionScope, ScheduledPredictionConfig};
use crunchcoord_core::metrics::MetricsRegistry;
use crunchcoord_core::schedule::{CheckpointCadence, ScheduleEnvelope};

use crunchcoord_daemon::bus::Bus;
use crunchcoord_daemon::checkpoint::CheckpointBuilder;
use crunchcoord_daemon::predict::PredictOrchestrator;
use crunchcoord_daemon::runner::{ModelInfo, ModelRunner, ModelTransport, PredictReply, RunnerConfig, TransportError};
use crunchcoord_daemon::score::ScoreEngine;
use crunchcoord_daemon::store::Store;
use crunchcoord_daemon::telemetry::{AuditLog, Telemetry};

pub const SOURCE: &str = "synthetic";
pub const SUBJECT: &str = "BTC";
pub const KIND: &str = "candle";
pub const GRANULARITY: &str = "1m";

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Respond with `{"value": v}`.
    Value(f64),
    /// Sleep past the predict deadline.
    Timeout,
    /// Respond with an output that fails shape validation.
    Invalid,
    /// Channel closed.
    Unavailable,
    /// Explicit model-side failure.
    Fail,
}

pub struct ScriptedTransport {
    pub models: parking_lot::Mutex<Vec<(ModelInfo, Behavior)>>,
}

impl ScriptedTransport {
    pub fn new(models: Vec<(&str, Behavior)>) -> Self {
        Self {
            models: parking_lot::Mutex::new(
                models
                    .into_iter()
                    .map(|(id, behavior)| {
                        (
                            ModelInfo {
                                id: id.to_string(),
                                name: format!("{id}-name"),
                                deployment_id: "dep-1".to_string(),
                                owner_id: format!("owner-{id}"),
                                owner_name: format!("Owner {id}"),
                            },
                            behavior,
                        )
                    })
                    .collect(),
            ),
        }
    }

    fn behavior(&self, model_id: &str) -> Option<Behavior> {
        self.models
            .lock()
            .iter()
            .find(|(info, _)| info.id == model_id)
            .map(|(_, behavior)| *behavior)
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        Ok(self.models.lock().iter().map(|(info, _)| info.clone()).collect())
    }

    async fn tick(&self, _model_id: &str, _input: &Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn predict(
        &self,
        model_id: &str,
        _scope_key: &str,
        _scope: &Value,
    ) -> Result<PredictReply, TransportError> {
        match self.behavior(model_id) {
            Some(Behavior::Value(v)) => Ok(PredictReply {
                success: true,
                output: json!({"value": v}),
                exec_time_us: 1_500,
                detail: String::new(),
            }),
            Some(Behavior::Timeout) => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(PredictReply {
                    success: true,
                    output: json!({"value": 0.0}),
                    exec_time_us: 0,
                    detail: String::new(),
                })
            }
            Some(Behavior::Invalid) => Ok(PredictReply {
                success: true,
                output: json!({"value": "not-a-number"}),
                exec_time_us: 700,
                detail: String::new(),
            }),
            Some(Behavior::Unavailable) => {
                Err(TransportError::Unavailable("channel closed".to_string()))
            }
            Some(Behavior::Fail) => Ok(PredictReply {
                success: false,
                output: Value::Null,
                exec_time_us: 0,
                detail: "model raised".to_string(),
            }),
            None => Err(TransportError::Unavailable("not registered".to_string())),
        }
    }
}

pub struct Harness {
    pub store: Store,
    pub runner: Arc<ModelRunner>,
    pub transport: Arc<ScriptedTransport>,
    pub orchestrator: PredictOrchestrator,
    pub engine: ScoreEngine,
    pub checkpoints: CheckpointBuilder,
    pub bus: Bus,
    pub _tmp: TempDir,
}

pub fn test_contract() -> CrunchConfig {
    CrunchConfig {
        crunch_id: "test-crunch".to_string(),
        parties: EmissionParties {
            crunch: "crunch-pubkey".to_string(),
            compute_provider: Some("cp-wallet".to_string()),
            data_provider: Some("dp-wallet".to_string()),
        },
        scope: PredictionScope {
            subject: SUBJECT.to_string(),
            horizon_seconds: 120,
            step_seconds: 60,
            extra: Map::new(),
        },
        metrics: vec![
            "ic".to_string(),
            "hit_rate".to_string(),
            "mean_return".to_string(),
        ],
        ..CrunchConfig::default()
    }
}

pub async fn build_harness(models: Vec<(&str, Behavior)>, contract: CrunchConfig) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open_in_memory().expect("store");
    let telemetry = Telemetry::new();
    let audit = AuditLog::new(tmp.path().join("logs"));
    let bus = Bus::default();

    let registry = CallableRegistry::with_builtins();
    let callables = registry.freeze(&contract.callables).expect("callables freeze");

    let transport = Arc::new(ScriptedTransport::new(models));
    let runner = Arc::new(ModelRunner::new(
        transport.clone(),
        RunnerConfig {
            predict_timeout: Duration::from_millis(50),
            tick_timeout: Duration::from_millis(200),
            consecutive_failure_limit: 10,
            consecutive_timeout_limit: 3,
        },
        telemetry.clone(),
    ));
    runner.sync_once().await.expect("initial model sync");
    for info in runner.live_models() {
        let now = Utc::now();
        store
            .upsert_model(&crunchcoord_core::entities::Model {
                id: info.id,
                name: info.name,
                deployment_id: info.deployment_id,
                owner_id: info.owner_id,
                owner_name: info.owner_name,
                overall_score: None,
                meta: Map::new(),
                created_at: now,
                updated_at: now,
            })
            .expect("model upsert");
    }

    store
        .upsert_prediction_config(&ScheduledPredictionConfig {
            id: "CFG_test".to_string(),
            scope_key: "btc-120s".to_string(),
            scope: contract.scope.clone(),
            schedule: ScheduleEnvelope {
                every_seconds: 60,
                resolve_after_seconds: Some(120),
            },
            active: true,
            order: 0,
        })
        .expect("config upsert");

    let orchestrator = PredictOrchestrator::new(
        store.clone(),
        runner.clone(),
        callables.clone(),
        contract.clone(),
        SOURCE.to_string(),
        KIND.to_string(),
        GRANULARITY.to_string(),
        60,
        telemetry.clone(),
        audit.clone(),
    );

    let engine = ScoreEngine::new(
        store.clone(),
        callables.clone(),
        contract.clone(),
        MetricsRegistry::with_builtins(),
        SOURCE.to_string(),
        KIND.to_string(),
        GRANULARITY.to_string(),
        60,
        Duration::from_secs(24 * 3600),
        telemetry.clone(),
        audit.clone(),
        bus.clone(),
    );

    let checkpoints = CheckpointBuilder::new(
        store.clone(),
        contract.clone(),
        callables.emission,
        contract.parties.clone(),
        CheckpointCadence::WEEKLY,
        telemetry,
        audit,
        bus.clone(),
    );

    Harness {
        store,
        runner,
        transport,
        orchestrator,
        engine,
        checkpoints,
        bus,
        _tmp: tmp,
    }
}

pub fn feed_scope() -> FeedScope {
    FeedScope::new(SOURCE, SUBJECT, KIND, GRANULARITY)
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

/// Seed a rising tape around `t0`: one candle per minute over
/// `[t0 - lookback_minutes, t0 + lookahead_minutes]`.
pub fn seed_feed(store: &Store, lookback_minutes: i64, lookahead_minutes: i64) {
    let scope = feed_scope();
    let mut records = Vec::new();
    for offset in -lookback_minutes..=lookahead_minutes {
        let ts = t0() + ChronoDuration::minutes(offset);
        let close = 100.0 + offset as f64 * 0.5;
        let mut values = Map::new();
        values.insert("open".to_string(), json!(close - 0.2));
        values.insert("high".to_string(), json!(close + 0.3));
        values.insert("low".to_string(), json!(close - 0.4));
        values.insert("close".to_string(), json!(close));
        values.insert("volume".to_string(), json!(2.0));
        records.push(FeedRecord {
            id: format!("FR_seed_{offset}"),
            scope: scope.clone(),
            ts_event: ts,
            ts_ingested: ts,
            values,
            meta: Map::new(),
        });
    }
    store
        .ingest_feed_batch(&scope, &records, t0())
        .expect("seed feed");
}

/// Grouped per-model prediction statuses for one input.
pub fn statuses_for_input(store: &Store, input_id: &str) -> BTreeMap<String, String> {
    store
        .predictions_for_input(input_id)
        .expect("predictions")
        .into_iter()
        .map(|p| (p.model_id, p.status.as_str().to_string()))
        .collect()
}
