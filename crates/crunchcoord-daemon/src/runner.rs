// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Participant model liveness and fan-out.
//!
//! The runner owns the only shared runtime state outside the store: the live
//! model set. A single background sync loop writes it; cycle fan-out reads a
//! snapshot. Models that fail or time out too many consecutive times are
//! evicted and stay excluded until they re-register under a new deployment.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crunchcoord_protocol::pb;
use crunchcoord_protocol::pb::model_runner_client::ModelRunnerClient;

use crate::telemetry::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub deployment_id: String,
    pub owner_id: String,
    pub owner_name: String,
}

#[derive(Debug, Clone)]
pub struct PredictReply {
    pub success: bool,
    pub output: Value,
    pub exec_time_us: u64,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel to the model is gone (closed, evicted mid-call).
    #[error("model unavailable: {0}")]
    Unavailable(String),
    /// The call reached the runtime but failed.
    #[error("call failed: {0}")]
    Call(String),
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError>;
    async fn tick(&self, model_id: &str, inference_input: &Value) -> Result<(), TransportError>;
    async fn predict(
        &self,
        model_id: &str,
        scope_key: &str,
        scope: &Value,
    ) -> Result<PredictReply, TransportError>;
}

// ── gRPC transport ──

pub struct GrpcTransport {
    endpoint: String,
    crunch_id: String,
    client: tokio::sync::Mutex<Option<ModelRunnerClient<tonic::transport::Channel>>>,
}

impl GrpcTransport {
    pub fn new(host: &str, port: u16, crunch_id: impl Into<String>) -> Self {
        Self {
            endpoint: format!("http://{host}:{port}"),
            crunch_id: crunch_id.into(),
            client: tokio::sync::Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<ModelRunnerClient<tonic::transport::Channel>, TransportError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = ModelRunnerClient::connect(self.endpoint.clone())
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            *guard = Some(client);
        }
        guard
            .clone()
            .ok_or_else(|| TransportError::Unavailable("no client".to_string()))
    }

    fn map_status(status: tonic::Status) -> TransportError {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::Cancelled => {
                TransportError::Unavailable(status.message().to_string())
            }
            _ => TransportError::Call(status.message().to_string()),
        }
    }
}

#[async_trait]
impl ModelTransport for GrpcTransport {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let mut client = self.client().await?;
        let response = client
            .list_models(pb::ListModelsRequest {
                crunch_id: self.crunch_id.clone(),
            })
            .await
            .map_err(Self::map_status)?
            .into_inner();
        Ok(response
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.model_id,
                name: m.model_name,
                deployment_id: m.deployment_id,
                owner_id: m.owner_id,
                owner_name: m.owner_name,
            })
            .collect())
    }

    async fn tick(&self, model_id: &str, inference_input: &Value) -> Result<(), TransportError> {
        let mut client = self.client().await?;
        let response = client
            .tick(pb::TickRequest {
                crunch_id: self.crunch_id.clone(),
                model_id: model_id.to_string(),
                inference_input_json: inference_input.to_string().into_bytes(),
            })
            .await
            .map_err(Self::map_status)?
            .into_inner();
        if response.status == pb::CallStatus::Success as i32 {
            Ok(())
        } else {
            Err(TransportError::Call(response.detail))
        }
    }

    async fn predict(
        &self,
        model_id: &str,
        scope_key: &str,
        scope: &Value,
    ) -> Result<PredictReply, TransportError> {
        let mut client = self.client().await?;
        let response = client
            .predict(pb::PredictRequest {
                crunch_id: self.crunch_id.clone(),
                model_id: model_id.to_string(),
                scope_key: scope_key.to_string(),
                scope_json: scope.to_string().into_bytes(),
            })
            .await
            .map_err(Self::map_status)?
            .into_inner();

        let output = serde_json::from_slice(&response.inference_output_json)
            .unwrap_or(Value::Null);
        Ok(PredictReply {
            success: response.status == pb::CallStatus::Success as i32,
            output,
            exec_time_us: response.exec_time_us,
            detail: response.detail,
        })
    }
}

// ── liveness + quarantine ──

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub predict_timeout: Duration,
    pub tick_timeout: Duration,
    pub consecutive_failure_limit: u32,
    pub consecutive_timeout_limit: u32,
}

/// Raw per-model outcome of one fan-out; shape validation happens in the
/// orchestrator.
#[derive(Debug, Clone)]
pub enum ModelCallResult {
    Replied { output: Value, exec_time_us: u64 },
    Failed { reason: String },
    TimedOut,
    Absent,
}

#[derive(Debug, Default, Clone, Copy)]
struct FailureCounters {
    failures: u32,
    timeouts: u32,
}

pub struct ModelRunner {
    transport: Arc<dyn ModelTransport>,
    config: RunnerConfig,
    telemetry: Telemetry,
    live: RwLock<BTreeMap<String, ModelInfo>>,
    counters: Mutex<HashMap<String, FailureCounters>>,
    /// Evicted model id → the deployment it was evicted under.
    evicted: Mutex<HashMap<String, String>>,
}

impl ModelRunner {
    pub fn new(transport: Arc<dyn ModelTransport>, config: RunnerConfig, telemetry: Telemetry) -> Self {
        Self {
            transport,
            config,
            telemetry,
            live: RwLock::new(BTreeMap::new()),
            counters: Mutex::new(HashMap::new()),
            evicted: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_models(&self) -> Vec<ModelInfo> {
        self.live.read().values().cloned().collect()
    }

    /// Refresh the live set from the runtime. Evicted models stay excluded
    /// while they keep the same deployment; a new deployment re-admits them
    /// with fresh counters.
    pub async fn sync_once(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let listed = self.transport.list_models().await?;

        let mut evicted = self.evicted.lock();
        let mut counters = self.counters.lock();
        let mut live = self.live.write();

        live.clear();
        for info in &listed {
            if let Some(evicted_deployment) = evicted.get(&info.id) {
                if *evicted_deployment == info.deployment_id {
                    continue;
                }
                evicted.remove(&info.id);
                counters.remove(&info.id);
                tracing::info!(model_id=%info.id, deployment_id=%info.deployment_id, "evicted model re-registered");
            }
            live.insert(info.id.clone(), info.clone());
        }

        // Models that disappeared from the runtime lose their eviction mark
        // so a later registration starts clean.
        let listed_ids: HashSet<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        evicted.retain(|id, _| listed_ids.contains(id.as_str()));
        counters.retain(|id, _| listed_ids.contains(id.as_str()));

        self.telemetry.set_live_models(live.len());
        Ok(listed)
    }

    /// Concurrently call every live model: optional Tick priming, then
    /// Predict under the per-call deadline. One result per live model.
    pub async fn fan_out(
        &self,
        inference_input: &Value,
        scope_key: &str,
        scope: &Value,
        prime_with_tick: bool,
    ) -> BTreeMap<String, ModelCallResult> {
        let models = self.live_models();
        let mut join_set = tokio::task::JoinSet::new();

        for model in models {
            let transport = self.transport.clone();
            let input = inference_input.clone();
            let scope = scope.clone();
            let scope_key = scope_key.to_string();
            let predict_timeout = self.config.predict_timeout;
            let tick_timeout = self.config.tick_timeout;

            join_set.spawn(async move {
                if prime_with_tick {
                    let tick = tokio::time::timeout(tick_timeout, transport.tick(&model.id, &input));
                    match tick.await {
                        Ok(Ok(())) => {}
                        Ok(Err(TransportError::Unavailable(_))) => {
                            return (model.id, ModelCallResult::Absent);
                        }
                        Ok(Err(TransportError::Call(reason))) => {
                            return (model.id, ModelCallResult::Failed { reason });
                        }
                        Err(_) => return (model.id, ModelCallResult::TimedOut),
                    }
                }

                let predict =
                    tokio::time::timeout(predict_timeout, transport.predict(&model.id, &scope_key, &scope));
                let result = match predict.await {
                    Ok(Ok(reply)) if reply.success => ModelCallResult::Replied {
                        output: reply.output,
                        exec_time_us: reply.exec_time_us,
                    },
                    Ok(Ok(reply)) => ModelCallResult::Failed {
                        reason: if reply.detail.is_empty() {
                            "model reported failure".to_string()
                        } else {
                            reply.detail
                        },
                    },
                    Ok(Err(TransportError::Unavailable(_))) => ModelCallResult::Absent,
                    Ok(Err(TransportError::Call(reason))) => ModelCallResult::Failed { reason },
                    Err(_) => ModelCallResult::TimedOut,
                };
                (model.id, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((model_id, result)) => {
                    self.note_outcome(&model_id, &result);
                    results.insert(model_id, result);
                }
                Err(err) => {
                    tracing::warn!(error=%err, "model call task panicked");
                }
            }
        }
        results
    }

    /// Count an invalid-shape response against the model's failure streak.
    pub fn note_validation_failure(&self, model_id: &str) {
        self.bump_failures(model_id);
    }

    fn note_outcome(&self, model_id: &str, result: &ModelCallResult) {
        match result {
            ModelCallResult::Replied { .. } => {
                self.counters.lock().remove(model_id);
            }
            ModelCallResult::Failed { .. } => self.bump_failures(model_id),
            ModelCallResult::TimedOut => self.bump_timeouts(model_id),
            ModelCallResult::Absent => {}
        }
    }

    fn bump_failures(&self, model_id: &str) {
        let failures = {
            let mut counters = self.counters.lock();
            let entry = counters.entry(model_id.to_string()).or_default();
            entry.failures += 1;
            entry.timeouts = 0;
            entry.failures
        };
        if failures >= self.config.consecutive_failure_limit {
            self.evict(model_id, "consecutive_failures");
        }
    }

    fn bump_timeouts(&self, model_id: &str) {
        let timeouts = {
            let mut counters = self.counters.lock();
            let entry = counters.entry(model_id.to_string()).or_default();
            entry.timeouts += 1;
            entry.timeouts
        };
        if timeouts >= self.config.consecutive_timeout_limit {
            self.evict(model_id, "consecutive_timeouts");
        }
    }

    fn evict(&self, model_id: &str, reason: &str) {
        let removed = self.live.write().remove(model_id);
        if let Some(info) = removed {
            self.evicted
                .lock()
                .insert(model_id.to_string(), info.deployment_id);
            self.counters.lock().remove(model_id);
            self.telemetry.record_model_evicted(reason);
            self.telemetry.set_live_models(self.live.read().len());
            tracing::warn!(model_id=%model_id, reason=%reason, "model evicted from live set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ScriptedTransport {
        models: Vec<ModelInfo>,
        reply: Box<dyn Fn(&str) -> Result<PredictReply, TransportError> + Send + Sync>,
        delay: Duration,
    }

    #[async_trait]
    impl ModelTransport for ScriptedTransport {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
            Ok(self.models.clone())
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
            tokio::time::sleep(self.delay).await;
            (self.reply)(model_id)
        }
    }

    fn model(id: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            name: format!("{id}-name"),
            deployment_id: "dep-1".to_string(),
            owner_id: "owner".to_string(),
            owner_name: "Owner".to_string(),
        }
    }

    fn config(failure_limit: u32, timeout_limit: u32) -> RunnerConfig {
        RunnerConfig {
            predict_timeout: Duration::from_millis(50),
            tick_timeout: Duration::from_millis(50),
            consecutive_failure_limit: failure_limit,
            consecutive_timeout_limit: timeout_limit,
        }
    }

    #[tokio::test]
    async fn fan_out_classifies_replies_and_failures() {
        let transport = Arc::new(ScriptedTransport {
            models: vec![model("good"), model("bad"), model("gone")],
            reply: Box::new(|model_id| match model_id {
                "good" => Ok(PredictReply {
                    success: true,
                    output: json!({"value": 0.5}),
                    exec_time_us: 900,
                    detail: String::new(),
                }),
                "bad" => Ok(PredictReply {
                    success: false,
                    output: Value::Null,
                    exec_time_us: 0,
                    detail: "boom".to_string(),
                }),
                _ => Err(TransportError::Unavailable("closed".to_string())),
            }),
            delay: Duration::ZERO,
        });
        let runner = ModelRunner::new(transport, config(10, 10), Telemetry::new());
        runner.sync_once().await.unwrap();

        let results = runner
            .fan_out(&json!({}), "default", &json!({}), true)
            .await;
        assert!(matches!(results["good"], ModelCallResult::Replied { .. }));
        assert!(matches!(results["bad"], ModelCallResult::Failed { .. }));
        assert!(matches!(results["gone"], ModelCallResult::Absent));
    }

    #[tokio::test]
    async fn consecutive_timeouts_evict_the_model() {
        let transport = Arc::new(ScriptedTransport {
            models: vec![model("slow")],
            reply: Box::new(|_| {
                Ok(PredictReply {
                    success: true,
                    output: json!({"value": 0.0}),
                    exec_time_us: 10,
                    detail: String::new(),
                })
            }),
            delay: Duration::from_millis(200),
        });
        let runner = ModelRunner::new(transport, config(10, 3), Telemetry::new());
        runner.sync_once().await.unwrap();

        for _ in 0..3 {
            let results = runner
                .fan_out(&json!({}), "default", &json!({}), false)
                .await;
            assert!(matches!(results["slow"], ModelCallResult::TimedOut));
        }

        // Evicted after the third timeout: no call on the next cycle.
        assert!(runner.live_models().is_empty());
        let results = runner
            .fan_out(&json!({}), "default", &json!({}), false)
            .await;
        assert!(results.is_empty());

        // Still excluded while the same deployment keeps being listed.
        runner.sync_once().await.unwrap();
        assert!(runner.live_models().is_empty());
    }

    #[tokio::test]
    async fn validation_failures_count_toward_eviction() {
        let transport = Arc::new(ScriptedTransport {
            models: vec![model("noisy")],
            reply: Box::new(|_| {
                Ok(PredictReply {
                    success: true,
                    output: json!({"wrong": true}),
                    exec_time_us: 10,
                    detail: String::new(),
                })
            }),
            delay: Duration::ZERO,
        });
        let runner = ModelRunner::new(transport, config(2, 10), Telemetry::new());
        runner.sync_once().await.unwrap();

        runner.note_validation_failure("noisy");
        assert_eq!(runner.live_models().len(), 1);
        runner.note_validation_failure("noisy");
        assert!(runner.live_models().is_empty());
    }
}
