// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::io::Write as IoWrite;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metrics server failed: {0}")]
    Server(std::io::Error),
}

#[derive(Debug, Default)]
struct TelemetryState {
    feed_records_ingested_total: HashMap<String, u64>,
    feed_poll_failures_total: HashMap<String, u64>,
    predict_cycles_total: HashMap<String, u64>,
    predict_cycles_skipped_total: HashMap<(String, String), u64>,
    predictions_total: HashMap<String, u64>,
    models_evicted_total: HashMap<String, u64>,
    score_ticks_total: u64,
    score_tick_failures_total: u64,
    inputs_resolved_total: HashMap<String, u64>,
    snapshots_written_total: u64,
    ensembles_built_total: HashMap<String, u64>,
    checkpoints_total: HashMap<String, u64>,
    backfill_pages_total: u64,
    backfill_records_total: u64,
    live_models: i64,
    last_cycle_snapshot_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_feed_ingested(&self, scope: &str, records: u64) {
        let mut guard = self.state.lock();
        let entry = guard
            .feed_records_ingested_total
            .entry(scope.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(records);
    }

    pub fn record_feed_poll_failure(&self, scope: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .feed_poll_failures_total
            .entry(scope.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_predict_cycle(&self, config_id: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .predict_cycles_total
            .entry(config_id.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_predict_cycle_skipped(&self, config_id: &str, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .predict_cycles_skipped_total
            .entry((config_id.to_string(), reason.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_predictions(&self, status: &str, count: u64) {
        let mut guard = self.state.lock();
        let entry = guard
            .predictions_total
            .entry(status.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(count);
    }

    pub fn record_model_evicted(&self, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .models_evicted_total
            .entry(reason.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_score_tick(&self, failed: bool) {
        let mut guard = self.state.lock();
        guard.score_ticks_total = guard.score_ticks_total.saturating_add(1);
        if failed {
            guard.score_tick_failures_total = guard.score_tick_failures_total.saturating_add(1);
        }
    }

    pub fn record_inputs_resolved(&self, outcome: &str, count: u64) {
        let mut guard = self.state.lock();
        let entry = guard
            .inputs_resolved_total
            .entry(outcome.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(count);
    }

    pub fn record_snapshots_written(&self, count: u64) {
        let mut guard = self.state.lock();
        guard.snapshots_written_total = guard.snapshots_written_total.saturating_add(count);
        guard.last_cycle_snapshot_count = count as i64;
    }

    pub fn record_ensemble_built(&self, name: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .ensembles_built_total
            .entry(name.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_checkpoint(&self, status: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .checkpoints_total
            .entry(status.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_backfill_page(&self, records: u64) {
        let mut guard = self.state.lock();
        guard.backfill_pages_total = guard.backfill_pages_total.saturating_add(1);
        guard.backfill_records_total = guard.backfill_records_total.saturating_add(records);
    }

    pub fn set_live_models(&self, count: usize) {
        self.state.lock().live_models = count as i64;
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();

        out.push_str("# TYPE feed_records_ingested_total counter\n");
        for (scope, value) in sorted(&guard.feed_records_ingested_total) {
            let _ = writeln!(out, "feed_records_ingested_total{{scope=\"{scope}\"}} {value}");
        }
        out.push_str("# TYPE feed_poll_failures_total counter\n");
        for (scope, value) in sorted(&guard.feed_poll_failures_total) {
            let _ = writeln!(out, "feed_poll_failures_total{{scope=\"{scope}\"}} {value}");
        }
        out.push_str("# TYPE predict_cycles_total counter\n");
        for (config, value) in sorted(&guard.predict_cycles_total) {
            let _ = writeln!(out, "predict_cycles_total{{config=\"{config}\"}} {value}");
        }
        out.push_str("# TYPE predict_cycles_skipped_total counter\n");
        for ((config, reason), value) in sorted_pairs(&guard.predict_cycles_skipped_total) {
            let _ = writeln!(
                out,
                "predict_cycles_skipped_total{{config=\"{config}\",reason=\"{reason}\"}} {value}"
            );
        }
        out.push_str("# TYPE predictions_total counter\n");
        for (status, value) in sorted(&guard.predictions_total) {
            let _ = writeln!(out, "predictions_total{{status=\"{status}\"}} {value}");
        }
        out.push_str("# TYPE models_evicted_total counter\n");
        for (reason, value) in sorted(&guard.models_evicted_total) {
            let _ = writeln!(out, "models_evicted_total{{reason=\"{reason}\"}} {value}");
        }
        out.push_str("# TYPE score_ticks_total counter\n");
        let _ = writeln!(out, "score_ticks_total {}", guard.score_ticks_total);
        out.push_str("# TYPE score_tick_failures_total counter\n");
        let _ = writeln!(
            out,
            "score_tick_failures_total {}",
            guard.score_tick_failures_total
        );
        out.push_str("# TYPE inputs_resolved_total counter\n");
        for (outcome, value) in sorted(&guard.inputs_resolved_total) {
            let _ = writeln!(out, "inputs_resolved_total{{outcome=\"{outcome}\"}} {value}");
        }
        out.push_str("# TYPE snapshots_written_total counter\n");
        let _ = writeln!(out, "snapshots_written_total {}", guard.snapshots_written_total);
        out.push_str("# TYPE ensembles_built_total counter\n");
        for (name, value) in sorted(&guard.ensembles_built_total) {
            let _ = writeln!(out, "ensembles_built_total{{name=\"{name}\"}} {value}");
        }
        out.push_str("# TYPE checkpoints_total counter\n");
        for (status, value) in sorted(&guard.checkpoints_total) {
            let _ = writeln!(out, "checkpoints_total{{status=\"{status}\"}} {value}");
        }
        out.push_str("# TYPE backfill_pages_total counter\n");
        let _ = writeln!(out, "backfill_pages_total {}", guard.backfill_pages_total);
        out.push_str("# TYPE backfill_records_total counter\n");
        let _ = writeln!(out, "backfill_records_total {}", guard.backfill_records_total);
        out.push_str("# TYPE live_models gauge\n");
        let _ = writeln!(out, "live_models {}", guard.live_models);
        out.push_str("# TYPE last_cycle_snapshot_count gauge\n");
        let _ = writeln!(
            out,
            "last_cycle_snapshot_count {}",
            guard.last_cycle_snapshot_count
        );
        out
    }

    /// Serve the text exposition on a dedicated listener. The scrape
    /// endpoint stays off the reporting router so a wedged API cannot take
    /// observability down with it.
    pub async fn spawn_metrics_server(
        self: Arc<Self>,
        addr: SocketAddr,
    ) -> Result<tokio::task::JoinHandle<()>, TelemetryError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TelemetryError::Server)?;
        Ok(tokio::spawn(serve_scrapes(listener, self)))
    }
}

async fn serve_scrapes(listener: tokio::net::TcpListener, telemetry: Arc<Telemetry>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(error=%err, "metrics listener accept failed");
                return;
            }
        };
        let telemetry = telemetry.clone();
        tokio::spawn(async move {
            if let Err(err) = answer_scrape(socket, &telemetry).await {
                tracing::debug!(peer=%peer, error=%err, "metrics scrape failed");
            }
        });
    }
}

/// Minimal one-shot HTTP exchange: only `GET /metrics` gets the exposition.
async fn answer_scrape(
    mut socket: tokio::net::TcpStream,
    telemetry: &Telemetry,
) -> std::io::Result<()> {
    let mut request = [0_u8; 1024];
    let n = socket.read(&mut request).await?;
    if n == 0 {
        return Ok(());
    }

    let request_line = String::from_utf8_lossy(&request[..n]);
    let target = request_line
        .strip_prefix("GET ")
        .and_then(|rest| rest.split_whitespace().next());

    let (status, body) = match target {
        Some("/metrics") => ("200 OK", telemetry.render()),
        _ => ("404 Not Found", "not found\n".to_string()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {len}\r\nconnection: close\r\n\r\n{body}",
        len = body.len(),
    );
    socket.write_all(response.as_bytes()).await
}

fn sorted<V: Copy>(map: &HashMap<String, V>) -> BTreeMap<&String, V> {
    map.iter().map(|(k, v)| (k, *v)).collect()
}

fn sorted_pairs<V: Copy>(map: &HashMap<(String, String), V>) -> BTreeMap<&(String, String), V> {
    map.iter().map(|(k, v)| (k, *v)).collect()
}

/// Operator-facing JSONL audit trail: `process-log.jsonl` for pipeline
/// events, `runtime-services.jsonl` for worker lifecycle snapshots.
#[derive(Clone)]
pub struct AuditLog {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn event(&self, kind: &str, fields: Value) {
        self.append(
            "process-log.jsonl",
            json!({
                "ts": Utc::now().to_rfc3339(),
                "kind": kind,
                "fields": fields,
            }),
        );
    }

    pub fn service(&self, service: &str, state: &str, detail: Option<&str>) {
        self.append(
            "runtime-services.jsonl",
            json!({
                "ts": Utc::now().to_rfc3339(),
                "service": service,
                "state": state,
                "detail": detail,
            }),
        );
    }

    fn append(&self, file: &str, line: Value) {
        let _guard = self.lock.lock();
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let path = self.dir.join(file);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            tracing::warn!(error=%err, path=%path.display(), "audit log append failed");
        }
    }
}
