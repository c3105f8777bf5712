// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only reporting surface plus the two authenticated checkpoint
//! mutations (confirm, status advance) and the backfill trigger. Failures
//! surface as a structured `{"error": {code, message}}` envelope.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crunchcoord_core::ensemble::is_ensemble_model;
use crunchcoord_core::entities::CheckpointStatus;
use crunchcoord_core::CoordError;

use crate::auth::{api_key_middleware, AuthConfig};
use crate::backfill::{BackfillRequest, BackfillService};
use crate::checkpoint::{cycle_summaries, CheckpointBuilder};
use crate::parquet_sink::ParquetSink;
use crate::store::{Store, StoreError};
use crate::telemetry::Telemetry;

const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_LIST_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sink: ParquetSink,
    pub checkpoints: Arc<CheckpointBuilder>,
    pub backfill: Arc<BackfillService>,
    pub telemetry: Telemetry,
}

pub fn router(state: AppState, auth: AuthConfig) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/reports/leaderboard", get(leaderboard))
        .route("/reports/models", get(models))
        .route("/reports/snapshots", get(snapshots))
        .route("/reports/checkpoints", get(checkpoints))
        .route("/reports/checkpoints/:id/emission", get(checkpoint_emission))
        .route("/reports/checkpoints/:id/confirm", post(confirm_checkpoint))
        .route("/reports/checkpoints/:id/status", patch(advance_checkpoint))
        .route("/reports/merkle/cycles", get(merkle_cycles))
        .route("/reports/merkle/proof", get(merkle_proof))
        .route("/reports/backfill", post(start_backfill).get(list_backfill))
        .route("/data/backfill/index", get(backfill_index))
        .route("/data/backfill/*path", get(backfill_file))
        .layer(axum::middleware::from_fn_with_state(auth, api_key_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── error envelope ──

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": {"code": self.code, "message": self.message}})),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound(message) => ApiError::not_found(message.clone()),
            StoreError::InvalidTransition(message) => ApiError {
                status: StatusCode::CONFLICT,
                code: "invalid_transition",
                message: message.clone(),
            },
            StoreError::AdmissionDenied(message) => ApiError {
                status: StatusCode::CONFLICT,
                code: "admission_denied",
                message: message.clone(),
            },
            _ => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: err.to_string(),
            },
        }
    }
}

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        match &err {
            CoordError::NotFound(message) => ApiError::not_found(message.clone()),
            CoordError::InvalidArgument(message) => ApiError::bad_request(message.clone()),
            CoordError::AdmissionDenied(message) => ApiError {
                status: StatusCode::CONFLICT,
                code: "admission_denied",
                message: message.clone(),
            },
            CoordError::InvalidTransition(message) => ApiError {
                status: StatusCode::CONFLICT,
                code: "invalid_transition",
                message: message.clone(),
            },
            _ => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: err.to_string(),
            },
        }
    }
}

// ── handlers ──

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    #[serde(default)]
    include_ensembles: bool,
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(mut leaderboard) = state.store.latest_leaderboard()? else {
        return Ok(Json(json!({"entries": [], "created_at": null})));
    };

    if !query.include_ensembles {
        leaderboard.entries.retain(|e| !is_ensemble_model(&e.model_id));
        for (index, entry) in leaderboard.entries.iter_mut().enumerate() {
            entry.rank = index as u32 + 1;
        }
    }
    Ok(Json(json!({
        "id": leaderboard.id,
        "created_at": leaderboard.created_at,
        "entries": leaderboard.entries,
    })))
}

async fn models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state.store.all_models()?;
    Ok(Json(json!({"models": models})))
}

#[derive(Debug, Deserialize)]
struct SnapshotsQuery {
    model_id: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

async fn snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshots = state.store.snapshots_query(
        query.model_id.as_deref(),
        query.since,
        query.until,
        query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    )?;
    Ok(Json(json!({"snapshots": snapshots})))
}

async fn checkpoints(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let checkpoints = state.store.list_checkpoints(DEFAULT_LIST_LIMIT)?;
    Ok(Json(json!({"checkpoints": checkpoints})))
}

async fn checkpoint_emission(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let checkpoint = state
        .store
        .checkpoint(&id)?
        .ok_or_else(|| ApiError::not_found(format!("checkpoint {id}")))?;
    Ok(Json(serde_json::to_value(&checkpoint.emission).map_err(
        |_| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: "emission encoding failed".to_string(),
        },
    )?))
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    tx_hash: String,
}

async fn confirm_checkpoint(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.tx_hash.trim().is_empty() {
        return Err(ApiError::bad_request("tx_hash must not be empty"));
    }
    let checkpoint = state
        .store
        .confirm_checkpoint(&id, body.tx_hash.trim(), Utc::now())?;
    state.telemetry.record_checkpoint("SUBMITTED");
    Ok(Json(json!({"checkpoint": checkpoint})))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn advance_checkpoint(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let next = CheckpointStatus::parse(&body.status)
        .ok_or_else(|| ApiError::bad_request(format!("unknown status `{}`", body.status)))?;
    let checkpoint = state
        .store
        .transition_checkpoint(&id, next, None, Utc::now())?;
    state.telemetry.record_checkpoint(next.as_str());
    Ok(Json(json!({"checkpoint": checkpoint})))
}

async fn merkle_cycles(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let cycles = cycle_summaries(&state.store)?;
    Ok(Json(json!({"cycles": cycles})))
}

#[derive(Debug, Deserialize)]
struct ProofQuery {
    snapshot_id: String,
}

async fn merkle_proof(
    State(state): State<AppState>,
    Query(query): Query<ProofQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let proof = state.checkpoints.proof_for_snapshot(&query.snapshot_id)?;
    Ok(Json(json!({"proof": proof})))
}

#[derive(Debug, Deserialize)]
struct BackfillBody {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: Option<String>,
    subjects: Option<Vec<String>>,
    kind: Option<String>,
    granularity: Option<String>,
}

async fn start_backfill(
    State(state): State<AppState>,
    Json(body): Json<BackfillBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = BackfillRequest {
        source: body.source.unwrap_or_else(|| "binance".to_string()),
        subjects: body.subjects.unwrap_or_else(|| vec!["BTC".to_string()]),
        kind: body.kind.unwrap_or_else(|| "candle".to_string()),
        granularity: body.granularity.unwrap_or_else(|| "1m".to_string()),
        start: body.start,
        end: body.end,
    };
    let job = state.backfill.create_job(&request, Utc::now())?;

    let service = state.backfill.clone();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        if let Err(err) = service.run_job(&job_id).await {
            tracing::error!(job_id=%job_id, error=%err, "backfill job failed");
        }
    });

    Ok(Json(json!({"job": job})))
}

async fn list_backfill(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let jobs = state.store.list_backfill_jobs(DEFAULT_LIST_LIMIT)?;
    Ok(Json(json!({"jobs": jobs})))
}

async fn backfill_index(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"files": state.sink.list_files()}))
}

async fn backfill_file(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, ApiError> {
    let full_path = state
        .sink
        .resolve_file(&path)
        .ok_or_else(|| ApiError::not_found(format!("no lake file at {path}")))?;
    let bytes = tokio::fs::read(&full_path).await.map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("read failed: {e}"),
    })?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
