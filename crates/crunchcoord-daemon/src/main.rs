// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crunchcoord_core::contract::{CallableRegistry, CrunchConfig};
use crunchcoord_core::emission::EmissionParties;
use crunchcoord_core::entities::{Model, PredictionScope, ScheduledPredictionConfig};
use crunchcoord_core::metrics::MetricsRegistry;
use crunchcoord_core::schedule::ScheduleEnvelope;

use crunchcoord_daemon::auth::AuthConfig;
use crunchcoord_daemon::backfill::BackfillService;
use crunchcoord_daemon::bus::Bus;
use crunchcoord_daemon::checkpoint::CheckpointBuilder;
use crunchcoord_daemon::config::RuntimeSettings;
use crunchcoord_daemon::feed_worker::FeedWorker;
use crunchcoord_daemon::feeds::create_feed;
use crunchcoord_daemon::parquet_sink::ParquetSink;
use crunchcoord_daemon::predict::PredictOrchestrator;
use crunchcoord_daemon::report::{router, AppState};
use crunchcoord_daemon::runner::{GrpcTransport, ModelRunner, RunnerConfig};
use crunchcoord_daemon::score::ScoreEngine;
use crunchcoord_daemon::store::Store;
use crunchcoord_daemon::telemetry::{AuditLog, Telemetry};

#[derive(Debug, Parser)]
#[command(name = "crunchcoord-daemon")]
#[command(about = "Competition coordinator node")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    #[arg(long, default_value = "127.0.0.1:9464")]
    metrics_listen: String,

    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Path to the competition contract JSON. Defaults apply when omitted.
    #[arg(long)]
    contract: Option<String>,

    #[arg(long, default_value = "info")]
    log: String,
}

fn load_contract(args: &Args, settings: &RuntimeSettings) -> Result<CrunchConfig, Box<dyn std::error::Error>> {
    let mut contract = match &args.contract {
        Some(path) => {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw)?
        }
        None => CrunchConfig::default(),
    };

    contract.crunch_id = settings.crunch_id.clone();
    contract.parties = EmissionParties {
        crunch: settings.crunch_pubkey.clone(),
        compute_provider: settings.compute_provider_pubkey.clone(),
        data_provider: settings.data_provider_pubkey.clone(),
    };
    if let Some(subject) = settings.feed_subjects.first() {
        if contract.scope.subject.is_empty() {
            contract.scope.subject = subject.clone();
        }
    }

    // Callable paths can be overridden per deployment without editing the
    // contract file.
    if let Some(path) = &settings.scoring_function {
        contract.callables.scoring_function = path.clone();
    }
    if let Some(path) = &settings.inference_input_builder {
        contract.callables.inference_input_builder = path.clone();
    }
    if let Some(path) = &settings.inference_output_validator {
        contract.callables.inference_output_validator = path.clone();
    }
    Ok(contract)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log.clone()))
        .init();

    let settings = RuntimeSettings::from_env()?;
    let contract = load_contract(&args, &settings)?;

    // Fail fast: every required callable must resolve before any worker
    // starts.
    let registry = CallableRegistry::with_builtins();
    let callables = registry.freeze(&contract.callables)?;
    let metrics = MetricsRegistry::with_builtins();

    std::fs::create_dir_all(&args.data_dir)?;
    let store = Store::open(std::path::Path::new(&args.data_dir).join("coordinator.db"))?;

    // Seed a default schedule from the contract scope when the operator has
    // not configured any.
    if store.active_prediction_configs()?.is_empty() {
        let scope: PredictionScope = contract.scope.clone();
        store.upsert_prediction_config(&ScheduledPredictionConfig {
            id: "CFG_default".to_string(),
            scope_key: format!("{}-{}s", scope.subject.to_lowercase(), scope.horizon_seconds),
            schedule: ScheduleEnvelope {
                every_seconds: scope.step_seconds.max(1),
                resolve_after_seconds: Some(scope.horizon_seconds),
            },
            scope,
            active: true,
            order: 0,
        })?;
        tracing::info!("seeded default prediction config from contract scope");
    }

    let telemetry = Telemetry::new();
    let audit = AuditLog::new(std::path::Path::new(&args.data_dir).join("logs"));
    let bus = Bus::default();
    let sink = ParquetSink::new(&settings.backfill_dir);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let owner = format!(
        "{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string()),
        std::process::id()
    );

    // Metrics endpoint.
    let metrics_addr: SocketAddr = args.metrics_listen.parse()?;
    let telemetry_arc = Arc::new(telemetry.clone());
    let _metrics_handle = telemetry_arc.spawn_metrics_server(metrics_addr).await?;

    // Feed worker.
    let feed = create_feed(&settings.feed_source, settings.feed_fetch_timeout)?;
    let feed_worker = Arc::new(FeedWorker::new(
        store.clone(),
        feed.clone(),
        &settings.feed_subjects,
        settings.feed_kind.clone(),
        settings.feed_granularity.clone(),
        settings.feed_poll_interval,
        settings.feed_record_ttl_days,
        telemetry.clone(),
        audit.clone(),
        bus.clone(),
    ));
    tokio::spawn(feed_worker.clone().run(shutdown_rx.clone()));

    // Model runner liveness sync.
    let transport = Arc::new(GrpcTransport::new(
        &settings.model_runner_host,
        settings.model_runner_port,
        settings.crunch_id.clone(),
    ));
    let runner = Arc::new(ModelRunner::new(
        transport,
        RunnerConfig {
            predict_timeout: settings.predict_timeout,
            tick_timeout: settings.tick_timeout,
            consecutive_failure_limit: settings.consecutive_failure_limit,
            consecutive_timeout_limit: settings.consecutive_timeout_limit,
        },
        telemetry.clone(),
    ));
    {
        let runner = runner.clone();
        let store = store.clone();
        let interval = settings.model_sync_interval;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match runner.sync_once().await {
                    Ok(listed) => {
                        let now = chrono::Utc::now();
                        for info in listed {
                            let model = Model {
                                id: info.id,
                                name: info.name,
                                deployment_id: info.deployment_id,
                                owner_id: info.owner_id,
                                owner_name: info.owner_name,
                                overall_score: None,
                                meta: serde_json::Map::new(),
                                created_at: now,
                                updated_at: now,
                            };
                            if let Err(err) = store.upsert_model(&model) {
                                tracing::warn!(error=%err, "model upsert failed");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error=%err, "model runner sync failed");
                    }
                }
            }
        });
    }

    // Predict orchestrator.
    let orchestrator = Arc::new(PredictOrchestrator::new(
        store.clone(),
        runner.clone(),
        callables.clone(),
        contract.clone(),
        settings.feed_source.clone(),
        settings.feed_kind.clone(),
        settings.feed_granularity.clone(),
        settings.feed_interval_seconds(),
        telemetry.clone(),
        audit.clone(),
    ));
    tokio::spawn(orchestrator.clone().run(
        bus.clone(),
        std::time::Duration::from_secs(contract.scope.step_seconds.max(1)),
        shutdown_rx.clone(),
    ));

    // Score engine.
    let engine = Arc::new(ScoreEngine::new(
        store.clone(),
        callables.clone(),
        contract.clone(),
        metrics,
        settings.feed_source.clone(),
        settings.feed_kind.clone(),
        settings.feed_granularity.clone(),
        settings.feed_interval_seconds(),
        settings.input_resolution_ttl,
        telemetry.clone(),
        audit.clone(),
        bus.clone(),
    ));
    tokio::spawn(engine.clone().run(
        settings.score_interval,
        owner.clone(),
        shutdown_rx.clone(),
    ));

    // Checkpoint builder.
    let checkpoints = Arc::new(CheckpointBuilder::new(
        store.clone(),
        contract.clone(),
        callables.emission,
        contract.parties.clone(),
        settings.checkpoint_cadence,
        telemetry.clone(),
        audit.clone(),
        bus.clone(),
    ));
    tokio::spawn(checkpoints.clone().run(owner.clone(), shutdown_rx.clone()));

    // Backfill service (driven through the reporting surface).
    let backfill = Arc::new(BackfillService::new(
        store.clone(),
        sink.clone(),
        feed,
        settings.backfill_page_size,
        telemetry.clone(),
        audit.clone(),
    ));

    // Reporting surface.
    let auth = AuthConfig {
        api_key: settings.api_key.clone(),
        read_auth: settings.api_read_auth,
        public_prefixes: settings.api_public_prefixes.clone(),
        admin_prefixes: settings.api_admin_prefixes.clone(),
    };
    let app = router(
        AppState {
            store: store.clone(),
            sink,
            checkpoints,
            backfill,
            telemetry: telemetry.clone(),
        },
        auth,
    );

    let addr: SocketAddr = args.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        metrics_addr=%metrics_addr,
        crunch_id=%settings.crunch_id,
        feed_source=%settings.feed_source,
        score_interval_s=%settings.score_interval.as_secs(),
        checkpoint_interval_s=%settings.checkpoint_cadence.interval_seconds,
        "starting coordinator node"
    );
    audit.service("daemon", "started", None);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.wait_for(|stopped| *stopped).await;
        })
        .await?;

    audit.service("daemon", "stopped", None);
    Ok(())
}
