// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator CLI. Talks to a coordinator node's reporting surface and
//! verifies its tamper evidence independently, using only the published
//! hashes.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use crunchcoord_verifier::{
    chained_root, resolve_proof, verify_cycle_chain, CycleCommitment, ProofStep,
};

#[derive(Debug, Parser)]
#[command(name = "crunchcoordctl")]
#[command(about = "Operator tooling for a crunchcoord node")]
struct Cli {
    /// Base URL of the node's reporting surface.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node: String,

    /// API key for authenticated endpoints.
    #[arg(long, env = "API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current leaderboard.
    Leaderboard {
        #[arg(long, default_value_t = false)]
        include_ensembles: bool,
    },
    /// List checkpoints with their status and roots.
    Checkpoints,
    /// Fetch every Merkle cycle and verify the whole hash chain.
    VerifyChain,
    /// Fetch and verify the inclusion proof for one snapshot.
    VerifyProof {
        #[arg(long)]
        snapshot_id: String,
    },
    /// Start a historical backfill job.
    Backfill {
        /// RFC 3339 period start.
        #[arg(long)]
        start: String,
        /// RFC 3339 period end.
        #[arg(long)]
        end: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        subjects: Option<String>,
    },
}

struct Client {
    http: reqwest::blocking::Client,
    base: String,
    api_key: Option<String>,
}

impl Client {
    fn get(&self, path: &str) -> Result<Value> {
        let mut request = self.http.get(format!("{}{}", self.base, path));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().context("request failed")?;
        let status = response.status();
        let body: Value = response.json().context("invalid JSON response")?;
        if !status.is_success() {
            bail!("{path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        let mut request = self.http.post(format!("{}{}", self.base, path)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().context("request failed")?;
        let status = response.status();
        let body: Value = response.json().context("invalid JSON response")?;
        if !status.is_success() {
            bail!("{path} returned {status}: {body}");
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct ProofPayload {
    snapshot_id: String,
    snapshot_content_hash: String,
    cycle_id: String,
    snapshots_root: String,
    previous_cycle_root: Option<String>,
    cycle_root: String,
    path: Vec<ProofStep>,
    checkpoint_id: Option<String>,
    merkle_root: Option<String>,
    #[serde(default)]
    checkpoint_path: Vec<ProofStep>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client {
        http: reqwest::blocking::Client::new(),
        base: cli.node.trim_end_matches('/').to_string(),
        api_key: cli.api_key,
    };

    match cli.command {
        Command::Leaderboard { include_ensembles } => {
            let body = client.get(&format!(
                "/reports/leaderboard?include_ensembles={include_ensembles}"
            ))?;
            let entries = body["entries"].as_array().cloned().unwrap_or_default();
            println!("{:<6} {:<32} {:>12}", "rank", "model", "score");
            for entry in entries {
                println!(
                    "{:<6} {:<32} {:>12.6}",
                    entry["rank"].as_u64().unwrap_or(0),
                    entry["model_id"].as_str().unwrap_or("?"),
                    entry["score"].as_f64().unwrap_or(0.0),
                );
            }
        }
        Command::Checkpoints => {
            let body = client.get("/reports/checkpoints")?;
            let checkpoints = body["checkpoints"].as_array().cloned().unwrap_or_default();
            for checkpoint in checkpoints {
                println!(
                    "{} status={} root={} period={}..{}",
                    checkpoint["id"].as_str().unwrap_or("?"),
                    checkpoint["status"].as_str().unwrap_or("?"),
                    checkpoint["merkle_root"].as_str().unwrap_or("-"),
                    checkpoint["period_start"].as_str().unwrap_or("?"),
                    checkpoint["period_end"].as_str().unwrap_or("?"),
                );
            }
        }
        Command::VerifyChain => {
            let body = client.get("/reports/merkle/cycles")?;
            let cycles: Vec<CycleCommitment> = body["cycles"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|c| {
                    serde_json::from_value(c).context("malformed cycle commitment")
                })
                .collect::<Result<Vec<_>>>()?;

            match verify_cycle_chain(&cycles) {
                Ok(()) => println!("chain OK: {} cycles verified", cycles.len()),
                Err(err) => bail!("chain verification failed: {err}"),
            }
        }
        Command::VerifyProof { snapshot_id } => {
            let body = client.get(&format!("/reports/merkle/proof?snapshot_id={snapshot_id}"))?;
            let proof: ProofPayload =
                serde_json::from_value(body["proof"].clone()).context("malformed proof")?;

            let snapshots_root = resolve_proof(&proof.snapshot_content_hash, &proof.path);
            if snapshots_root != proof.snapshots_root {
                bail!("proof invalid: snapshots root mismatch for {}", proof.snapshot_id);
            }
            let cycle_root = chained_root(proof.previous_cycle_root.as_deref(), &snapshots_root);
            if cycle_root != proof.cycle_root {
                bail!("proof invalid: chained root mismatch in cycle {}", proof.cycle_id);
            }
            match (&proof.checkpoint_id, &proof.merkle_root) {
                (Some(checkpoint_id), Some(merkle_root)) => {
                    let resolved = resolve_proof(&cycle_root, &proof.checkpoint_path);
                    if &resolved != merkle_root {
                        bail!("proof invalid: checkpoint root mismatch in {checkpoint_id}");
                    }
                    println!(
                        "proof OK: {} in {} in {}",
                        proof.snapshot_id, proof.cycle_id, checkpoint_id
                    );
                }
                _ => {
                    println!(
                        "proof OK: {} in {} (not yet checkpointed)",
                        proof.snapshot_id, proof.cycle_id
                    );
                }
            }
        }
        Command::Backfill {
            start,
            end,
            source,
            subjects,
        } => {
            let mut body = serde_json::json!({"start": start, "end": end});
            if let Some(source) = source {
                body["source"] = Value::String(source);
            }
            if let Some(subjects) = subjects {
                body["subjects"] = Value::Array(
                    subjects
                        .split(',')
                        .map(|s| Value::String(s.trim().to_string()))
                        .collect(),
                );
            }
            let response = client.post("/reports/backfill", body)?;
            println!(
                "backfill job {} created",
                response["job"]["id"].as_str().unwrap_or("?")
            );
        }
    }
    Ok(())
}
