// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint building: aggregate all cycles since the previous checkpoint
//! into a second-level Merkle tree, rank the period's models, and produce
//! the frac64 emission payload for external settlement. Also serves
//! inclusion proofs across both tree levels.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use crunchcoord_core::contract::{CrunchConfig, RankingDirection};
use crunchcoord_core::emission::{EmissionParties, EmissionStrategyFn, RankedModelEntry};
use crunchcoord_core::ensemble::is_ensemble_model;
use crunchcoord_core::entities::{CheckpointRecord, CheckpointStatus};
use crunchcoord_core::merkle::{build_tree, root_hash, tree_from_records, TreeNode};
use crunchcoord_core::schedule::CheckpointCadence;
use crunchcoord_core::{CoordError, CoordResult};
use crunchcoord_verifier::{chained_root, resolve_proof, ProofStep};

use crate::bus::{Bus, Event};
use crate::ids;
use crate::score::tree_to_records;
use crate::store::{Store, StoreError};
use crate::telemetry::{AuditLog, Telemetry};

/// Inclusion proof for one snapshot: first through its cycle's tree to the
/// snapshots root, chained to the cycle root, then (when the cycle is
/// covered) through the checkpoint tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InclusionProof {
    pub snapshot_id: String,
    pub snapshot_content_hash: String,
    pub cycle_id: String,
    pub snapshots_root: String,
    pub previous_cycle_root: Option<String>,
    pub cycle_root: String,
    pub path: Vec<ProofStep>,
    pub checkpoint_id: Option<String>,
    pub merkle_root: Option<String>,
    pub checkpoint_path: Vec<ProofStep>,
}

impl InclusionProof {
    /// Recompute both levels from the leaf. True iff every link holds.
    pub fn verify(&self) -> bool {
        let snapshots_root = resolve_proof(&self.snapshot_content_hash, &self.path);
        if snapshots_root != self.snapshots_root {
            return false;
        }
        let cycle_root = chained_root(self.previous_cycle_root.as_deref(), &snapshots_root);
        if cycle_root != self.cycle_root {
            return false;
        }
        match (&self.checkpoint_id, &self.merkle_root) {
            (Some(_), Some(merkle_root)) => {
                resolve_proof(&cycle_root, &self.checkpoint_path) == *merkle_root
            }
            _ => true,
        }
    }
}

pub struct CheckpointBuilder {
    store: Store,
    contract: CrunchConfig,
    emission: EmissionStrategyFn,
    parties: EmissionParties,
    cadence: CheckpointCadence,
    telemetry: Telemetry,
    audit: AuditLog,
    bus: Bus,
}

impl CheckpointBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        contract: CrunchConfig,
        emission: EmissionStrategyFn,
        parties: EmissionParties,
        cadence: CheckpointCadence,
        telemetry: Telemetry,
        audit: AuditLog,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            contract,
            emission,
            parties,
            cadence,
            telemetry,
            audit,
            bus,
        }
    }

    /// Build one checkpoint over everything since the previous one. Returns
    /// `None` when no cycles landed in the period. An emission that violates
    /// frac64 conservation aborts the whole checkpoint.
    pub fn build_once(&self, now: DateTime<Utc>) -> CoordResult<Option<CheckpointRecord>> {
        let last = self.store.latest_checkpoint().map_err(internal)?;
        let period_start = last.map(|c| c.period_end).unwrap_or_else(|| {
            now - ChronoDuration::seconds(self.cadence.interval_seconds as i64)
        });

        let cycles = self.store.cycles_between(period_start, now).map_err(internal)?;
        if cycles.is_empty() {
            tracing::info!(period_start=%period_start, "no cycles in period, skipping checkpoint");
            return Ok(None);
        }

        let checkpoint_id = ids::checkpoint_id(now);

        // Second-level tree over the cycles' chained roots, creation order.
        let leaves: Vec<TreeNode> = cycles
            .iter()
            .enumerate()
            .map(|(position, cycle)| TreeNode::leaf(position as u32, cycle.chained_root.clone()))
            .collect();
        let tree = build_tree(leaves);
        let merkle_root = root_hash(&tree)
            .map(str::to_string)
            .ok_or_else(|| CoordError::Internal("checkpoint tree has no root".to_string()))?;

        let ranked = self.rank_period_models(period_start, now)?;
        let emission = (self.emission)(&ranked, &self.parties);
        emission.validate().map_err(|err| {
            self.audit.event(
                "checkpoint_emission_rejected",
                json!({"checkpoint_id": checkpoint_id, "error": err.to_string()}),
            );
            CoordError::EmissionImbalance(err)
        })?;

        let mut meta = serde_json::Map::new();
        meta.insert("cycle_count".to_string(), json!(cycles.len()));
        meta.insert("model_count".to_string(), json!(ranked.len()));
        meta.insert(
            "ranking".to_string(),
            serde_json::to_value(&ranked).map_err(|_| CoordError::Encoding)?,
        );

        let checkpoint = CheckpointRecord {
            id: checkpoint_id.clone(),
            period_start,
            period_end: now,
            merkle_root: Some(merkle_root.clone()),
            emission,
            status: CheckpointStatus::Pending,
            tx_hash: None,
            meta,
            created_at: now,
            emitted_at: None,
        };

        let nodes = tree_to_records(&tree, None, Some(&checkpoint_id), now);
        self.store
            .commit_checkpoint(&checkpoint, &nodes)
            .map_err(internal)?;

        self.telemetry.record_checkpoint("PENDING");
        self.bus.publish(Event::CheckpointBuilt {
            checkpoint_id: checkpoint_id.clone(),
        });
        self.audit.event(
            "checkpoint_built",
            json!({
                "checkpoint_id": checkpoint_id,
                "cycles": cycles.len(),
                "models": checkpoint.meta["model_count"],
                "merkle_root": merkle_root,
            }),
        );
        tracing::info!(
            checkpoint_id=%checkpoint.id,
            cycles=%cycles.len(),
            period_start=%period_start,
            period_end=%now,
            "checkpoint created"
        );
        Ok(Some(checkpoint))
    }

    /// Aggregate the period's snapshots per real model (prediction-count
    /// weighted mean of numeric summary fields) and rank by the contract's
    /// ranking key. Ties break by model id for determinism.
    fn rank_period_models(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> CoordResult<Vec<RankedModelEntry>> {
        let snapshots = self
            .store
            .snapshots_between(period_start, period_end)
            .map_err(internal)?;
        let models: BTreeMap<String, _> = self
            .store
            .all_models()
            .map_err(internal)?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut by_model: BTreeMap<String, Vec<&crunchcoord_core::entities::SnapshotRecord>> =
            BTreeMap::new();
        for snapshot in &snapshots {
            if is_ensemble_model(&snapshot.model_id) {
                continue;
            }
            by_model
                .entry(snapshot.model_id.clone())
                .or_default()
                .push(snapshot);
        }

        let mut entries: Vec<RankedModelEntry> = Vec::new();
        for (model_id, group) in by_model {
            let total_predictions: u64 = group.iter().map(|s| s.prediction_count).sum();
            if total_predictions == 0 {
                continue;
            }

            let mut summary: BTreeMap<String, f64> = BTreeMap::new();
            for snapshot in &group {
                let weight = snapshot.prediction_count as f64 / total_predictions as f64;
                for (key, value) in &snapshot.result_summary {
                    if let Some(v) = value.as_f64() {
                        *summary.entry(key.clone()).or_insert(0.0) += v * weight;
                    }
                }
            }

            let model = models.get(&model_id);
            entries.push(RankedModelEntry {
                rank: 0,
                model_id,
                model_name: model.map(|m| m.name.clone()),
                cruncher_name: model.map(|m| m.owner_name.clone()),
                prediction_count: total_predictions,
                snapshot_count: group.len() as u64,
                result_summary: summary,
            });
        }

        let ranking_key = &self.contract.aggregation.ranking_key;
        entries.sort_by(|a, b| {
            let score_a = a.result_summary.get(ranking_key).copied().unwrap_or(0.0);
            let score_b = b.result_summary.get(ranking_key).copied().unwrap_or(0.0);
            let ordering = score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal);
            match self.contract.aggregation.ranking_direction {
                RankingDirection::Desc => ordering.reverse(),
                RankingDirection::Asc => ordering,
            }
            .then_with(|| a.model_id.cmp(&b.model_id))
        });
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.rank = index as u32 + 1;
        }
        Ok(entries)
    }

    /// Proof API: snapshot → cycle tree → (optionally) checkpoint tree.
    pub fn proof_for_snapshot(&self, snapshot_id: &str) -> CoordResult<InclusionProof> {
        let leaf = self
            .store
            .node_for_snapshot(snapshot_id)
            .map_err(internal)?
            .ok_or_else(|| CoordError::NotFound(format!("no merkle leaf for snapshot {snapshot_id}")))?;
        let cycle_id = leaf
            .cycle_id
            .clone()
            .ok_or_else(|| CoordError::Internal("snapshot leaf without cycle".to_string()))?;
        let cycle = self
            .store
            .cycle(&cycle_id)
            .map_err(internal)?
            .ok_or_else(|| CoordError::NotFound(format!("cycle {cycle_id}")))?;

        let cycle_nodes = self.store.nodes_for_cycle(&cycle_id).map_err(internal)?;
        let tree = tree_from_records(&cycle_nodes);
        let path = crunchcoord_core::merkle::inclusion_path(&tree, &leaf.hash);

        let mut proof = InclusionProof {
            snapshot_id: snapshot_id.to_string(),
            snapshot_content_hash: leaf
                .snapshot_content_hash
                .clone()
                .unwrap_or_else(|| leaf.hash.clone()),
            cycle_id,
            snapshots_root: cycle.snapshots_root.clone(),
            previous_cycle_root: cycle.previous_cycle_root.clone(),
            cycle_root: cycle.chained_root.clone(),
            path,
            checkpoint_id: None,
            merkle_root: None,
            checkpoint_path: Vec::new(),
        };

        // Second level, when a checkpoint already covers this cycle.
        if let Some(checkpoint_leaf) = self
            .store
            .checkpoint_leaf_for_hash(&cycle.chained_root)
            .map_err(internal)?
        {
            if let Some(checkpoint_id) = checkpoint_leaf.checkpoint_id.clone() {
                let checkpoint_nodes = self
                    .store
                    .nodes_for_checkpoint(&checkpoint_id)
                    .map_err(internal)?;
                let checkpoint_tree = tree_from_records(&checkpoint_nodes);
                proof.checkpoint_path = crunchcoord_core::merkle::inclusion_path(
                    &checkpoint_tree,
                    &checkpoint_leaf.hash,
                );
                proof.merkle_root = root_hash(&checkpoint_tree).map(str::to_string);
                proof.checkpoint_id = Some(checkpoint_id);
            }
        }

        Ok(proof)
    }

    /// Cron-like loop under the checkpoint lease.
    pub async fn run(
        self: Arc<Self>,
        owner: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.audit.service("checkpoint", "started", None);
        let interval = std::time::Duration::from_secs(self.cadence.interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a restart does not
        // immediately cut a short checkpoint.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            let lease_ttl = ChronoDuration::seconds(300);
            match self.store.acquire_lease("checkpoint", &owner, lease_ttl, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(error=%err, "checkpoint lease check failed");
                    continue;
                }
            }

            let builder = self.clone();
            let result = tokio::task::block_in_place(move || builder.build_once(now));
            if let Err(err) = result {
                tracing::error!(error=%err, "checkpoint build failed");
                self.audit
                    .service("checkpoint", "error", Some(&err.to_string()));
            }

            if let Err(err) = self.store.release_lease("checkpoint", &owner) {
                tracing::warn!(error=%err, "checkpoint lease release failed");
            }
        }
        self.audit.service("checkpoint", "stopped", None);
    }
}

fn internal(err: StoreError) -> CoordError {
    CoordError::Internal(err.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub id: String,
    pub previous_cycle_id: Option<String>,
    pub previous_cycle_root: Option<String>,
    pub snapshots_root: String,
    pub chained_root: String,
    pub snapshot_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Shape served by the merkle cycle listing; also consumed by the chain
/// verifier in the operator CLI.
pub fn cycle_summaries(store: &Store) -> CoordResult<Vec<CycleSummary>> {
    Ok(store
        .all_cycles()
        .map_err(internal)?
        .into_iter()
        .map(|c| CycleSummary {
            id: c.id,
            previous_cycle_id: c.previous_cycle_id,
            previous_cycle_root: c.previous_cycle_root,
            snapshots_root: c.snapshots_root,
            chained_root: c.chained_root,
            snapshot_count: c.snapshot_count,
            created_at: c.created_at,
        })
        .collect())
}
