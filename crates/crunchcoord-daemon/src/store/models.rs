// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use crunchcoord_core::canonical::ts_rfc3339;
use crunchcoord_core::entities::{CheckpointRecord, CheckpointStatus, Model};
use crunchcoord_core::merkle::MerkleNodeRecord;

use super::pipeline::insert_merkle_node;
use super::{json_object, parse_opt_ts, parse_ts, Store, StoreError, StoreResult};

const MODEL_SELECT: &str =
    "SELECT id, name, deployment_id, owner_id, owner_name, overall_score_json, meta_json, \
     created_at, updated_at FROM models";

const CHECKPOINT_SELECT: &str =
    "SELECT id, period_start, period_end, merkle_root, emission_json, status, tx_hash, \
     meta_json, created_at, emitted_at FROM checkpoints";

impl Store {
    // ── models ──

    pub fn upsert_model(&self, model: &Model) -> StoreResult<()> {
        self.lock().execute(
            "INSERT INTO models
                 (id, name, deployment_id, owner_id, owner_name, overall_score_json, meta_json,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 deployment_id = excluded.deployment_id,
                 owner_id = excluded.owner_id,
                 owner_name = excluded.owner_name,
                 updated_at = excluded.updated_at",
            params![
                model.id,
                model.name,
                model.deployment_id,
                model.owner_id,
                model.owner_name,
                model.overall_score.as_ref().map(|v| v.to_string()),
                serde_json::Value::Object(model.meta.clone()).to_string(),
                ts_rfc3339(model.created_at),
                ts_rfc3339(model.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn all_models(&self) -> StoreResult<Vec<Model>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{MODEL_SELECT} ORDER BY id ASC"))?;
        let rows = stmt.query_map([], model_row_to_parts)?;
        let mut models = Vec::new();
        for row in rows {
            models.push(model_from_parts(row?)?);
        }
        Ok(models)
    }

    pub fn model(&self, model_id: &str) -> StoreResult<Option<Model>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{MODEL_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_map(params![model_id], model_row_to_parts)?
            .next()
            .transpose()?;
        row.map(model_from_parts).transpose()
    }

    // ── checkpoints ──

    /// Persist a checkpoint and its second-level tree atomically.
    pub fn commit_checkpoint(
        &self,
        checkpoint: &CheckpointRecord,
        nodes: &[MerkleNodeRecord],
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO checkpoints
                 (id, period_start, period_end, merkle_root, emission_json, status, tx_hash,
                  meta_json, created_at, emitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                checkpoint.id,
                ts_rfc3339(checkpoint.period_start),
                ts_rfc3339(checkpoint.period_end),
                checkpoint.merkle_root,
                serde_json::to_string(&checkpoint.emission)?,
                checkpoint.status.as_str(),
                checkpoint.tx_hash,
                serde_json::Value::Object(checkpoint.meta.clone()).to_string(),
                ts_rfc3339(checkpoint.created_at),
                checkpoint.emitted_at.map(ts_rfc3339),
            ],
        )?;
        for node in nodes {
            insert_merkle_node(&tx, node)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<CheckpointRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{CHECKPOINT_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_map(params![checkpoint_id], checkpoint_row_to_parts)?
            .next()
            .transpose()?;
        row.map(checkpoint_from_parts).transpose()
    }

    pub fn latest_checkpoint(&self) -> StoreResult<Option<CheckpointRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CHECKPOINT_SELECT} ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_map([], checkpoint_row_to_parts)?
            .next()
            .transpose()?;
        row.map(checkpoint_from_parts).transpose()
    }

    pub fn list_checkpoints(&self, limit: u32) -> StoreResult<Vec<CheckpointRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CHECKPOINT_SELECT} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], checkpoint_row_to_parts)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(checkpoint_from_parts(row?)?);
        }
        Ok(checkpoints)
    }

    /// PENDING → SUBMITTED, recording the settlement transaction hash.
    pub fn confirm_checkpoint(
        &self,
        checkpoint_id: &str,
        tx_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CheckpointRecord> {
        self.transition_checkpoint(checkpoint_id, CheckpointStatus::Submitted, Some(tx_hash), now)
    }

    /// Advance the status machine one step. Rewinds and skips are rejected.
    pub fn transition_checkpoint(
        &self,
        checkpoint_id: &str,
        next: CheckpointStatus,
        tx_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<CheckpointRecord> {
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let status_raw: String = tx
                .query_row(
                    "SELECT status FROM checkpoints WHERE id = ?1",
                    params![checkpoint_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))?;
            let status = CheckpointStatus::parse(&status_raw).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown checkpoint status `{status_raw}`"))
            })?;
            if !status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition(format!(
                    "checkpoint {checkpoint_id}: {status_raw} -> {}",
                    next.as_str()
                )));
            }

            if next == CheckpointStatus::Submitted {
                tx.execute(
                    "UPDATE checkpoints SET status = ?2, tx_hash = ?3, emitted_at = ?4 WHERE id = ?1",
                    params![checkpoint_id, next.as_str(), tx_hash, ts_rfc3339(now)],
                )?;
            } else {
                tx.execute(
                    "UPDATE checkpoints SET status = ?2 WHERE id = ?1",
                    params![checkpoint_id, next.as_str()],
                )?;
            }
            tx.commit()?;
        }

        self.checkpoint(checkpoint_id)?
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))
    }
}

type ModelRowParts = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
);

fn model_row_to_parts(row: &Row<'_>) -> rusqlite::Result<ModelRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn model_from_parts(parts: ModelRowParts) -> StoreResult<Model> {
    let (id, name, deployment_id, owner_id, owner_name, overall_score_json, meta_json, created_raw, updated_raw) =
        parts;
    Ok(Model {
        id,
        name,
        deployment_id,
        owner_id,
        owner_name,
        overall_score: overall_score_json
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()?,
        meta: json_object(&meta_json)?,
        created_at: parse_ts(&created_raw)?,
        updated_at: parse_ts(&updated_raw)?,
    })
}

type CheckpointRowParts = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn checkpoint_row_to_parts(row: &Row<'_>) -> rusqlite::Result<CheckpointRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn checkpoint_from_parts(parts: CheckpointRowParts) -> StoreResult<CheckpointRecord> {
    let (id, start_raw, end_raw, merkle_root, emission_json, status_raw, tx_hash, meta_json, created_raw, emitted_raw) =
        parts;
    Ok(CheckpointRecord {
        id,
        period_start: parse_ts(&start_raw)?,
        period_end: parse_ts(&end_raw)?,
        merkle_root,
        emission: serde_json::from_str(&emission_json)?,
        status: CheckpointStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown checkpoint status `{status_raw}`"))
        })?,
        tx_hash,
        meta: json_object(&meta_json)?,
        created_at: parse_ts(&created_raw)?,
        emitted_at: parse_opt_ts(emitted_raw)?,
    })
}
