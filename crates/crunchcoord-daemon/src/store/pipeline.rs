// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::Value;

use crunchcoord_core::canonical::ts_rfc3339;
use crunchcoord_core::entities::{
    InputRecord, InputStatus, LeaderboardEntry, LeaderboardRecord, PredictionRecord,
    PredictionStatus, ScheduledPredictionConfig, SnapshotRecord,
};
use crunchcoord_core::merkle::{MerkleCycleRecord, MerkleNodeRecord};
use crunchcoord_core::schedule::ScheduleEnvelope;

use super::{json_object, parse_ts, Store, StoreError, StoreResult};

/// Everything one score tick persists. Committed in a single transaction so
/// partial state is never externally visible; the cycle only lands when all
/// phases succeeded.
#[derive(Debug, Default)]
pub struct ScoreTickCommit {
    /// Existing predictions transitioning out of PENDING, with scores set.
    pub updated_predictions: Vec<PredictionRecord>,
    /// Synthetic ensemble predictions created this tick.
    pub new_predictions: Vec<PredictionRecord>,
    pub snapshots: Vec<SnapshotRecord>,
    pub cycle: Option<MerkleCycleRecord>,
    pub nodes: Vec<MerkleNodeRecord>,
    pub leaderboard: Option<LeaderboardRecord>,
}

impl Store {
    // ── prediction configs ──

    pub fn upsert_prediction_config(&self, config: &ScheduledPredictionConfig) -> StoreResult<()> {
        self.lock().execute(
            "INSERT INTO prediction_configs
                 (id, scope_key, scope_json, every_seconds, resolve_after_seconds, active, ord)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                 scope_key = excluded.scope_key,
                 scope_json = excluded.scope_json,
                 every_seconds = excluded.every_seconds,
                 resolve_after_seconds = excluded.resolve_after_seconds,
                 active = excluded.active,
                 ord = excluded.ord",
            params![
                config.id,
                config.scope_key,
                serde_json::to_string(&config.scope)?,
                config.schedule.every_seconds,
                config.schedule.resolve_after_seconds,
                config.active,
                config.order,
            ],
        )?;
        Ok(())
    }

    pub fn active_prediction_configs(&self) -> StoreResult<Vec<ScheduledPredictionConfig>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, scope_key, scope_json, every_seconds, resolve_after_seconds, active, ord
             FROM prediction_configs WHERE active = 1 ORDER BY ord ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, Option<u64>>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut configs = Vec::new();
        for row in rows {
            let (id, scope_key, scope_json, every_seconds, resolve_after_seconds, active, order) =
                row?;
            configs.push(ScheduledPredictionConfig {
                id,
                scope_key,
                scope: serde_json::from_str(&scope_json)?,
                schedule: ScheduleEnvelope {
                    every_seconds,
                    resolve_after_seconds,
                },
                active,
                order,
            });
        }
        Ok(configs)
    }

    // ── predict cycle commit ──

    /// Persist one cycle's input together with all of its predictions.
    /// Either everything lands or nothing does.
    pub fn commit_predict_cycle(
        &self,
        input: &InputRecord,
        predictions: &[PredictionRecord],
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        insert_input(&tx, input)?;
        for prediction in predictions {
            insert_prediction(&tx, prediction)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── inputs ──

    pub fn input(&self, input_id: &str) -> StoreResult<Option<InputRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{INPUT_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_map(params![input_id], input_row_to_parts)?
            .next()
            .transpose()?;
        row.map(input_from_parts).transpose()
    }

    /// Inputs still awaiting ground truth whose horizon has elapsed.
    pub fn unresolved_inputs(&self, resolvable_before: DateTime<Utc>) -> StoreResult<Vec<InputRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{INPUT_SELECT} WHERE status = 'RECEIVED' AND resolvable_at <= ?1 ORDER BY resolvable_at ASC"
        ))?;
        let rows = stmt.query_map(params![ts_rfc3339(resolvable_before)], input_row_to_parts)?;
        let mut inputs = Vec::new();
        for row in rows {
            inputs.push(input_from_parts(row?)?);
        }
        Ok(inputs)
    }

    /// Transition a batch of inputs to RESOLVED in one transaction. A `None`
    /// value writes the JSON `null` sentinel (no ground truth). Inputs that
    /// already left RECEIVED are rejected.
    pub fn resolve_inputs(&self, resolutions: &[(String, Option<Value>)]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (input_id, actuals) in resolutions {
            let status_raw: String = tx
                .query_row(
                    "SELECT status FROM inputs WHERE id = ?1",
                    params![input_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("input {input_id}")))?;
            let status = InputStatus::parse(&status_raw)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown input status `{status_raw}`")))?;
            if !status.can_transition_to(InputStatus::Resolved) {
                return Err(StoreError::InvalidTransition(format!(
                    "input {input_id}: {status_raw} -> RESOLVED"
                )));
            }

            let actuals_json = match actuals {
                Some(value) => value.to_string(),
                None => Value::Null.to_string(),
            };
            tx.execute(
                "UPDATE inputs SET status = 'RESOLVED', actuals_json = ?2 WHERE id = ?1",
                params![input_id, actuals_json],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── predictions ──

    /// PENDING predictions whose input has resolved, paired with the input.
    pub fn pending_predictions_with_resolved_inputs(
        &self,
    ) -> StoreResult<Vec<(PredictionRecord, InputRecord)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.input_id, p.model_id, p.config_id, p.scope_key, p.scope_json,
                    p.status, p.exec_time_us, p.inference_output_json, p.score_json, p.meta_json,
                    p.performed_at,
                    i.id, i.config_id, i.scope_json, i.raw_input_json, i.actuals_json, i.status,
                    i.performed_at, i.resolvable_at
             FROM predictions p
             JOIN inputs i ON i.id = p.input_id
             WHERE p.status = 'PENDING' AND i.status = 'RESOLVED'
             ORDER BY p.performed_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let prediction = prediction_row_to_parts_at(row, 0)?;
            let input = (
                row.get::<_, String>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, String>(14)?,
                row.get::<_, String>(15)?,
                row.get::<_, Option<String>>(16)?,
                row.get::<_, String>(17)?,
                row.get::<_, String>(18)?,
                row.get::<_, String>(19)?,
            );
            Ok((prediction, input))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (prediction_parts, input_parts) = row?;
            out.push((
                prediction_from_parts(prediction_parts)?,
                input_from_parts(input_parts)?,
            ));
        }
        Ok(out)
    }

    /// Scored predictions in a window, for ensemble weights and metric
    /// context.
    pub fn scored_predictions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<PredictionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_SELECT}
             WHERE status = 'SCORED' AND performed_at >= ?1 AND performed_at <= ?2
             ORDER BY performed_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![ts_rfc3339(start), ts_rfc3339(end)],
            |row| prediction_row_to_parts_at(row, 0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(prediction_from_parts(row?)?);
        }
        Ok(out)
    }

    pub fn predictions_for_input(&self, input_id: &str) -> StoreResult<Vec<PredictionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_SELECT} WHERE input_id = ?1 ORDER BY model_id ASC"
        ))?;
        let rows = stmt.query_map(params![input_id], |row| prediction_row_to_parts_at(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(prediction_from_parts(row?)?);
        }
        Ok(out)
    }

    pub fn predictions_for_model(
        &self,
        model_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<PredictionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{PREDICTION_SELECT} WHERE model_id = ?1 ORDER BY performed_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![model_id, limit], |row| {
            prediction_row_to_parts_at(row, 0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(prediction_from_parts(row?)?);
        }
        Ok(out)
    }

    /// Flip surviving PENDING predictions of TTL-expired inputs to FAILED.
    pub fn fail_predictions_for_input(
        &self,
        input_id: &str,
        reason: &str,
    ) -> StoreResult<u64> {
        let score = serde_json::json!({
            "value": 0.0,
            "success": false,
            "failed_reason": reason,
        });
        let changed = self.lock().execute(
            "UPDATE predictions SET status = 'FAILED', score_json = ?2
             WHERE input_id = ?1 AND status = 'PENDING'",
            params![input_id, score.to_string()],
        )?;
        Ok(changed as u64)
    }

    // ── score tick commit ──

    /// Commit everything a score tick produced atomically. Prediction status
    /// updates are guarded: a row that already left PENDING is skipped, which
    /// makes a replayed tick a no-op.
    pub fn commit_score_tick(&self, commit: &ScoreTickCommit) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        for prediction in &commit.updated_predictions {
            let score_json = prediction
                .score
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "UPDATE predictions SET status = ?2, score_json = ?3
                 WHERE id = ?1 AND status = 'PENDING'",
                params![prediction.id, prediction.status.as_str(), score_json],
            )?;
        }

        for prediction in &commit.new_predictions {
            insert_prediction(&tx, prediction)?;
        }

        for snapshot in &commit.snapshots {
            tx.execute(
                "INSERT INTO snapshots
                     (id, model_id, period_start, period_end, prediction_count,
                      result_summary_json, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (model_id, period_end) DO NOTHING",
                params![
                    snapshot.id,
                    snapshot.model_id,
                    ts_rfc3339(snapshot.period_start),
                    ts_rfc3339(snapshot.period_end),
                    snapshot.prediction_count,
                    serde_json::Value::Object(snapshot.result_summary.clone()).to_string(),
                    snapshot.content_hash,
                    ts_rfc3339(snapshot.created_at),
                ],
            )?;
        }

        if let Some(cycle) = &commit.cycle {
            tx.execute(
                "INSERT INTO merkle_cycles
                     (id, previous_cycle_id, previous_cycle_root, snapshots_root, chained_root,
                      snapshot_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cycle.id,
                    cycle.previous_cycle_id,
                    cycle.previous_cycle_root,
                    cycle.snapshots_root,
                    cycle.chained_root,
                    cycle.snapshot_count,
                    ts_rfc3339(cycle.created_at),
                ],
            )?;
        }

        for node in &commit.nodes {
            insert_merkle_node(&tx, node)?;
        }

        if let Some(leaderboard) = &commit.leaderboard {
            tx.execute(
                "INSERT INTO leaderboards (id, created_at, entries_json, meta_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    leaderboard.id,
                    ts_rfc3339(leaderboard.created_at),
                    serde_json::to_string(&leaderboard.entries)?,
                    serde_json::Value::Object(leaderboard.meta.clone()).to_string(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ── snapshots and leaderboard reads ──

    pub fn snapshots_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SnapshotRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SNAPSHOT_SELECT} WHERE period_end > ?1 AND period_end <= ?2 ORDER BY period_end ASC"
        ))?;
        let rows = stmt.query_map(
            params![ts_rfc3339(start), ts_rfc3339(end)],
            snapshot_row_to_parts,
        )?;
        collect_snapshots(rows)
    }

    pub fn snapshots_query(
        &self,
        model_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> StoreResult<Vec<SnapshotRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SNAPSHOT_SELECT}
             WHERE (?1 IS NULL OR model_id = ?1)
               AND (?2 IS NULL OR period_end >= ?2)
               AND (?3 IS NULL OR period_end <= ?3)
             ORDER BY period_end DESC LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                model_id,
                since.map(ts_rfc3339),
                until.map(ts_rfc3339),
                limit
            ],
            snapshot_row_to_parts,
        )?;
        collect_snapshots(rows)
    }

    pub fn all_snapshots(&self) -> StoreResult<Vec<SnapshotRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("{SNAPSHOT_SELECT} ORDER BY period_end ASC"))?;
        let rows = stmt.query_map([], snapshot_row_to_parts)?;
        collect_snapshots(rows)
    }

    pub fn snapshot(&self, snapshot_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{SNAPSHOT_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_map(params![snapshot_id], snapshot_row_to_parts)?
            .next()
            .transpose()?;
        row.map(snapshot_from_parts).transpose()
    }

    pub fn latest_leaderboard(&self) -> StoreResult<Option<LeaderboardRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, entries_json, meta_json
             FROM leaderboards ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .next()
            .transpose()?;

        row.map(|(id, created_raw, entries_json, meta_json)| {
            let entries: Vec<LeaderboardEntry> = serde_json::from_str(&entries_json)?;
            Ok(LeaderboardRecord {
                id,
                created_at: parse_ts(&created_raw)?,
                entries,
                meta: json_object(&meta_json)?,
            })
        })
        .transpose()
    }
}

// ── row plumbing ──

const INPUT_SELECT: &str = "SELECT id, config_id, scope_json, raw_input_json, actuals_json, \
                            status, performed_at, resolvable_at FROM inputs";

const PREDICTION_SELECT: &str =
    "SELECT id, input_id, model_id, config_id, scope_key, scope_json, status, exec_time_us, \
     inference_output_json, score_json, meta_json, performed_at FROM predictions";

const SNAPSHOT_SELECT: &str =
    "SELECT id, model_id, period_start, period_end, prediction_count, result_summary_json, \
     content_hash, created_at FROM snapshots";

type InputRowParts = (
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
);

fn input_row_to_parts(row: &Row<'_>) -> rusqlite::Result<InputRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn input_from_parts(parts: InputRowParts) -> StoreResult<InputRecord> {
    let (id, config_id, scope_json, raw_input_json, actuals_json, status_raw, performed_raw, resolvable_raw) =
        parts;
    let actuals = actuals_json
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;
    Ok(InputRecord {
        id,
        config_id,
        scope: serde_json::from_str(&scope_json)?,
        raw_input: serde_json::from_str(&raw_input_json)?,
        actuals,
        status: InputStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown input status `{status_raw}`")))?,
        performed_at: parse_ts(&performed_raw)?,
        resolvable_at: parse_ts(&resolvable_raw)?,
    })
}

fn insert_input(tx: &Transaction<'_>, input: &InputRecord) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO inputs
             (id, config_id, scope_json, raw_input_json, actuals_json, status,
              performed_at, resolvable_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            input.id,
            input.config_id,
            serde_json::to_string(&input.scope)?,
            input.raw_input.to_string(),
            input.actuals.as_ref().map(|v| v.to_string()),
            input.status.as_str(),
            ts_rfc3339(input.performed_at),
            ts_rfc3339(input.resolvable_at),
        ],
    )?;
    Ok(())
}

type PredictionRowParts = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    u64,
    String,
    Option<String>,
    String,
    String,
);

fn prediction_row_to_parts_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<PredictionRowParts> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
        row.get(offset + 5)?,
        row.get(offset + 6)?,
        row.get(offset + 7)?,
        row.get(offset + 8)?,
        row.get(offset + 9)?,
        row.get(offset + 10)?,
        row.get(offset + 11)?,
    ))
}

fn prediction_from_parts(parts: PredictionRowParts) -> StoreResult<PredictionRecord> {
    let (
        id,
        input_id,
        model_id,
        config_id,
        scope_key,
        scope_json,
        status_raw,
        exec_time_us,
        inference_output_json,
        score_json,
        meta_json,
        performed_raw,
    ) = parts;
    Ok(PredictionRecord {
        id,
        input_id,
        model_id,
        config_id,
        scope_key,
        scope: serde_json::from_str(&scope_json)?,
        status: PredictionStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown prediction status `{status_raw}`"))
        })?,
        exec_time_us,
        inference_output: serde_json::from_str(&inference_output_json)?,
        score: score_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        meta: json_object(&meta_json)?,
        performed_at: parse_ts(&performed_raw)?,
    })
}

fn insert_prediction(tx: &Transaction<'_>, prediction: &PredictionRecord) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO predictions
             (id, input_id, model_id, config_id, scope_key, scope_json, status, exec_time_us,
              inference_output_json, score_json, meta_json, performed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (id) DO NOTHING",
        params![
            prediction.id,
            prediction.input_id,
            prediction.model_id,
            prediction.config_id,
            prediction.scope_key,
            serde_json::to_string(&prediction.scope)?,
            prediction.status.as_str(),
            prediction.exec_time_us,
            prediction.inference_output.to_string(),
            prediction
                .score
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            serde_json::Value::Object(prediction.meta.clone()).to_string(),
            ts_rfc3339(prediction.performed_at),
        ],
    )?;
    Ok(())
}

type SnapshotRowParts = (String, String, String, String, u64, String, String, String);

fn snapshot_row_to_parts(row: &Row<'_>) -> rusqlite::Result<SnapshotRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn snapshot_from_parts(parts: SnapshotRowParts) -> StoreResult<SnapshotRecord> {
    let (id, model_id, start_raw, end_raw, prediction_count, summary_json, content_hash, created_raw) =
        parts;
    Ok(SnapshotRecord {
        id,
        model_id,
        period_start: parse_ts(&start_raw)?,
        period_end: parse_ts(&end_raw)?,
        prediction_count,
        result_summary: json_object(&summary_json)?,
        content_hash,
        created_at: parse_ts(&created_raw)?,
    })
}

fn collect_snapshots(
    rows: impl Iterator<Item = rusqlite::Result<SnapshotRowParts>>,
) -> StoreResult<Vec<SnapshotRecord>> {
    let mut snapshots = Vec::new();
    for row in rows {
        snapshots.push(snapshot_from_parts(row?)?);
    }
    Ok(snapshots)
}

pub(super) fn insert_merkle_node(tx: &Transaction<'_>, node: &MerkleNodeRecord) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO merkle_nodes
             (id, cycle_id, checkpoint_id, level, position, hash, left_child_id, right_child_id,
              snapshot_id, snapshot_content_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (id) DO NOTHING",
        params![
            node.id,
            node.cycle_id,
            node.checkpoint_id,
            node.level,
            node.position,
            node.hash,
            node.left_child_id,
            node.right_child_id,
            node.snapshot_id,
            node.snapshot_content_hash,
            ts_rfc3339(node.created_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn scope() -> crunchcoord_core::entities::PredictionScope {
        crunchcoord_core::entities::PredictionScope {
            subject: "BTC".to_string(),
            horizon_seconds: 300,
            step_seconds: 60,
            extra: serde_json::Map::new(),
        }
    }

    fn input(id: &str, now: DateTime<Utc>) -> InputRecord {
        InputRecord {
            id: id.to_string(),
            config_id: Some("CFG_default".to_string()),
            scope: scope(),
            raw_input: json!({"symbol": "BTC"}),
            actuals: None,
            status: InputStatus::Received,
            performed_at: now,
            resolvable_at: now + Duration::seconds(300),
        }
    }

    fn prediction(id: &str, input_id: &str, model: &str, now: DateTime<Utc>) -> PredictionRecord {
        PredictionRecord {
            id: id.to_string(),
            input_id: input_id.to_string(),
            model_id: model.to_string(),
            config_id: Some("CFG_default".to_string()),
            scope_key: "default".to_string(),
            scope: scope(),
            status: PredictionStatus::Pending,
            exec_time_us: 1200,
            inference_output: json!({"value": 0.4}),
            score: None,
            meta: serde_json::Map::new(),
            performed_at: now,
        }
    }

    #[test]
    fn predict_cycle_commit_is_atomic_and_readable() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let inp = input("INP_1", now);
        let preds = vec![
            prediction("PRE_1", "INP_1", "model-a", now),
            prediction("PRE_2", "INP_1", "model-b", now),
        ];
        store.commit_predict_cycle(&inp, &preds).unwrap();

        let stored = store.input("INP_1").unwrap().unwrap();
        assert_eq!(stored.status, InputStatus::Received);
        assert_eq!(store.predictions_for_input("INP_1").unwrap().len(), 2);

        // Duplicate input id fails the whole commit.
        let err = store.commit_predict_cycle(&inp, &preds).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn input_resolution_enforces_one_way_transition() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .commit_predict_cycle(&input("INP_1", now - Duration::seconds(600)), &[])
            .unwrap();

        let unresolved = store.unresolved_inputs(now).unwrap();
        assert_eq!(unresolved.len(), 1);

        store
            .resolve_inputs(&[("INP_1".to_string(), Some(json!({"return_pct": 0.01})))])
            .unwrap();
        let resolved = store.input("INP_1").unwrap().unwrap();
        assert_eq!(resolved.status, InputStatus::Resolved);
        assert_eq!(resolved.actuals, Some(json!({"return_pct": 0.01})));

        // A second resolution attempt is rejected.
        let err = store
            .resolve_inputs(&[("INP_1".to_string(), None)])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[test]
    fn null_sentinel_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .commit_predict_cycle(&input("INP_1", now - Duration::seconds(600)), &[])
            .unwrap();
        store.resolve_inputs(&[("INP_1".to_string(), None)]).unwrap();

        let resolved = store.input("INP_1").unwrap().unwrap();
        assert!(resolved.resolved_without_truth());
    }

    #[test]
    fn score_tick_updates_only_pending_rows() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let inp = input("INP_1", now - Duration::seconds(600));
        store
            .commit_predict_cycle(&inp, &[prediction("PRE_1", "INP_1", "model-a", now)])
            .unwrap();
        store
            .resolve_inputs(&[("INP_1".to_string(), Some(json!({"return_pct": 0.01})))])
            .unwrap();

        let mut scored = prediction("PRE_1", "INP_1", "model-a", now);
        scored.status = PredictionStatus::Scored;
        scored.score = Some(crunchcoord_core::entities::ScoreOutcome {
            value: 0.01,
            success: true,
            failed_reason: None,
            extra: serde_json::Map::new(),
        });

        let commit = ScoreTickCommit {
            updated_predictions: vec![scored.clone()],
            ..ScoreTickCommit::default()
        };
        store.commit_score_tick(&commit).unwrap();

        let after = store.predictions_for_input("INP_1").unwrap();
        assert_eq!(after[0].status, PredictionStatus::Scored);
        let first_score = after[0].score.clone().unwrap();

        // Re-running the same commit is a no-op: the row already left
        // PENDING, so the guarded update matches nothing.
        let mut replay = scored;
        replay.score = Some(crunchcoord_core::entities::ScoreOutcome {
            value: 99.0,
            success: true,
            failed_reason: None,
            extra: serde_json::Map::new(),
        });
        store
            .commit_score_tick(&ScoreTickCommit {
                updated_predictions: vec![replay],
                ..ScoreTickCommit::default()
            })
            .unwrap();
        let again = store.predictions_for_input("INP_1").unwrap();
        assert_eq!(again[0].score.clone().unwrap().value, first_score.value);
    }

    #[test]
    fn snapshot_upsert_keyed_by_model_and_period() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut summary = serde_json::Map::new();
        summary.insert("value".to_string(), json!(0.5));
        let snapshot = SnapshotRecord {
            id: "SNAP_model-a_1".to_string(),
            model_id: "model-a".to_string(),
            period_start: now - Duration::seconds(60),
            period_end: now,
            prediction_count: 3,
            result_summary: summary,
            content_hash: "ab".repeat(32),
            created_at: now,
        };
        let commit = ScoreTickCommit {
            snapshots: vec![snapshot.clone()],
            ..ScoreTickCommit::default()
        };
        store.commit_score_tick(&commit).unwrap();

        // Same (model, period_end) with a different id is ignored.
        let mut duplicate = snapshot;
        duplicate.id = "SNAP_model-a_other".to_string();
        store
            .commit_score_tick(&ScoreTickCommit {
                snapshots: vec![duplicate],
                ..ScoreTickCommit::default()
            })
            .unwrap();

        let all = store.all_snapshots().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "SNAP_model-a_1");
    }
}
