// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crunchcoord_core::canonical::ts_rfc3339;
use crunchcoord_core::merkle::{MerkleCycleRecord, MerkleNodeRecord};

use super::{parse_ts, Store, StoreResult};

const CYCLE_SELECT: &str =
    "SELECT id, previous_cycle_id, previous_cycle_root, snapshots_root, chained_root, \
     snapshot_count, created_at FROM merkle_cycles";

const NODE_SELECT: &str =
    "SELECT id, cycle_id, checkpoint_id, level, position, hash, left_child_id, right_child_id, \
     snapshot_id, snapshot_content_hash, created_at FROM merkle_nodes";

type CycleRowParts = (
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    u64,
    String,
);

fn cycle_row_to_parts(row: &Row<'_>) -> rusqlite::Result<CycleRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn cycle_from_parts(parts: CycleRowParts) -> StoreResult<MerkleCycleRecord> {
    let (id, previous_cycle_id, previous_cycle_root, snapshots_root, chained_root, snapshot_count, created_raw) =
        parts;
    Ok(MerkleCycleRecord {
        id,
        previous_cycle_id,
        previous_cycle_root,
        snapshots_root,
        chained_root,
        snapshot_count,
        created_at: parse_ts(&created_raw)?,
    })
}

type NodeRowParts = (
    String,
    Option<String>,
    Option<String>,
    u32,
    u32,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn node_row_to_parts(row: &Row<'_>) -> rusqlite::Result<NodeRowParts> {
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
        row.get(10)?,
    ))
}

fn node_from_parts(parts: NodeRowParts) -> StoreResult<MerkleNodeRecord> {
    let (
        id,
        cycle_id,
        checkpoint_id,
        level,
        position,
        hash,
        left_child_id,
        right_child_id,
        snapshot_id,
        snapshot_content_hash,
        created_raw,
    ) = parts;
    Ok(MerkleNodeRecord {
        id,
        cycle_id,
        checkpoint_id,
        level,
        position,
        hash,
        left_child_id,
        right_child_id,
        snapshot_id,
        snapshot_content_hash,
        created_at: parse_ts(&created_raw)?,
    })
}

fn collect_cycles(
    rows: impl Iterator<Item = rusqlite::Result<CycleRowParts>>,
) -> StoreResult<Vec<MerkleCycleRecord>> {
    let mut cycles = Vec::new();
    for row in rows {
        cycles.push(cycle_from_parts(row?)?);
    }
    Ok(cycles)
}

fn collect_nodes(
    rows: impl Iterator<Item = rusqlite::Result<NodeRowParts>>,
) -> StoreResult<Vec<MerkleNodeRecord>> {
    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(node_from_parts(row?)?);
    }
    Ok(nodes)
}

impl Store {
    pub fn latest_cycle(&self) -> StoreResult<Option<MerkleCycleRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("{CYCLE_SELECT} ORDER BY created_at DESC, id DESC LIMIT 1"))?;
        let row = stmt
            .query_map([], cycle_row_to_parts)?
            .next()
            .transpose()?;
        row.map(cycle_from_parts).transpose()
    }

    pub fn cycle(&self, cycle_id: &str) -> StoreResult<Option<MerkleCycleRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{CYCLE_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_map(params![cycle_id], cycle_row_to_parts)?
            .next()
            .transpose()?;
        row.map(cycle_from_parts).transpose()
    }

    /// Cycles with `start < created_at <= end`, creation order.
    pub fn cycles_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<MerkleCycleRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CYCLE_SELECT} WHERE created_at > ?1 AND created_at <= ?2 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(
            params![ts_rfc3339(start), ts_rfc3339(end)],
            cycle_row_to_parts,
        )?;
        collect_cycles(rows)
    }

    pub fn all_cycles(&self) -> StoreResult<Vec<MerkleCycleRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{CYCLE_SELECT} ORDER BY created_at ASC, id ASC"))?;
        let rows = stmt.query_map([], cycle_row_to_parts)?;
        collect_cycles(rows)
    }

    pub fn nodes_for_cycle(&self, cycle_id: &str) -> StoreResult<Vec<MerkleNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{NODE_SELECT} WHERE cycle_id = ?1 ORDER BY level ASC, position ASC"
        ))?;
        let rows = stmt.query_map(params![cycle_id], node_row_to_parts)?;
        collect_nodes(rows)
    }

    pub fn nodes_for_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Vec<MerkleNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{NODE_SELECT} WHERE checkpoint_id = ?1 ORDER BY level ASC, position ASC"
        ))?;
        let rows = stmt.query_map(params![checkpoint_id], node_row_to_parts)?;
        collect_nodes(rows)
    }

    /// The cycle-tree leaf carrying a snapshot, if any.
    pub fn node_for_snapshot(&self, snapshot_id: &str) -> StoreResult<Option<MerkleNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{NODE_SELECT} WHERE snapshot_id = ?1 AND cycle_id IS NOT NULL LIMIT 1"
        ))?;
        let row = stmt
            .query_map(params![snapshot_id], node_row_to_parts)?
            .next()
            .transpose()?;
        row.map(node_from_parts).transpose()
    }

    /// Find the checkpoint-tree leaf whose hash matches a cycle's chained
    /// root, linking the two proof levels.
    pub fn checkpoint_leaf_for_hash(&self, hash: &str) -> StoreResult<Option<MerkleNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{NODE_SELECT} WHERE checkpoint_id IS NOT NULL AND level = 0 AND hash = ?1 LIMIT 1"
        ))?;
        let row = stmt
            .query_map(params![hash], node_row_to_parts)?
            .next()
            .transpose()?;
        row.map(node_from_parts).transpose()
    }
}
