// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Merkle tamper evidence.
//!
//! Each score cycle commits a balanced binary tree over that cycle's
//! snapshot content hashes, then chains to the previous cycle:
//! `chained_root = SHA256(previous_chained_root || snapshots_root)` with the
//! empty string standing in for the first cycle's predecessor. Checkpoints
//! commit a second-level tree whose leaves are cycle chained roots.
//!
//! Leaf content hashes are copied into the persisted nodes so proofs stay
//! verifiable after snapshot retention deletes the source rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crunchcoord_verifier::{
    chained_root, empty_tree_root, resolve_proof, sha256_concat, verify_inclusion_proof,
    ProofStep, Side,
};

/// Per-cycle commitment row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleCycleRecord {
    pub id: String,
    pub previous_cycle_id: Option<String>,
    pub previous_cycle_root: Option<String>,
    pub snapshots_root: String,
    pub chained_root: String,
    pub snapshot_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Persisted tree node. Belongs to exactly one cycle tree or one checkpoint
/// tree; leaves of cycle trees carry the snapshot linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleNodeRecord {
    pub id: String,
    pub cycle_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub level: u32,
    pub position: u32,
    pub hash: String,
    pub left_child_id: Option<String>,
    pub right_child_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub snapshot_content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// In-memory node used during construction and proof generation. Children
/// are indexes into the flat node list.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub hash: String,
    pub level: u32,
    pub position: u32,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub snapshot_id: Option<String>,
    pub snapshot_content_hash: Option<String>,
}

impl TreeNode {
    pub fn leaf(position: u32, hash: String) -> Self {
        Self {
            hash,
            level: 0,
            position,
            left: None,
            right: None,
            snapshot_id: None,
            snapshot_content_hash: None,
        }
    }

    pub fn snapshot_leaf(position: u32, snapshot_id: String, content_hash: String) -> Self {
        Self {
            hash: content_hash.clone(),
            level: 0,
            position,
            left: None,
            right: None,
            snapshot_id: Some(snapshot_id),
            snapshot_content_hash: Some(content_hash),
        }
    }
}

/// Build a balanced binary tree from leaves. Returns the flat node list
/// (leaves first, root last). A single leaf is its own root; an odd node
/// count at any level duplicates the last node.
pub fn build_tree(leaves: Vec<TreeNode>) -> Vec<TreeNode> {
    if leaves.len() <= 1 {
        return leaves;
    }

    let mut nodes = leaves;
    let mut current: Vec<usize> = (0..nodes.len()).collect();
    let mut level = 1u32;

    while current.len() > 1 {
        if current.len() % 2 == 1 {
            if let Some(last) = current.last().copied() {
                current.push(last);
            }
        }

        let mut next = Vec::with_capacity(current.len() / 2);
        for (pair, chunk) in current.chunks(2).enumerate() {
            let (left, right) = (chunk[0], chunk[1]);
            let parent = TreeNode {
                hash: sha256_concat(&nodes[left].hash, &nodes[right].hash),
                level,
                position: pair as u32,
                left: Some(left),
                right: Some(right),
                snapshot_id: None,
                snapshot_content_hash: None,
            };
            nodes.push(parent);
            next.push(nodes.len() - 1);
        }
        current = next;
        level += 1;
    }

    nodes
}

/// The root is the unique node at the highest level.
pub fn root_hash(nodes: &[TreeNode]) -> Option<&str> {
    nodes
        .iter()
        .max_by_key(|n| n.level)
        .map(|n| n.hash.as_str())
}

/// Generate the sibling path from a leaf hash up to the root.
pub fn inclusion_path(nodes: &[TreeNode], leaf_hash: &str) -> Vec<ProofStep> {
    let Some(leaf_idx) = nodes
        .iter()
        .position(|n| n.level == 0 && n.hash == leaf_hash)
    else {
        return Vec::new();
    };

    let mut parent_of = vec![None; nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        if let Some(left) = node.left {
            parent_of[left] = Some(idx);
        }
        if let Some(right) = node.right {
            parent_of[right] = Some(idx);
        }
    }

    let mut path = Vec::new();
    let mut current = leaf_idx;
    while let Some(parent) = parent_of[current] {
        let node = &nodes[parent];
        if node.left == Some(current) {
            if let Some(right) = node.right {
                path.push(ProofStep {
                    hash: nodes[right].hash.clone(),
                    position: Side::Right,
                });
            }
        } else if let Some(left) = node.left {
            path.push(ProofStep {
                hash: nodes[left].hash.clone(),
                position: Side::Left,
            });
        }
        current = parent;
    }
    path
}

/// Rebuild an in-memory tree from persisted rows so a proof can be
/// generated long after the commit.
pub fn tree_from_records(records: &[MerkleNodeRecord]) -> Vec<TreeNode> {
    let index_by_id: std::collections::HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(idx, r)| (r.id.as_str(), idx))
        .collect();

    records
        .iter()
        .map(|r| TreeNode {
            hash: r.hash.clone(),
            level: r.level,
            position: r.position,
            left: r
                .left_child_id
                .as_deref()
                .and_then(|id| index_by_id.get(id).copied()),
            right: r
                .right_child_id
                .as_deref()
                .and_then(|id| index_by_id.get(id).copied()),
            snapshot_id: r.snapshot_id.clone(),
            snapshot_content_hash: r.snapshot_content_hash.clone(),
        })
        .collect()
}
