// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tamper evidence: chained cycle roots over real pipeline output, proof
//! verification, and detection of retroactive edits.

mod common;

use chrono::Duration as ChronoDuration;
use common::{build_harness, seed_feed, t0, test_contract, Behavior};
use crunchcoord_verifier::{verify_cycle_chain, ChainError, CycleCommitment};

async fn run_cycles(harness: &common::Harness, count: i64) {
    for step in 0..count {
        harness
            .orchestrator
            .run_cycle(t0() + ChronoDuration::seconds(60 * step))
            .await
            .unwrap();
        harness
            .engine
            .run_tick(t0() + ChronoDuration::seconds(60 * step + 125))
            .unwrap();
    }
}

fn commitments(harness: &common::Harness) -> Vec<CycleCommitment> {
    harness
        .store
        .all_cycles()
        .unwrap()
        .into_iter()
        .map(|c| CycleCommitment {
            previous_cycle_root: c.previous_cycle_root,
            snapshots_root: c.snapshots_root,
            chained_root: c.chained_root,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_verifies_and_flags_retro_edits() {
    let harness = build_harness(
        vec![
            ("model-a", Behavior::Value(0.6)),
            ("model-b", Behavior::Value(0.2)),
        ],
        test_contract(),
    )
    .await;
    seed_feed(&harness.store, 30, 30);

    run_cycles(&harness, 3).await;
    let mut cycles = commitments(&harness);
    assert_eq!(cycles.len(), 3);

    // First cycle chains to the empty string.
    assert!(cycles[0].previous_cycle_root.is_none());
    assert_eq!(
        cycles[0].chained_root,
        crunchcoord_verifier::chained_root(None, &cycles[0].snapshots_root)
    );

    verify_cycle_chain(&cycles).unwrap();

    // Retroactively editing cycle 2's snapshots breaks its chained root;
    // the verifier localizes the tamper between cycles 2 and 3.
    cycles[1].snapshots_root = crunchcoord_verifier::sha256_hex(b"rewritten history");
    let err = verify_cycle_chain(&cycles).unwrap_err();
    assert!(matches!(err, ChainError::ChainedRootMismatch { index: 1, .. }));

    // Forging the chained root to match the edit instead breaks the link to
    // cycle 3.
    cycles[1].chained_root = crunchcoord_verifier::chained_root(
        cycles[1].previous_cycle_root.as_deref(),
        &cycles[1].snapshots_root,
    );
    let err = verify_cycle_chain(&cycles).unwrap_err();
    assert!(matches!(err, ChainError::BrokenLink { index: 2 }));
}

#[tokio::test(flavor = "multi_thread")]
async fn inclusion_proofs_verify_for_every_snapshot() {
    let harness = build_harness(
        vec![
            ("model-a", Behavior::Value(0.6)),
            ("model-b", Behavior::Value(0.2)),
            ("model-c", Behavior::Value(-0.1)),
        ],
        test_contract(),
    )
    .await;
    seed_feed(&harness.store, 30, 30);

    run_cycles(&harness, 2).await;

    let snapshots = harness.store.all_snapshots().unwrap();
    // Odd leaf count per cycle (three models) exercises duplication.
    assert_eq!(snapshots.len(), 6);

    for snapshot in &snapshots {
        let proof = harness.checkpoints.proof_for_snapshot(&snapshot.id).unwrap();
        assert_eq!(proof.snapshot_content_hash, snapshot.content_hash);
        assert!(proof.checkpoint_id.is_none());
        assert!(proof.verify(), "proof failed for {}", snapshot.id);
    }

    // A checkpoint extends the same proofs through the second tree level.
    let checkpoint = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(3600))
        .unwrap()
        .unwrap();
    for snapshot in &snapshots {
        let proof = harness.checkpoints.proof_for_snapshot(&snapshot.id).unwrap();
        assert_eq!(proof.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
        assert_eq!(proof.merkle_root, checkpoint.merkle_root);
        assert!(proof.verify(), "checkpointed proof failed for {}", snapshot.id);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn proofs_survive_snapshot_retention() {
    let harness = build_harness(vec![("model-a", Behavior::Value(0.6))], test_contract()).await;
    seed_feed(&harness.store, 30, 30);
    run_cycles(&harness, 1).await;

    let snapshot = harness.store.all_snapshots().unwrap().remove(0);
    let proof = harness.checkpoints.proof_for_snapshot(&snapshot.id).unwrap();

    // The leaf carries a copy of the content hash, so the proof does not
    // depend on the snapshot row existing.
    assert_eq!(proof.snapshot_content_hash, snapshot.content_hash);
    assert!(proof.verify());

    // Single-snapshot cycle: the root is the leaf itself.
    assert!(proof.path.is_empty());
    assert_eq!(proof.snapshots_root, snapshot.content_hash);
}
