// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint building over real cycles: tier redistribution, the frac64
//! conservation invariant, provider pass-through and the status machine.

mod common;

use chrono::Duration as ChronoDuration;
use common::{build_harness, seed_feed, t0, test_contract, Behavior};
use crunchcoord_core::entities::CheckpointStatus;
use crunchcoord_protocol::FRAC64_MULTIPLIER;

#[tokio::test(flavor = "multi_thread")]
async fn three_ranked_models_split_fifty_twentyfive_twentyfive() {
    let harness = build_harness(
        vec![
            ("model-a", Behavior::Value(0.9)),
            ("model-b", Behavior::Value(0.4)),
            ("model-c", Behavior::Value(-0.2)),
        ],
        test_contract(),
    )
    .await;
    seed_feed(&harness.store, 30, 30);

    for step in 0..2 {
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

    let checkpoint = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(3600))
        .unwrap()
        .unwrap();

    assert_eq!(checkpoint.status, CheckpointStatus::Pending);
    assert!(checkpoint.merkle_root.is_some());
    assert_eq!(checkpoint.meta["cycle_count"], serde_json::json!(2));

    let rewards = &checkpoint.emission.cruncher_rewards;
    assert_eq!(rewards.len(), 3);
    // Base tiers 35/10/10, residual 45% redistributed equally.
    assert_eq!(rewards[0].reward_pct, 500_000_000);
    assert_eq!(rewards[1].reward_pct, 250_000_000);
    assert_eq!(rewards[2].reward_pct, 250_000_000);
    assert_eq!(
        rewards.iter().map(|r| r.reward_pct).sum::<u64>(),
        FRAC64_MULTIPLIER
    );

    // Provider identities pass through untouched.
    assert_eq!(
        checkpoint.emission.compute_provider_rewards[0].provider,
        "cp-wallet"
    );
    assert_eq!(
        checkpoint.emission.data_provider_rewards[0].provider,
        "dp-wallet"
    );

    // The ranking rides in the checkpoint meta with the long model first.
    let ranking = checkpoint.meta["ranking"].as_array().unwrap();
    assert_eq!(ranking[0]["model_id"], serde_json::json!("model-a"));
    assert_eq!(ranking[0]["rank"], serde_json::json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_skips_empty_periods_and_chains_periods() {
    let harness = build_harness(vec![("model-a", Behavior::Value(0.5))], test_contract()).await;
    seed_feed(&harness.store, 30, 60);

    // Nothing has been scored yet: no cycles, no checkpoint.
    assert!(harness
        .checkpoints
        .build_once(t0() - ChronoDuration::seconds(10))
        .unwrap()
        .is_none());

    harness.orchestrator.run_cycle(t0()).await.unwrap();
    harness
        .engine
        .run_tick(t0() + ChronoDuration::seconds(125))
        .unwrap();

    let first = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(200))
        .unwrap()
        .unwrap();

    // A follow-up period with no new cycles produces no checkpoint.
    assert!(harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(300))
        .unwrap()
        .is_none());

    // New work after the first checkpoint lands in the next period,
    // starting exactly at the previous period end.
    harness
        .orchestrator
        .run_cycle(t0() + ChronoDuration::seconds(600))
        .await
        .unwrap();
    harness
        .engine
        .run_tick(t0() + ChronoDuration::seconds(725))
        .unwrap();
    let second = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(800))
        .unwrap()
        .unwrap();
    assert_eq!(second.period_start, first.period_end);
    second.emission.validate().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_status_advances_one_way_through_the_store() {
    let harness = build_harness(vec![("model-a", Behavior::Value(0.5))], test_contract()).await;
    seed_feed(&harness.store, 30, 30);

    harness.orchestrator.run_cycle(t0()).await.unwrap();
    harness
        .engine
        .run_tick(t0() + ChronoDuration::seconds(125))
        .unwrap();
    let checkpoint = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(300))
        .unwrap()
        .unwrap();

    let now = t0() + ChronoDuration::seconds(400);
    let submitted = harness
        .store
        .confirm_checkpoint(&checkpoint.id, "0xfeed", now)
        .unwrap();
    assert_eq!(submitted.status, CheckpointStatus::Submitted);
    assert_eq!(submitted.tx_hash.as_deref(), Some("0xfeed"));

    // Skipping a step is rejected.
    let err = harness
        .store
        .transition_checkpoint(&checkpoint.id, CheckpointStatus::Paid, None, now)
        .unwrap_err();
    assert!(matches!(
        err,
        crunchcoord_daemon::store::StoreError::InvalidTransition(_)
    ));

    harness
        .store
        .transition_checkpoint(&checkpoint.id, CheckpointStatus::Claimable, None, now)
        .unwrap();
    let paid = harness
        .store
        .transition_checkpoint(&checkpoint.id, CheckpointStatus::Paid, None, now)
        .unwrap();
    assert_eq!(paid.status, CheckpointStatus::Paid);
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_models_never_earn_rewards() {
    let mut contract = test_contract();
    contract.ensembles = vec![crunchcoord_core::ensemble::EnsembleConfig {
        name: "main".to_string(),
        strategy: crunchcoord_core::ensemble::WeightStrategy::EqualWeight,
        model_filter: None,
        enabled: true,
    }];

    let harness = build_harness(
        vec![
            ("model-a", Behavior::Value(0.9)),
            ("model-b", Behavior::Value(0.3)),
        ],
        contract,
    )
    .await;
    seed_feed(&harness.store, 30, 30);

    harness.orchestrator.run_cycle(t0()).await.unwrap();
    harness
        .engine
        .run_tick(t0() + ChronoDuration::seconds(125))
        .unwrap();

    // The ensemble produced a snapshot...
    let snapshots = harness.store.all_snapshots().unwrap();
    assert!(snapshots.iter().any(|s| s.model_id == "__ensemble_main__"));

    // ...but only the two real models appear in the emission.
    let checkpoint = harness
        .checkpoints
        .build_once(t0() + ChronoDuration::seconds(300))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.emission.cruncher_rewards.len(), 2);
    assert_eq!(
        checkpoint.emission.cruncher_rewards[0].reward_pct
            + checkpoint.emission.cruncher_rewards[1].reward_pct,
        FRAC64_MULTIPLIER
    );
    let ranking = checkpoint.meta["ranking"].as_array().unwrap();
    assert!(ranking
        .iter()
        .all(|entry| entry["model_id"] != serde_json::json!("__ensemble_main__")));
}
