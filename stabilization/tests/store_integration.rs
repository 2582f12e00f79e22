// Copyright (c) 2024 Botho Foundation
//
//! Store Integration Tests
//!
//! Persists a running chain to LMDB and checks that:
//! - A reopened store restores the exact engine state
//! - Reverting the tip keeps store and engine in step
//! - Replaying the chain reproduces what was stored

mod common;

use common::*;

use serial_test::serial;
use tempfile::TempDir;

use o_stabilization::ledger::{CoinsCache, StabilizationStore};
use o_stabilization::oracle::CommittedMeasurements;
use o_stabilization::{ConsensusContext, StabilizationParams};

fn drifting() -> Vec<o_stabilization::oracle::Measurement> {
    vec![quote(&eur(), 1.0), quote(&usd(), 1.25)]
}

fn new_chain() -> TestChain {
    TestChain::new(StabilizationParams::fast_test(), registry(&[eur(), usd()], 6))
}

/// Mine `count` blocks, committing each to `store`.
fn mine_and_commit(chain: &mut TestChain, store: &StabilizationStore, count: u64) {
    for _ in 0..count {
        let block = chain.mine(drifting(), 120_000);
        let undo = chain.undos.last().unwrap();
        let records: Vec<_> = undo
            .records
            .iter()
            .filter_map(|tx_id| chain.context.record(tx_id))
            .collect();
        store
            .commit_block(
                &block.hash(),
                undo,
                &chain.context.stability_snapshot(),
                &records,
                &chain.view.take_changes(),
                &chain.context.mint_stats(),
            )
            .unwrap();
    }
}

#[test]
#[serial]
fn test_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let mut chain = new_chain();
    {
        let store = StabilizationStore::open(temp_dir.path()).unwrap();
        mine_and_commit(&mut chain, &store, 12);
    }

    let store = StabilizationStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.tip_height().unwrap(), Some(12));
    assert_eq!(store.tip_hash().unwrap(), Some(chain.tip_hash));
    assert_eq!(store.stability_map().unwrap(), chain.context.stability_snapshot());
    assert_eq!(store.mint_stats().unwrap(), chain.context.mint_stats());
    assert_eq!(store.coins().unwrap().len(), chain.view.len());
    assert_eq!(
        store.history(&usd(), 0, u64::MAX).unwrap(),
        chain.context.history(&usd(), 0, u64::MAX)
    );

    // A fresh engine restored from disk continues the same chain
    let restored = ConsensusContext::new(
        StabilizationParams::fast_test(),
        registry(&[eur(), usd()], 6),
    );
    restored.restore(
        store.stability_map().unwrap(),
        store.records().unwrap(),
        store.mint_stats().unwrap(),
    );
    let mut view = CoinsCache::from_coins(store.coins().unwrap());

    let next = chain.produce(drifting(), 120_000);
    assert!(next.has_stabilization());
    restored.connect_block(&next, &mut view, &chain.oracle).unwrap();
    chain.connect(&next).unwrap();

    assert_eq!(restored.stability_snapshot(), chain.context.stability_snapshot());
    assert_eq!(restored.mint_stats(), chain.context.mint_stats());
    assert_eq!(view.len(), chain.view.len());
}

#[test]
#[serial]
fn test_revert_tip_in_store() {
    let temp_dir = TempDir::new().unwrap();
    let store = StabilizationStore::open(temp_dir.path()).unwrap();
    let mut chain = new_chain();
    mine_and_commit(&mut chain, &store, 10);

    let undo = store.undo(10).unwrap();
    assert_eq!(&undo, chain.undos.last().unwrap());

    let tip = chain.disconnect_tip();
    store
        .revert_block(
            &undo,
            &tip.header.prev_block_hash,
            &chain.context.stability_snapshot(),
            &chain.view.take_changes(),
            &chain.context.mint_stats(),
        )
        .unwrap();

    assert_eq!(store.tip_height().unwrap(), Some(9));
    assert_eq!(store.tip_hash().unwrap(), Some(chain.tip_hash));
    assert_eq!(store.stability_map().unwrap(), chain.context.stability_snapshot());
    assert_eq!(store.mint_stats().unwrap(), chain.context.mint_stats());
    assert_eq!(store.coins().unwrap().len(), chain.view.len());
    assert!(store.history(&usd(), 10, 10).unwrap().is_empty());
    assert!(!store.history(&usd(), 9, 9).unwrap().is_empty());
}

#[test]
#[serial]
fn test_rebuild_matches_store() {
    let temp_dir = TempDir::new().unwrap();
    let store = StabilizationStore::open(temp_dir.path()).unwrap();
    let mut chain = new_chain();
    mine_and_commit(&mut chain, &store, 15);

    let replayed = ConsensusContext::new(
        StabilizationParams::fast_test(),
        registry(&[eur(), usd()], 6),
    );
    let mut view = CoinsCache::new();
    let mut oracle = CommittedMeasurements::new();
    let undos = replayed
        .rebuild_from_chain(&chain.blocks, &mut view, &mut oracle)
        .unwrap();

    assert_eq!(undos.last(), Some(&store.undo(15).unwrap()));
    assert_eq!(replayed.stability_snapshot(), store.stability_map().unwrap());
    assert_eq!(replayed.mint_stats(), store.mint_stats().unwrap());

    let stored: Vec<_> = store.coins().unwrap();
    let rebuilt: Vec<_> = view.iter().map(|(id, coin)| (*id, coin.clone())).collect();
    assert_eq!(stored, rebuilt);
}

#[test]
#[serial]
fn test_prune_keeps_totals() {
    let temp_dir = TempDir::new().unwrap();
    let store = StabilizationStore::open(temp_dir.path()).unwrap();
    let mut chain = new_chain();
    mine_and_commit(&mut chain, &store, 12);

    let before = store.mint_stats().unwrap();
    let pruned = store.prune(11).unwrap();
    assert_eq!(pruned, chain.context.prune_history(11));
    assert!(pruned > 0);

    assert_eq!(store.mint_stats().unwrap(), before);
    assert_eq!(store.history(&usd(), 0, 10).unwrap().len(), 0);
    assert_eq!(
        store.history(&usd(), 0, u64::MAX).unwrap(),
        chain.context.history(&usd(), 0, u64::MAX)
    );
    assert!(store.undo(10).is_err());
    assert!(store.undo(11).is_ok());
}
