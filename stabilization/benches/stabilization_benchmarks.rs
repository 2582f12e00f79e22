// Copyright (c) 2024 Botho Foundation

//! Benchmarks for the stabilization pipeline.
//!
//! Run with: cargo bench -p o-stabilization --bench stabilization_benchmarks
//!
//! These benchmarks measure the performance of:
//! - Recipient sampling over large pools
//! - Mint transaction synthesis at the recipient limit
//! - Block validation by recomputation

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use o_stabilization::identity::{IdentityKey, IdentitySet};
use o_stabilization::ledger::CoinsCache;
use o_stabilization::oracle::{CommittedMeasurements, Measurement};
use o_stabilization::selector::sample;
use o_stabilization::transaction::{TxInput, TxOutput, UtxoId};
use o_stabilization::{
    Block, ConsensusContext, CurrencyCode, StabilizationParams, Transaction,
    TransactionSynthesizer,
};

fn code(s: &str) -> CurrencyCode {
    s.parse().unwrap()
}

fn key(i: u32) -> IdentityKey {
    let mut bytes = [0u8; 32];
    bytes[0..4].copy_from_slice(&i.to_be_bytes());
    IdentityKey(bytes)
}

/// Benchmark sampling 24 and 5,000 recipients from growing pools
fn bench_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample");
    let usd = code("OUSD");
    let seed = [7u8; 32];

    for pool_size in [1_000u32, 10_000, 100_000] {
        let pool: Vec<IdentityKey> = (0..pool_size).map(key).collect();
        for count in [24u64, 5_000] {
            group.bench_with_input(
                BenchmarkId::new(format!("{}_of", count), pool_size),
                &pool,
                |b, pool| b.iter(|| black_box(sample(pool.clone(), count, &usd, &seed))),
            );
        }
    }
    group.finish();
}

/// Benchmark building a mint transaction at the recipient limit
fn bench_synthesize(c: &mut Criterion) {
    let synthesizer = TransactionSynthesizer::new(StabilizationParams::default());
    let recipients: Vec<IdentityKey> = (0..50_000).map(key).collect();
    let usd = code("OUSD");

    c.bench_function("build_mint_transaction 50000 outputs", |b| {
        b.iter(|| {
            black_box(
                synthesizer
                    .build_mint_transaction(&usd, 1, 250_000_000, &recipients)
                    .unwrap(),
            )
        })
    });
}

fn measurements() -> Vec<Measurement> {
    ["OEUR", "OUSD"]
        .iter()
        .zip([1.0, 1.23])
        .map(|(c, price)| Measurement {
            currency: code(c),
            water_price: Some(price),
            exchange_rate: Some(1.0),
        })
        .collect()
}

fn transfer(height: u64) -> Transaction {
    Transaction::transfer(
        vec![TxInput {
            prev_out: UtxoId::new([height as u8; 32], 0),
        }],
        vec![TxOutput {
            amount: 1_449_279,
            currency: code("OUSD"),
            recipient: IdentityKey([0xee; 32]),
        }],
    )
}

/// Benchmark recomputing and validating a block carrying a mint
fn bench_validate_block(c: &mut Criterion) {
    let mut registry = IdentitySet::new();
    for i in 0..10_000 {
        registry.insert(key(i), code("OEUR"));
    }
    let context = ConsensusContext::new(StabilizationParams::fast_test(), Arc::new(registry));

    let mut view = CoinsCache::new();
    let mut oracle = CommittedMeasurements::new();
    let mut prev = [0u8; 32];
    for height in 1..=10 {
        let template = Block::new(
            prev,
            height,
            height * 600,
            vec![transfer(height)],
            measurements(),
        );
        let block = context.prepare_block_template(&template, &oracle).unwrap();
        context.connect_block(&block, &mut view, &oracle).unwrap();
        oracle.record_block(&block);
        prev = block.hash();
    }

    let template = Block::new(prev, 11, 6_600, vec![transfer(11)], measurements());
    let block = context.prepare_block_template(&template, &oracle).unwrap();
    context.reevaluate_all(&oracle, 11);

    c.bench_function("validate_stabilization_transactions", |b| {
        b.iter(|| black_box(context.validate_stabilization_transactions(&block, 11).unwrap()))
    });
}

criterion_group!(benches, bench_sample, bench_synthesize, bench_validate_block);

criterion_main!(benches);
