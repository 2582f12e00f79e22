// Copyright (c) 2024 Botho Foundation
//
//! Common test utilities for stabilization integration tests.
//!
//! [`TestChain`] produces and connects blocks through a [`ConsensusContext`]
//! the way a mining node would, keeping the UTXO view and committed
//! measurements alongside.

#![allow(dead_code)]

use std::sync::Arc;

use sha2::{Digest, Sha256};

use o_stabilization::consensus::ConsensusError;
use o_stabilization::identity::{IdentityKey, IdentityRegistry, IdentitySet};
use o_stabilization::ledger::{BlockUndo, CoinsCache};
use o_stabilization::oracle::{CommittedMeasurements, Measurement};
use o_stabilization::transaction::{TxInput, TxOutput, UtxoId};
use o_stabilization::{Block, ConsensusContext, CurrencyCode, StabilizationParams, Transaction};

/// Seconds between test blocks
pub const BLOCK_INTERVAL: u64 = 600;

/// Receiver of every synthetic transfer; never a registered identity
pub const MERCHANT: IdentityKey = IdentityKey([0xee; 32]);

pub fn code(s: &str) -> CurrencyCode {
    s.parse().expect("valid currency code")
}

pub fn usd() -> CurrencyCode {
    code("OUSD")
}

pub fn eur() -> CurrencyCode {
    code("OEUR")
}

pub fn gbp() -> CurrencyCode {
    code("OGBP")
}

/// Deterministic identity key for user `index` of `currency`.
pub fn identity(currency: &CurrencyCode, index: u32) -> IdentityKey {
    let mut hasher = Sha256::new();
    hasher.update(b"test-identity");
    hasher.update(currency.as_str().as_bytes());
    hasher.update(index.to_le_bytes());
    IdentityKey(hasher.finalize().into())
}

/// Registry with `per_currency` verified users in each of `currencies`.
pub fn registry(currencies: &[CurrencyCode], per_currency: u32) -> Arc<dyn IdentityRegistry> {
    let mut set = IdentitySet::new();
    for currency in currencies {
        for index in 0..per_currency {
            set.insert(identity(currency, index), currency.clone());
        }
    }
    Arc::new(set)
}

/// Water price and exchange-rate observation.
pub fn quote(currency: &CurrencyCode, water_price: f64) -> Measurement {
    Measurement {
        currency: currency.clone(),
        water_price: Some(water_price),
        exchange_rate: Some(1.0),
    }
}

/// Water price only, no exchange rate reported.
pub fn price_only(currency: &CurrencyCode, water_price: f64) -> Measurement {
    Measurement {
        currency: currency.clone(),
        water_price: Some(water_price),
        exchange_rate: None,
    }
}

/// A transfer of `amount` in `currency` to the merchant.
pub fn transfer(currency: &CurrencyCode, amount: u64, height: u64) -> Transaction {
    let mut hasher = Sha256::new();
    hasher.update(b"test-funding");
    hasher.update(currency.as_str().as_bytes());
    hasher.update(height.to_le_bytes());

    Transaction::transfer(
        vec![TxInput {
            prev_out: UtxoId::new(hasher.finalize().into(), 0),
        }],
        vec![TxOutput {
            amount,
            currency: currency.clone(),
            recipient: MERCHANT,
        }],
    )
}

/// A chain driven through one engine.
pub struct TestChain {
    pub context: ConsensusContext,
    pub view: CoinsCache,
    pub oracle: CommittedMeasurements,
    pub tip_hash: [u8; 32],
    pub blocks: Vec<Block>,
    pub undos: Vec<BlockUndo>,
}

impl TestChain {
    pub fn new(params: StabilizationParams, registry: Arc<dyn IdentityRegistry>) -> Self {
        Self {
            context: ConsensusContext::new(params, registry),
            view: CoinsCache::new(),
            oracle: CommittedMeasurements::new(),
            tip_hash: [0u8; 32],
            blocks: Vec::new(),
            undos: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Next block without stabilization: one transfer of `volume` in every
    /// measured currency.
    pub fn template(&self, measurements: Vec<Measurement>, volume: u64) -> Block {
        let height = self.height() + 1;
        let transfers = measurements
            .iter()
            .map(|m| transfer(&m.currency, volume, height))
            .collect();
        Block::new(
            self.tip_hash,
            height,
            height * BLOCK_INTERVAL,
            transfers,
            measurements,
        )
    }

    /// Build the next block with the stabilization the engine requires.
    pub fn produce(&self, measurements: Vec<Measurement>, volume: u64) -> Block {
        self.context
            .prepare_block_template(&self.template(measurements, volume), &self.oracle)
            .expect("template")
    }

    /// Produce and connect the next block.
    pub fn mine(&mut self, measurements: Vec<Measurement>, volume: u64) -> Block {
        let block = self.produce(measurements, volume);
        self.connect(&block).expect("own block must connect");
        block
    }

    /// Mine `count` blocks with the same measurements.
    pub fn mine_many(&mut self, count: u64, measurements: &[Measurement], volume: u64) {
        for _ in 0..count {
            self.mine(measurements.to_vec(), volume);
        }
    }

    pub fn connect(&mut self, block: &Block) -> Result<(), ConsensusError> {
        let undo = self.context.connect_block(block, &mut self.view, &self.oracle)?;
        self.oracle.record_block(block);
        self.tip_hash = block.hash();
        self.blocks.push(block.clone());
        self.undos.push(undo);
        Ok(())
    }

    pub fn disconnect_tip(&mut self) -> Block {
        let block = self.blocks.pop().expect("chain is empty");
        let undo = self.undos.pop().expect("undo for tip");
        self.context
            .disconnect_block(&undo, &mut self.view)
            .expect("disconnect");
        self.oracle.remove_height(block.height());
        self.tip_hash = block.header.prev_block_hash;
        block
    }
}
