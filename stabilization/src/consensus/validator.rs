// Copyright (c) 2024 Botho Foundation

//! Block validation by recomputation.
//!
//! The validator never trusts the stabilization transactions a block
//! carries. The caller recomputes the expected set from its own state and
//! the validator compares:
//!
//! | should trigger | block has stabilization | outcome                  |
//! |----------------|-------------------------|--------------------------|
//! | no             | no                      | accept                   |
//! | no             | yes                     | reject: unexpected       |
//! | yes            | no                      | reject: missing          |
//! | yes            | yes                     | compare with expectation |
//!
//! A triggered height whose recomputed set is empty (for example, no
//! eligible recipients) accepts a block without stabilization.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{ConsensusError, MismatchError};
use crate::block::Block;
use crate::currency::CurrencyCode;
use crate::evaluator::StabilityEvaluator;
use crate::ledger::check_stabilization_transaction;
use crate::params::StabilizationParams;
use crate::transaction::Transaction;

/// Observability counters. Not consensus state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub blocks_validated: u64,
    pub blocks_with_stabilization: u64,
    pub transactions_validated: u64,
    pub consensus_violations: u64,
    pub stabilizations_by_currency: BTreeMap<CurrencyCode, u64>,
}

/// Compares block contents against the recomputed stabilization set.
#[derive(Debug)]
pub struct ConsensusValidator {
    params: StabilizationParams,
    stats: Mutex<ValidatorStats>,
}

impl ConsensusValidator {
    pub fn new(params: StabilizationParams) -> Self {
        Self {
            params,
            stats: Mutex::new(ValidatorStats::default()),
        }
    }

    /// Validate the stabilization contents of `block` at `height` and count
    /// the outcome.
    ///
    /// `should_trigger` and `expected` come from the caller's own state.
    pub fn validate_block(
        &self,
        block: &Block,
        height: u64,
        should_trigger: bool,
        expected: &[Transaction],
    ) -> Result<(), ConsensusError> {
        let result = self.check_block(block, height, should_trigger, expected);
        self.record_outcome(block, height, result.as_ref().map(|_| ()));
        result
    }

    /// [`validate_block`](Self::validate_block) without touching the stats.
    /// Callers that apply the block afterwards report the final outcome with
    /// [`record_outcome`](Self::record_outcome).
    pub fn check_block(
        &self,
        block: &Block,
        height: u64,
        should_trigger: bool,
        expected: &[Transaction],
    ) -> Result<(), ConsensusError> {
        self.check(&block.stabilization_transactions(), height, should_trigger, expected)
    }

    /// Count a block as accepted or rejected.
    pub fn record_outcome(&self, block: &Block, height: u64, result: Result<(), &ConsensusError>) {
        let actual = block.stabilization_transactions();

        let mut stats = self.stats.lock();
        stats.blocks_validated += 1;
        match result {
            Ok(()) => {
                if !actual.is_empty() {
                    stats.blocks_with_stabilization += 1;
                    stats.transactions_validated += actual.len() as u64;
                    for currency in actual.iter().filter_map(|tx| tx.stabilization_currency()) {
                        *stats
                            .stabilizations_by_currency
                            .entry(currency.clone())
                            .or_default() += 1;
                    }
                }
                debug!(height, transactions = actual.len(), "Stabilization contents valid");
            }
            Err(e) => {
                stats.consensus_violations += 1;
                warn!(
                    height,
                    block = hex::encode(&block.hash()[0..8]),
                    reason = e.reject_reason(),
                    "Rejecting block: {}",
                    e
                );
            }
        }
    }

    fn check(
        &self,
        actual: &[&Transaction],
        height: u64,
        should_trigger: bool,
        expected: &[Transaction],
    ) -> Result<(), ConsensusError> {
        // Structure and bounds first, so a malformed mint is always reported as such
        for (index, tx) in actual.iter().enumerate() {
            check_stabilization_transaction(index, tx, &self.params, Some(height))?;
        }

        match (should_trigger, actual.is_empty()) {
            (false, true) => Ok(()),
            (false, false) => Err(MismatchError::Unexpected.into()),
            (true, true) if expected.is_empty() => Ok(()),
            (true, true) => Err(MismatchError::Missing.into()),
            (true, false) => compare(expected, actual).map_err(ConsensusError::from),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ValidatorStats {
        self.stats.lock().clone()
    }
}

/// Compare by count, then hash, then per-output value.
pub fn compare(expected: &[Transaction], actual: &[&Transaction]) -> Result<(), MismatchError> {
    if expected.len() != actual.len() {
        return Err(MismatchError::Count {
            expected: expected.len(),
            got: actual.len(),
        });
    }

    for (index, (want, got)) in expected.iter().zip(actual.iter()).enumerate() {
        let want_hash = want.hash();
        let got_hash = got.hash();
        if want_hash == got_hash {
            continue;
        }

        // Pinpoint the difference for the rejection message
        if want.outputs.len() != got.outputs.len() {
            return Err(MismatchError::OutputCount {
                index,
                expected: want.outputs.len(),
                got: got.outputs.len(),
            });
        }
        for (output, (w, g)) in want.outputs.iter().zip(got.outputs.iter()).enumerate() {
            if w.amount != g.amount {
                return Err(MismatchError::OutputValue {
                    index,
                    output,
                    expected: w.amount,
                    got: g.amount,
                });
            }
        }
        return Err(MismatchError::TxHash {
            index,
            expected: hex::encode(want_hash),
            got: hex::encode(got_hash),
        });
    }

    Ok(())
}

/// Digest of everything a node's stabilization decision for a block rests on.
///
/// Two nodes agree on a block's stabilization exactly when their hashes
/// match, which makes this a cheap cross-node comparison.
pub fn consensus_hash(
    block: &Block,
    height: u64,
    stability: &StabilityEvaluator,
    expected: &[Transaction],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"O_STABILIZATION_CONSENSUS_V1");
    hasher.update(block.header.prev_block_hash);
    hasher.update(height.to_le_bytes());

    for info in stability.all().values().filter(|info| info.status.is_unstable()) {
        hasher.update(info.currency.to_hash_bytes());
        hasher.update(info.ratio_ppm().to_le_bytes());
        hasher.update(info.unstable_since_height().to_le_bytes());
    }

    hasher.update((expected.len() as u64).to_le_bytes());
    for tx in expected {
        hasher.update(tx.hash());
    }

    hasher.finalize().into()
}
