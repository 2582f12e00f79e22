// Copyright (c) 2024 Botho Foundation

//! The stabilization engine.
//!
//! [`ConsensusContext`] ties the pipeline together. Block producers use
//! [`ConsensusContext::prepare_block_template`] to append the stabilization
//! transactions their state requires; every node then runs
//! [`ConsensusContext::connect_block`], which recomputes the same set and
//! rejects the block on any difference.
//!
//! Oracle reads are anchored at the block height: measurements carried by a
//! block become visible to the blocks after it, so callers record them with
//! [`CommittedMeasurements::record_block`] once the block is connected.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::consensus::{consensus_hash, ConsensusError, ConsensusValidator, ValidatorStats};
use crate::currency::{CurrencyCode, CurrencyStabilityInfo};
use crate::evaluator::{StabilityCounts, StabilityEvaluator};
use crate::identity::IdentityRegistry;
use crate::ledger::{
    AuditLedger, BlockUndo, LedgerApplier, MintStats, StabilizationRecord, UtxoView,
};
use crate::mint::CoinMintCalculator;
use crate::oracle::{CommittedMeasurements, MeasurementOracle};
use crate::params::StabilizationParams;
use crate::selector::RecipientSelector;
use crate::synthesizer::TransactionSynthesizer;
use crate::transaction::{Transaction, TxHash};

/// Mutable consensus state, always changed together.
#[derive(Debug, Clone)]
struct EngineState {
    evaluator: StabilityEvaluator,
    applier: LedgerApplier,
}

impl EngineState {
    fn new(params: &StabilizationParams) -> Self {
        Self {
            evaluator: StabilityEvaluator::new(params.clone()),
            applier: LedgerApplier::new(params.clone()),
        }
    }
}

/// Explicit engine context. One per chain.
pub struct ConsensusContext {
    params: StabilizationParams,
    registry: Arc<dyn IdentityRegistry>,
    calculator: CoinMintCalculator,
    selector: RecipientSelector,
    synthesizer: TransactionSynthesizer,
    validator: ConsensusValidator,
    state: Mutex<EngineState>,
}

impl ConsensusContext {
    pub fn new(params: StabilizationParams, registry: Arc<dyn IdentityRegistry>) -> Self {
        Self {
            calculator: CoinMintCalculator::new(params.clone()),
            selector: RecipientSelector::new(),
            synthesizer: TransactionSynthesizer::new(params.clone()),
            validator: ConsensusValidator::new(params.clone()),
            state: Mutex::new(EngineState::new(&params)),
            params,
            registry,
        }
    }

    pub fn params(&self) -> &StabilizationParams {
        &self.params
    }

    /// Record one direct observation of `currency` at `height`.
    pub fn evaluate(
        &self,
        currency: &CurrencyCode,
        observed_water_price: f64,
        observed_exchange_rate: Option<f64>,
        height: u64,
    ) -> CurrencyStabilityInfo {
        self.state
            .lock()
            .evaluator
            .evaluate(currency, observed_water_price, observed_exchange_rate, height)
    }

    /// Re-evaluate every currency from `oracle` at `height`. Returns the
    /// number of status changes.
    pub fn reevaluate_all(&self, oracle: &dyn MeasurementOracle, height: u64) -> usize {
        self.state.lock().evaluator.reevaluate_all(oracle, height)
    }

    pub fn mark_inactive(&self, currency: &CurrencyCode, height: u64) {
        self.state.lock().evaluator.mark_inactive(currency, height);
    }

    pub fn should_trigger(&self, height: u64) -> bool {
        self.state.lock().evaluator.should_trigger(height)
    }

    /// Stabilization transactions a block at `height` must carry, from the
    /// current stability state.
    pub fn build_expected_stabilization_transactions(
        &self,
        block: &Block,
        height: u64,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let state = self.state.lock();
        self.expected_transactions(&state.evaluator, block, height)
    }

    /// Validate `block` against the current stability state.
    pub fn validate_stabilization_transactions(
        &self,
        block: &Block,
        height: u64,
    ) -> Result<(), ConsensusError> {
        let state = self.state.lock();
        let expected = self.expected_transactions(&state.evaluator, block, height)?;
        self.validator
            .validate_block(block, height, state.evaluator.should_trigger(height), &expected)
    }

    /// Insert accepted stabilization outputs into `view`.
    pub fn apply_stabilization_outputs(
        &self,
        transactions: &[Transaction],
        view: &mut dyn UtxoView,
        height: u64,
        timestamp: u64,
    ) -> Result<BlockUndo, ConsensusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut undo = state
            .applier
            .apply(transactions, view, height, timestamp, &state.evaluator)?;
        undo.prior_stability = state.evaluator.all().clone();
        Ok(undo)
    }

    /// Append the stabilization transactions the next block must carry.
    ///
    /// Nothing is committed: the evaluation for the block height runs on a
    /// copy of the stability state.
    pub fn prepare_block_template(
        &self,
        template: &Block,
        oracle: &dyn MeasurementOracle,
    ) -> Result<Block, ConsensusError> {
        let height = template.height();
        let evaluator = self.working_evaluator(oracle, height);

        let expected = self.expected_transactions(&evaluator, template, height)?;
        if !expected.is_empty() {
            info!(
                height,
                transactions = expected.len(),
                "Adding stabilization transactions to block template"
            );
        }
        Ok(template.with_transactions(expected))
    }

    /// Evaluate, validate and apply `block`.
    ///
    /// On error the engine state and `view` are left untouched.
    pub fn connect_block(
        &self,
        block: &Block,
        view: &mut dyn UtxoView,
        oracle: &dyn MeasurementOracle,
    ) -> Result<BlockUndo, ConsensusError> {
        let height = block.height();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let prior_stability = state.evaluator.all().clone();
        let mut evaluator = state.evaluator.clone();
        evaluator.reevaluate_all(oracle, height);

        let expected = self.expected_transactions(&evaluator, block, height)?;
        let transactions: Vec<Transaction> =
            block.stabilization_transactions().into_iter().cloned().collect();

        // Stats reflect the final outcome, including ledger failures
        let applied = self
            .validator
            .check_block(block, height, evaluator.should_trigger(height), &expected)
            .and_then(|()| {
                state.applier.apply(
                    &transactions,
                    view,
                    height,
                    block.header.timestamp,
                    &evaluator,
                )
            });
        self.validator.record_outcome(block, height, applied.as_ref().map(|_| ()));

        let mut undo = applied?;
        undo.prior_stability = prior_stability;

        state.evaluator = evaluator;

        debug!(
            height,
            block = hex::encode(&block.hash()[0..8]),
            stabilization = transactions.len(),
            "Connected block"
        );
        Ok(undo)
    }

    /// Reverse [`connect_block`](Self::connect_block). Blocks must be
    /// disconnected tip first.
    pub fn disconnect_block(
        &self,
        undo: &BlockUndo,
        view: &mut dyn UtxoView,
    ) -> Result<(), ConsensusError> {
        let mut state = self.state.lock();
        state.applier.undo(undo, view)?;
        state.evaluator.restore(undo.prior_stability.clone());

        info!(height = undo.height, "Disconnected block");
        Ok(())
    }

    /// Reset and replay `blocks` in order.
    ///
    /// `view` must hold the UTXO set as of before the first block; `oracle`
    /// is cleared and refilled from the blocks' measurements.
    pub fn rebuild_from_chain(
        &self,
        blocks: &[Block],
        view: &mut dyn UtxoView,
        oracle: &mut CommittedMeasurements,
    ) -> Result<Vec<BlockUndo>, ConsensusError> {
        *self.state.lock() = EngineState::new(&self.params);
        *oracle = CommittedMeasurements::new();

        let mut undos = Vec::with_capacity(blocks.len());
        for block in blocks {
            undos.push(self.connect_block(block, view, &*oracle)?);
            oracle.record_block(block);
        }

        info!(blocks = blocks.len(), "Rebuilt stabilization state from chain");
        Ok(undos)
    }

    /// Digest of this node's stabilization decision for `block`, evaluated
    /// at the block height without committing anything.
    pub fn consensus_hash(
        &self,
        block: &Block,
        oracle: &dyn MeasurementOracle,
    ) -> Result<[u8; 32], ConsensusError> {
        let height = block.height();
        let evaluator = self.working_evaluator(oracle, height);
        let expected = self.expected_transactions(&evaluator, block, height)?;
        Ok(consensus_hash(block, height, &evaluator, &expected))
    }

    /// Copy of the stability state evaluated at `height`.
    fn working_evaluator(&self, oracle: &dyn MeasurementOracle, height: u64) -> StabilityEvaluator {
        let mut evaluator = self.state.lock().evaluator.clone();
        evaluator.reevaluate_all(oracle, height);
        evaluator
    }

    fn expected_transactions(
        &self,
        stability: &StabilityEvaluator,
        block: &Block,
        height: u64,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let mut transactions = Vec::new();

        for currency in stability.unstable_currencies() {
            let Some(info) = stability.status(&currency) else {
                continue;
            };
            let Some(plan) = self.calculator.calculate_mint(info, block, height) else {
                continue;
            };

            let recipients = self.selector.select_recipients(
                self.registry.as_ref(),
                stability,
                plan.recipient_count,
                &currency,
                &block.header.prev_block_hash,
            );
            if recipients.is_empty() {
                warn!(currency = %currency, height, "No eligible recipients, skipping mint");
                continue;
            }

            let total = self
                .calculator
                .finalize_total(plan.total_coins, recipients.len() as u64);
            transactions.push(self.synthesizer.build_mint_transaction(
                &currency,
                height,
                total,
                &recipients,
            )?);
        }

        Ok(transactions)
    }

    /// Load persisted state at startup.
    pub fn restore(
        &self,
        stability: BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
        records: impl IntoIterator<Item = StabilizationRecord>,
        stats: MintStats,
    ) {
        let mut state = self.state.lock();
        state.evaluator.restore(stability);
        state.applier =
            LedgerApplier::with_audit(self.params.clone(), AuditLedger::restore(records, stats));
    }

    pub fn stability_snapshot(&self) -> BTreeMap<CurrencyCode, CurrencyStabilityInfo> {
        self.state.lock().evaluator.all().clone()
    }

    pub fn status(&self, currency: &CurrencyCode) -> Option<CurrencyStabilityInfo> {
        self.state.lock().evaluator.status(currency).cloned()
    }

    pub fn stability_counts(&self) -> StabilityCounts {
        self.state.lock().evaluator.counts()
    }

    /// Audit records for `currency` with `start <= height <= end`.
    pub fn history(
        &self,
        currency: &CurrencyCode,
        start: u64,
        end: u64,
    ) -> Vec<StabilizationRecord> {
        self.state.lock().applier.audit().history(currency, start, end)
    }

    pub fn record(&self, tx_id: &TxHash) -> Option<StabilizationRecord> {
        self.state.lock().applier.audit().get(tx_id).cloned()
    }

    pub fn mint_stats(&self) -> MintStats {
        self.state.lock().applier.audit().stats().clone()
    }

    pub fn total_created(&self, currency: &CurrencyCode) -> u64 {
        self.state.lock().applier.audit().total_created(currency)
    }

    pub fn validator_stats(&self) -> ValidatorStats {
        self.validator.stats()
    }

    /// Drop audit records below `cutoff`. Returns how many were removed.
    pub fn prune_history(&self, cutoff: u64) -> usize {
        self.state.lock().applier.audit_mut().prune(cutoff)
    }
}
