// Copyright (c) 2024 Botho Foundation

//! Applying stabilization mints to the UTXO set.
//!
//! A block's stabilization transactions are applied as a unit. Every
//! transaction is checked before anything is written, so a single bad
//! transaction leaves both the UTXO view and the audit ledger untouched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::{describe, Coin, LedgerError, UtxoView};
use crate::consensus::{BoundsError, ConsensusError, StructuralError};
use crate::currency::{CurrencyCode, CurrencyStabilityInfo};
use crate::evaluator::StabilityEvaluator;
use crate::identity::IdentityKey;
use crate::params::StabilizationParams;
use crate::transaction::{Transaction, TransactionKind, TxHash, UtxoId};

/// Audit entry for one stabilization transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilizationRecord {
    pub tx_id: TxHash,
    pub unstable_currency: CurrencyCode,
    pub coins_created: u64,
    pub recipients: Vec<IdentityKey>,
    pub block_height: u64,
    /// Block timestamp
    pub timestamp: u64,
    pub deviation_ratio_ppm: u64,
}

/// Running totals over all recorded mints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintStats {
    pub total_coins_created: u64,
    pub total_transactions: u64,
    pub total_recipients: u64,
    pub coins_by_currency: BTreeMap<CurrencyCode, u64>,
}

impl MintStats {
    fn add(&mut self, record: &StabilizationRecord) {
        self.total_coins_created = self.total_coins_created.saturating_add(record.coins_created);
        self.total_transactions += 1;
        self.total_recipients += record.recipients.len() as u64;
        let entry = self
            .coins_by_currency
            .entry(record.unstable_currency.clone())
            .or_default();
        *entry = entry.saturating_add(record.coins_created);
    }

    fn subtract(&mut self, record: &StabilizationRecord) {
        self.total_coins_created = self.total_coins_created.saturating_sub(record.coins_created);
        self.total_transactions = self.total_transactions.saturating_sub(1);
        self.total_recipients = self
            .total_recipients
            .saturating_sub(record.recipients.len() as u64);
        if let Some(entry) = self.coins_by_currency.get_mut(&record.unstable_currency) {
            *entry = entry.saturating_sub(record.coins_created);
            if *entry == 0 {
                self.coins_by_currency.remove(&record.unstable_currency);
            }
        }
    }
}

/// History of stabilization mints, indexed by tx id and by (currency, height).
#[derive(Debug, Clone, Default)]
pub struct AuditLedger {
    records: BTreeMap<TxHash, StabilizationRecord>,
    by_currency: BTreeSet<(CurrencyCode, u64, TxHash)>,
    stats: MintStats,
}

impl AuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored records and totals.
    pub fn restore(
        records: impl IntoIterator<Item = StabilizationRecord>,
        stats: MintStats,
    ) -> Self {
        let mut ledger = Self {
            stats,
            ..Self::default()
        };
        for record in records {
            ledger.index(record);
        }
        ledger
    }

    fn index(&mut self, record: StabilizationRecord) {
        self.by_currency.insert((
            record.unstable_currency.clone(),
            record.block_height,
            record.tx_id,
        ));
        self.records.insert(record.tx_id, record);
    }

    pub fn record(&mut self, record: StabilizationRecord) {
        self.stats.add(&record);
        self.index(record);
    }

    /// Remove a record and take it out of the totals.
    pub fn remove(&mut self, tx_id: &TxHash) -> Option<StabilizationRecord> {
        let record = self.records.remove(tx_id)?;
        self.by_currency.remove(&(
            record.unstable_currency.clone(),
            record.block_height,
            record.tx_id,
        ));
        self.stats.subtract(&record);
        Some(record)
    }

    pub fn get(&self, tx_id: &TxHash) -> Option<&StabilizationRecord> {
        self.records.get(tx_id)
    }

    /// Records for `currency` with `start <= height <= end`, oldest first.
    pub fn history(
        &self,
        currency: &CurrencyCode,
        start: u64,
        end: u64,
    ) -> Vec<StabilizationRecord> {
        if start > end {
            return Vec::new();
        }
        let from = (currency.clone(), start, [0u8; 32]);
        let to = (currency.clone(), end, [0xffu8; 32]);
        self.by_currency
            .range(from..=to)
            .filter_map(|(_, _, tx_id)| self.records.get(tx_id).cloned())
            .collect()
    }

    pub fn total_created(&self, currency: &CurrencyCode) -> u64 {
        self.stats
            .coins_by_currency
            .get(currency)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> &MintStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &StabilizationRecord> {
        self.records.values()
    }

    /// Drop records below `cutoff`. Totals are kept.
    pub fn prune(&mut self, cutoff: u64) -> usize {
        let stale: Vec<TxHash> = self
            .records
            .values()
            .filter(|record| record.block_height < cutoff)
            .map(|record| record.tx_id)
            .collect();
        for tx_id in &stale {
            if let Some(record) = self.records.remove(tx_id) {
                self.by_currency
                    .remove(&(record.unstable_currency, record.block_height, record.tx_id));
            }
        }
        stale.len()
    }
}

/// Everything needed to reverse one block's stabilization effects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub height: u64,
    /// Stability map as it was before the block was connected
    pub prior_stability: BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
    /// Coins minted by the block, in insertion order
    pub created_coins: Vec<UtxoId>,
    /// Audit records added by the block
    pub records: Vec<TxHash>,
}

/// Structural and bounds checks for one stabilization transaction.
///
/// `index` is the position used in error messages. When `height` is given
/// the transaction must be tagged for that height.
pub fn check_stabilization_transaction(
    index: usize,
    tx: &Transaction,
    params: &StabilizationParams,
    height: Option<u64>,
) -> Result<(), ConsensusError> {
    // 1. Must be a stabilization transaction for this height
    let (currency, tx_height) = match &tx.kind {
        TransactionKind::Stabilization { currency, height } => (currency, *height),
        TransactionKind::Transfer => return Err(StructuralError::NotStabilization { index }.into()),
    };
    if let Some(expected) = height {
        if tx_height != expected {
            return Err(StructuralError::WrongHeight {
                index,
                expected,
                got: tx_height,
            }
            .into());
        }
    }

    // 2. Zero inputs
    if !tx.inputs.is_empty() {
        return Err(StructuralError::HasInputs {
            index,
            count: tx.inputs.len(),
        }
        .into());
    }

    // 3. At least one output, at most max_recipients
    if tx.outputs.is_empty() {
        return Err(StructuralError::NoOutputs { index }.into());
    }
    if tx.outputs.len() as u64 > params.max_recipients {
        return Err(BoundsError::RecipientCount {
            index,
            count: tx.outputs.len(),
            max: params.max_recipients,
        }
        .into());
    }

    // 4. Every output in the reward band, in the minted currency
    let mut recipients = BTreeSet::new();
    for (output_index, output) in tx.outputs.iter().enumerate() {
        if &output.currency != currency {
            return Err(StructuralError::WrongCurrency {
                index,
                output: output_index,
                currency: currency.clone(),
            }
            .into());
        }
        if output.amount < params.min_reward {
            return Err(BoundsError::OutputBelowMinimum {
                index,
                output: output_index,
                amount: output.amount,
                min: params.min_reward,
            }
            .into());
        }
        if output.amount > params.max_reward {
            return Err(BoundsError::OutputAboveMaximum {
                index,
                output: output_index,
                amount: output.amount,
                max: params.max_reward,
            }
            .into());
        }
        if !recipients.insert(output.recipient) {
            return Err(StructuralError::DuplicateRecipient {
                index,
                recipient: output.recipient.to_string(),
            }
            .into());
        }
    }

    // 5. Total within max_reward per output
    let total = tx.total_output();
    let max_total = params.max_reward.saturating_mul(tx.outputs.len() as u64);
    if total > max_total {
        return Err(BoundsError::TotalAboveMaximum {
            index,
            total,
            max: max_total,
        }
        .into());
    }

    Ok(())
}

/// Inserts minted outputs and keeps the audit ledger.
#[derive(Debug, Clone)]
pub struct LedgerApplier {
    params: StabilizationParams,
    audit: AuditLedger,
}

impl LedgerApplier {
    pub fn new(params: StabilizationParams) -> Self {
        Self {
            params,
            audit: AuditLedger::new(),
        }
    }

    pub fn with_audit(params: StabilizationParams, audit: AuditLedger) -> Self {
        Self { params, audit }
    }

    pub fn audit(&self) -> &AuditLedger {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLedger {
        &mut self.audit
    }

    /// Apply a block's stabilization transactions.
    ///
    /// Either every transaction is applied or none is. `stability` supplies
    /// the deviation recorded with each mint; `timestamp` is the block time.
    /// The returned undo has an empty `prior_stability`; the caller owns
    /// the stability map and fills it in.
    pub fn apply(
        &mut self,
        transactions: &[Transaction],
        view: &mut dyn UtxoView,
        height: u64,
        timestamp: u64,
        stability: &StabilityEvaluator,
    ) -> Result<BlockUndo, ConsensusError> {
        let mut undo = BlockUndo {
            height,
            ..BlockUndo::default()
        };

        // Check everything first
        let mut seen = BTreeSet::new();
        for (index, tx) in transactions.iter().enumerate() {
            check_stabilization_transaction(index, tx, &self.params, Some(height))?;

            let tx_hash = tx.hash();
            for output_index in 0..tx.outputs.len() {
                let id = UtxoId::new(tx_hash, output_index as u32);
                if !seen.insert(id) || view.have_coin(&id)? {
                    return Err(StructuralError::CoinExists(describe(&id)).into());
                }
            }
        }

        // Then write
        for tx in transactions {
            let tx_hash = tx.hash();
            for (output_index, output) in tx.outputs.iter().enumerate() {
                let id = UtxoId::new(tx_hash, output_index as u32);
                view.add_coin(
                    id,
                    Coin {
                        output: output.clone(),
                        height,
                        issuance: true,
                    },
                )?;
                undo.created_coins.push(id);
            }

            let Some(currency) = tx.stabilization_currency() else {
                continue;
            };
            let record = StabilizationRecord {
                tx_id: tx_hash,
                unstable_currency: currency.clone(),
                coins_created: tx.total_output(),
                recipients: tx.recipients(),
                block_height: height,
                timestamp,
                deviation_ratio_ppm: stability
                    .status(currency)
                    .map(|info| info.ratio_ppm())
                    .unwrap_or(0),
            };

            info!(
                currency = %currency,
                height,
                tx = hex::encode(&tx_hash[0..8]),
                coins = record.coins_created,
                recipients = record.recipients.len(),
                "Applied stabilization mint"
            );

            self.audit.record(record);
            undo.records.push(tx_hash);
        }

        Ok(undo)
    }

    /// Reverse [`apply`](Self::apply) for a disconnected block.
    pub fn undo(&mut self, undo: &BlockUndo, view: &mut dyn UtxoView) -> Result<(), LedgerError> {
        for id in &undo.created_coins {
            if !view.have_coin(id)? {
                return Err(LedgerError::CoinNotFound(describe(id)));
            }
        }

        for id in undo.created_coins.iter().rev() {
            view.remove_coin(id)?;
        }
        for tx_id in undo.records.iter().rev() {
            self.audit.remove(tx_id);
        }

        debug!(
            height = undo.height,
            coins = undo.created_coins.len(),
            "Reverted stabilization mints"
        );
        Ok(())
    }
}
