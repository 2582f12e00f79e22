// Copyright (c) 2024 Botho Foundation

//! Building stabilization mint transactions.

use std::collections::BTreeSet;

use crate::consensus::{ConsensusError, StructuralError};
use crate::currency::CurrencyCode;
use crate::identity::IdentityKey;
use crate::ledger::check_stabilization_transaction;
use crate::params::StabilizationParams;
use crate::transaction::{Transaction, TransactionKind, TxOutput, TX_VERSION};

/// Builds zero-input mint transactions.
#[derive(Debug, Clone)]
pub struct TransactionSynthesizer {
    params: StabilizationParams,
}

impl TransactionSynthesizer {
    pub fn new(params: StabilizationParams) -> Self {
        Self { params }
    }

    /// Mint `total_coins` of `currency` at `height`, split across `recipients`.
    ///
    /// Recipients are put in canonical key order. Each gets
    /// `total_coins / n`; the remainder goes to the first output, so the
    /// outputs always sum to `total_coins`.
    pub fn build_mint_transaction(
        &self,
        currency: &CurrencyCode,
        height: u64,
        total_coins: u64,
        recipients: &[IdentityKey],
    ) -> Result<Transaction, ConsensusError> {
        if recipients.is_empty() {
            return Err(StructuralError::NoRecipients.into());
        }

        let mut ordered = BTreeSet::new();
        for (index, key) in recipients.iter().enumerate() {
            if !ordered.insert(*key) {
                return Err(StructuralError::DuplicateRecipient {
                    index,
                    recipient: key.to_string(),
                }
                .into());
            }
        }

        let count = ordered.len() as u64;
        let share = total_coins / count;
        let remainder = total_coins % count;

        let outputs = ordered
            .into_iter()
            .enumerate()
            .map(|(i, recipient)| TxOutput {
                amount: if i == 0 { share + remainder } else { share },
                currency: currency.clone(),
                recipient,
            })
            .collect();

        let tx = Transaction {
            version: TX_VERSION,
            kind: TransactionKind::Stabilization {
                currency: currency.clone(),
                height,
            },
            inputs: Vec::new(),
            outputs,
        };

        check_stabilization_transaction(0, &tx, &self.params, Some(height))?;
        Ok(tx)
    }
}
