// Copyright (c) 2024 Botho Foundation

//! Transaction types.
//!
//! Only two kinds of transaction matter here: ordinary transfers, whose
//! outputs make up a currency's observed volume, and stabilization mints.
//!
//! # Stabilization outputs
//!
//! A stabilization output is an ordinary value-bearing output: it names the
//! recipient identity that can spend it and the currency it is denominated
//! in. The `(currency, recipient)` provenance is therefore carried by the
//! output itself and there is no separate unspendable marker output.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::currency::CurrencyCode;
use crate::identity::IdentityKey;

/// Current transaction format version.
pub const TX_VERSION: u32 = 1;

pub type TxHash = [u8; 32];

/// Reference to an output of an earlier transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoId {
    pub tx_hash: TxHash,
    pub output_index: u32,
}

impl UtxoId {
    pub fn new(tx_hash: TxHash, output_index: u32) -> Self {
        Self {
            tx_hash,
            output_index,
        }
    }

    /// Storage key: tx hash followed by the big-endian output index, so keys
    /// of one transaction sort by index.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[0..32].copy_from_slice(&self.tx_hash);
        bytes[32..36].copy_from_slice(&self.output_index.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        let tx_hash: TxHash = bytes[0..32].try_into().ok()?;
        let output_index = u32::from_be_bytes(bytes[32..36].try_into().ok()?);
        Some(Self::new(tx_hash, output_index))
    }
}

/// Spend of an existing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_out: UtxoId,
}

/// A value-bearing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in smallest units of `currency`
    pub amount: u64,
    /// Currency the amount is denominated in
    pub currency: CurrencyCode,
    /// Identity that can spend this output
    pub recipient: IdentityKey,
}

/// What a transaction does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Moves existing value between identities.
    Transfer,
    /// Zero-input issuance correcting `currency` at block `height`.
    Stabilization { currency: CurrencyCode, height: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub kind: TransactionKind,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn transfer(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            kind: TransactionKind::Transfer,
            inputs,
            outputs,
        }
    }

    pub fn is_stabilization(&self) -> bool {
        matches!(self.kind, TransactionKind::Stabilization { .. })
    }

    /// Currency a stabilization transaction corrects.
    pub fn stabilization_currency(&self) -> Option<&CurrencyCode> {
        match &self.kind {
            TransactionKind::Stabilization { currency, .. } => Some(currency),
            TransactionKind::Transfer => None,
        }
    }

    pub fn total_output(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |acc, output| acc.saturating_add(output.amount))
    }

    /// Recipients in output order.
    pub fn recipients(&self) -> Vec<IdentityKey> {
        self.outputs.iter().map(|output| output.recipient).collect()
    }

    /// Transaction hash.
    ///
    /// Every field is fed in a fixed order with explicit lengths, so the
    /// hash of a stabilization transaction depends only on its currency,
    /// height and ordered `(recipient, amount)` outputs.
    pub fn hash(&self) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(b"O_TX_V1");
        hasher.update(self.version.to_le_bytes());

        match &self.kind {
            TransactionKind::Transfer => hasher.update([0u8]),
            TransactionKind::Stabilization { currency, height } => {
                hasher.update([1u8]);
                hasher.update(currency.to_hash_bytes());
                hasher.update(height.to_le_bytes());
            }
        }

        hasher.update((self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.prev_out.to_bytes());
        }

        hasher.update((self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(output.amount.to_le_bytes());
            hasher.update(output.currency.to_hash_bytes());
            hasher.update(output.recipient.as_bytes());
        }

        hasher.finalize().into()
    }
}
