// Copyright (c) 2024 Botho Foundation

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::currency::CurrencyCode;
use crate::oracle::Measurement;
use crate::transaction::{Transaction, TransactionKind};

/// Block format version.
pub const BLOCK_VERSION: u32 = 1;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,

    /// Hash of the previous block; seeds recipient selection
    pub prev_block_hash: [u8; 32],

    /// Commitment to all transactions
    pub tx_root: [u8; 32],

    /// Commitment to the oracle measurements carried by this block
    pub measurement_root: [u8; 32],

    /// Block timestamp (unix seconds)
    pub timestamp: u64,

    /// Block height
    pub height: u64,
}

impl BlockHeader {
    /// Compute the hash of this block header
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.prev_block_hash);
        hasher.update(self.tx_root);
        hasher.update(self.measurement_root);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A block: header, transactions, and the oracle measurements it commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub measurements: Vec<Measurement>,
}

impl Block {
    /// Assemble a block, computing both roots.
    pub fn new(
        prev_block_hash: [u8; 32],
        height: u64,
        timestamp: u64,
        transactions: Vec<Transaction>,
        measurements: Vec<Measurement>,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            prev_block_hash,
            tx_root: compute_tx_root(&transactions),
            measurement_root: compute_measurement_root(&measurements),
            timestamp,
            height,
        };
        Self {
            header,
            transactions,
            measurements,
        }
    }

    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Same block with `extra` transactions appended and the roots recomputed.
    pub fn with_transactions(&self, extra: Vec<Transaction>) -> Self {
        let mut transactions = self.transactions.clone();
        transactions.extend(extra);
        Self::new(
            self.header.prev_block_hash,
            self.header.height,
            self.header.timestamp,
            transactions,
            self.measurements.clone(),
        )
    }

    /// Stabilization transactions, in block order.
    pub fn stabilization_transactions(&self) -> Vec<&Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.is_stabilization())
            .collect()
    }

    pub fn has_stabilization(&self) -> bool {
        self.transactions.iter().any(|tx| tx.is_stabilization())
    }

    /// Transfer volume denominated in `currency`.
    ///
    /// Minted outputs are excluded so a block's own stabilization does not
    /// feed back into the amount it mints.
    pub fn currency_volume(&self, currency: &CurrencyCode) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Transfer)
            .flat_map(|tx| tx.outputs.iter())
            .filter(|output| &output.currency == currency)
            .fold(0u64, |acc, output| acc.saturating_add(output.amount))
    }
}

/// Hash of the ordered transaction hashes.
pub fn compute_tx_root(transactions: &[Transaction]) -> [u8; 32] {
    if transactions.is_empty() {
        return [0u8; 32];
    }

    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(tx.hash());
    }
    hasher.finalize().into()
}

/// Hash of the ordered measurements.
pub fn compute_measurement_root(measurements: &[Measurement]) -> [u8; 32] {
    if measurements.is_empty() {
        return [0u8; 32];
    }

    let mut hasher = Sha256::new();
    for measurement in measurements {
        hasher.update(measurement.hash());
    }
    hasher.finalize().into()
}
