mod applier;
mod store;

pub use applier::{
    check_stabilization_transaction, AuditLedger, BlockUndo, LedgerApplier, MintStats,
    StabilizationRecord,
};
pub use store::StabilizationStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::currency::CurrencyCode;
use crate::identity::IdentityKey;
use crate::transaction::{TxOutput, UtxoId};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] lmdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Coin already exists: {0}")]
    CoinExists(String),

    #[error("Coin not found: {0}")]
    CoinNotFound(String),

    #[error("Undo data not found: height {0}")]
    UndoNotFound(u64),
}

impl From<bincode::Error> for LedgerError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Short printable form of an output reference.
pub(crate) fn describe(id: &UtxoId) -> String {
    format!("{}:{}", hex::encode(&id.tx_hash[0..8]), id.output_index)
}

/// An unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TxOutput,
    /// Height of the block that created it
    pub height: u64,
    /// Zero-input issuance, subject to maturity
    pub issuance: bool,
}

impl Coin {
    /// Whether the coin can be spent in a block at `height`.
    pub fn is_mature(&self, height: u64, maturity: u64) -> bool {
        !self.issuance || height.saturating_sub(self.height) >= maturity
    }
}

/// Mutable view of the unspent output set.
pub trait UtxoView {
    fn get_coin(&self, id: &UtxoId) -> Result<Option<Coin>, LedgerError>;

    fn have_coin(&self, id: &UtxoId) -> Result<bool, LedgerError> {
        Ok(self.get_coin(id)?.is_some())
    }

    /// Insert a new coin. Fails if `id` is already present.
    fn add_coin(&mut self, id: UtxoId, coin: Coin) -> Result<(), LedgerError>;

    /// Remove and return a coin.
    fn remove_coin(&mut self, id: &UtxoId) -> Result<Option<Coin>, LedgerError>;
}

/// A change made through a [`CoinsCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinChange {
    Added(UtxoId, Coin),
    Removed(UtxoId),
}

/// In-memory UTXO set that journals its changes for flushing to disk.
#[derive(Debug, Clone, Default)]
pub struct CoinsCache {
    coins: BTreeMap<UtxoId, Coin>,
    journal: Vec<CoinChange>,
}

impl CoinsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-populated from storage. The journal starts empty.
    pub fn from_coins(coins: impl IntoIterator<Item = (UtxoId, Coin)>) -> Self {
        Self {
            coins: coins.into_iter().collect(),
            journal: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UtxoId, &Coin)> {
        self.coins.iter()
    }

    /// Drain the journal of changes made since the last call.
    pub fn take_changes(&mut self) -> Vec<CoinChange> {
        std::mem::take(&mut self.journal)
    }

    /// Sum of `recipient`'s coins in `currency`, split into
    /// `(spendable, immature)` at `height`.
    pub fn balance(
        &self,
        recipient: &IdentityKey,
        currency: &CurrencyCode,
        height: u64,
        maturity: u64,
    ) -> (u64, u64) {
        self.coins
            .values()
            .filter(|coin| &coin.output.recipient == recipient && &coin.output.currency == currency)
            .fold((0u64, 0u64), |(spendable, immature), coin| {
                if coin.is_mature(height, maturity) {
                    (spendable.saturating_add(coin.output.amount), immature)
                } else {
                    (spendable, immature.saturating_add(coin.output.amount))
                }
            })
    }
}

impl UtxoView for CoinsCache {
    fn get_coin(&self, id: &UtxoId) -> Result<Option<Coin>, LedgerError> {
        Ok(self.coins.get(id).cloned())
    }

    fn add_coin(&mut self, id: UtxoId, coin: Coin) -> Result<(), LedgerError> {
        if self.coins.contains_key(&id) {
            return Err(LedgerError::CoinExists(describe(&id)));
        }
        self.coins.insert(id, coin.clone());
        self.journal.push(CoinChange::Added(id, coin));
        Ok(())
    }

    fn remove_coin(&mut self, id: &UtxoId) -> Result<Option<Coin>, LedgerError> {
        let removed = self.coins.remove(id);
        if removed.is_some() {
            self.journal.push(CoinChange::Removed(*id));
        }
        Ok(removed)
    }
}
