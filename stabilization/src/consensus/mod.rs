// Copyright (c) 2024 Botho Foundation

//! Consensus rules for stabilization transactions.

mod validator;

pub use validator::{compare, consensus_hash, ConsensusValidator, ValidatorStats};

use thiserror::Error;

use crate::currency::CurrencyCode;
use crate::ledger::LedgerError;

/// Malformed stabilization transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("stabilization transaction {index} has {count} inputs")]
    HasInputs { index: usize, count: usize },

    #[error("stabilization transaction {index} has no outputs")]
    NoOutputs { index: usize },

    #[error("transaction {index} is not a stabilization transaction")]
    NotStabilization { index: usize },

    #[error("stabilization transaction {index} pays {recipient} twice")]
    DuplicateRecipient { index: usize, recipient: String },

    #[error("stabilization transaction {index} output {output} is not denominated in {currency}")]
    WrongCurrency {
        index: usize,
        output: usize,
        currency: CurrencyCode,
    },

    #[error("stabilization transaction {index} is for height {got}, expected {expected}")]
    WrongHeight { index: usize, expected: u64, got: u64 },

    #[error("no recipients to pay")]
    NoRecipients,

    #[error("output {0} already exists in the UTXO set")]
    CoinExists(String),
}

/// Value or count outside consensus limits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundsError {
    #[error("output {output} of transaction {index} pays {amount}, below minimum {min}")]
    OutputBelowMinimum {
        index: usize,
        output: usize,
        amount: u64,
        min: u64,
    },

    #[error("output {output} of transaction {index} pays {amount}, above maximum {max}")]
    OutputAboveMaximum {
        index: usize,
        output: usize,
        amount: u64,
        max: u64,
    },

    #[error("transaction {index} has {count} recipients, limit {max}")]
    RecipientCount { index: usize, count: usize, max: u64 },

    #[error("transaction {index} mints {total}, limit {max}")]
    TotalAboveMaximum { index: usize, total: u64, max: u64 },
}

/// Block contents differ from the recomputed expectation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MismatchError {
    #[error("block is missing required stabilization transactions")]
    Missing,

    #[error("block contains unexpected stabilization transactions")]
    Unexpected,

    #[error("expected {expected} stabilization transactions, got {got}")]
    Count { expected: usize, got: usize },

    #[error("stabilization transaction {index} hash mismatch: expected {expected}, got {got}")]
    TxHash {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("stabilization transaction {index} output {output} pays {got}, expected {expected}")]
    OutputValue {
        index: usize,
        output: usize,
        expected: u64,
        got: u64,
    },

    #[error("stabilization transaction {index} has {got} outputs, expected {expected}")]
    OutputCount {
        index: usize,
        expected: usize,
        got: usize,
    },
}

/// Error from any stabilization operation.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Bounds error: {0}")]
    Bounds(#[from] BoundsError),

    #[error("Consensus mismatch: {0}")]
    Mismatch(#[from] MismatchError),

    #[error("Insufficient data for {currency}: {have} of {need} measurements")]
    DataInsufficient {
        currency: CurrencyCode,
        have: u64,
        need: u64,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl ConsensusError {
    /// Whether the error invalidates the block. Insufficient data only means
    /// the currency stays UNKNOWN.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DataInsufficient { .. })
    }

    /// Short machine-readable rejection reason attached to the block.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            Self::Structural(e) => match e {
                StructuralError::HasInputs { .. } => "bad-stabilization-inputs",
                StructuralError::NoOutputs { .. } | StructuralError::NoRecipients => {
                    "bad-stabilization-outputs"
                }
                StructuralError::DuplicateRecipient { .. } => "bad-stabilization-recipients",
                StructuralError::NotStabilization { .. }
                | StructuralError::WrongCurrency { .. }
                | StructuralError::WrongHeight { .. }
                | StructuralError::CoinExists(_) => "bad-stabilization-tx",
            },
            Self::Bounds(e) => match e {
                BoundsError::OutputBelowMinimum { .. } | BoundsError::OutputAboveMaximum { .. } => {
                    "bad-stabilization-amount"
                }
                BoundsError::RecipientCount { .. } => "bad-stabilization-recipients",
                BoundsError::TotalAboveMaximum { .. } => "bad-stabilization-total",
            },
            Self::Mismatch(e) => match e {
                MismatchError::Missing => "bad-stabilization-missing",
                MismatchError::Unexpected => "bad-stabilization-unexpected",
                MismatchError::Count { .. } => "bad-stabilization-count",
                MismatchError::TxHash { .. }
                | MismatchError::OutputValue { .. }
                | MismatchError::OutputCount { .. } => "bad-stabilization-tx-mismatch",
            },
            Self::DataInsufficient { .. } => "stabilization-insufficient-data",
            Self::Ledger(_) => "bad-stabilization-ledger",
        }
    }
}
