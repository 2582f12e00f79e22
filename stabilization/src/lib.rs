// Copyright (c) 2024 Botho Foundation

//! Stabilization mining for the O blockchain.
//!
//! Every O currency is pegged to the price of one liter of water in its
//! linked fiat currency. When a currency drifts away from that peg for long
//! enough, this crate decides how many new coins to mint, picks the verified
//! users who receive them, builds the zero-input mint transactions, applies
//! them to the UTXO set and, on the validation side, recomputes the whole
//! pipeline to reject any block whose stabilization contents differ.
//!
//! Nodes never vote on stabilization: they all derive identical transactions
//! from identical chain state.
//!
//! ```text
//!   MeasurementOracle ──► StabilityEvaluator ──► CoinMintCalculator
//!                                                       │
//!   IdentityRegistry ───► RecipientSelector ◄───────────┘
//!                                │
//!                                ▼
//!                      TransactionSynthesizer ──► ConsensusValidator
//!                                                       │
//!                                                       ▼
//!                                                LedgerApplier ──► UtxoView
//! ```

#![deny(clippy::print_stdout)]

pub mod block;
pub mod config;
pub mod consensus;
pub mod context;
pub mod currency;
pub mod evaluator;
pub mod identity;
pub mod ledger;
pub mod mint;
pub mod oracle;
pub mod params;
pub mod selector;
pub mod synthesizer;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use consensus::{ConsensusError, ConsensusValidator};
pub use context::ConsensusContext;
pub use currency::{CurrencyCode, CurrencyStabilityInfo, StabilityStatus};
pub use evaluator::StabilityEvaluator;
pub use identity::{IdentityKey, IdentityRegistry};
pub use ledger::{LedgerApplier, UtxoView};
pub use mint::{CoinMintCalculator, MintPlan};
pub use oracle::MeasurementOracle;
pub use params::StabilizationParams;
pub use selector::RecipientSelector;
pub use synthesizer::TransactionSynthesizer;
pub use transaction::Transaction;
