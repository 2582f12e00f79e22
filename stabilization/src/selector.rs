// Copyright (c) 2024 Botho Foundation

//! Deterministic recipient sampling.
//!
//! Recipients are verified identities whose home currency is currently
//! STABLE, never the currency being corrected. The candidate pool is sorted
//! by key bytes and then sampled with a partial Fisher-Yates shuffle whose
//! randomness comes from
//!
//! ```text
//! SHA-256("O_STABILIZATION_SAMPLE_V1" || parent_hash || currency || index)
//! ```
//!
//! so any node holding the same chain state draws the same recipients.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;

use crate::currency::CurrencyCode;
use crate::evaluator::StabilityEvaluator;
use crate::identity::{IdentityKey, IdentityRegistry};

const SAMPLE_DOMAIN: &[u8] = b"O_STABILIZATION_SAMPLE_V1";

/// Draws stabilization recipients.
#[derive(Debug, Clone, Default)]
pub struct RecipientSelector;

impl RecipientSelector {
    pub fn new() -> Self {
        Self
    }

    /// Sorted, deduplicated identities eligible to receive a mint of
    /// `exclude_currency`.
    pub fn eligible_pool(
        &self,
        registry: &dyn IdentityRegistry,
        stability: &StabilityEvaluator,
        exclude_currency: &CurrencyCode,
    ) -> Vec<IdentityKey> {
        let pool: BTreeSet<IdentityKey> = registry
            .verified_identities()
            .into_iter()
            .filter(|identity| &identity.home_currency != exclude_currency)
            .filter(|identity| stability.is_stable(&identity.home_currency))
            .map(|identity| identity.key)
            .collect();
        pool.into_iter().collect()
    }

    /// Select up to `count` distinct recipients in canonical key order.
    ///
    /// When the pool holds `count` identities or fewer, all of them are
    /// returned and the caller must use the returned length as the
    /// recipient count.
    pub fn select_recipients(
        &self,
        registry: &dyn IdentityRegistry,
        stability: &StabilityEvaluator,
        count: u64,
        exclude_currency: &CurrencyCode,
        seed_hash: &[u8; 32],
    ) -> Vec<IdentityKey> {
        let pool = self.eligible_pool(registry, stability, exclude_currency);
        let selected = sample(pool, count, exclude_currency, seed_hash);

        debug!(
            currency = %exclude_currency,
            requested = count,
            selected = selected.len(),
            seed = hex::encode(&seed_hash[0..8]),
            "Selected stabilization recipients"
        );
        selected
    }
}

/// Sample `count` keys from a sorted pool. Result is sorted.
pub fn sample(
    mut pool: Vec<IdentityKey>,
    count: u64,
    currency: &CurrencyCode,
    seed_hash: &[u8; 32],
) -> Vec<IdentityKey> {
    let n = pool.len();
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    if count >= n {
        return pool;
    }

    for i in 0..count {
        let remaining = (n - i) as u64;
        let j = i + uniform_index(sample_random(seed_hash, currency, i as u64), remaining) as usize;
        pool.swap(i, j);
    }

    pool.truncate(count);
    pool.sort();
    pool
}

/// Random word for draw number `index`.
pub fn sample_random(seed_hash: &[u8; 32], currency: &CurrencyCode, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(SAMPLE_DOMAIN);
    hasher.update(seed_hash);
    hasher.update(currency.to_hash_bytes());
    hasher.update(index.to_le_bytes());
    let hash: [u8; 32] = hasher.finalize().into();

    let mut word = [0u8; 8];
    word.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(word)
}

/// Map a random word onto `0..bound` by widening multiplication.
fn uniform_index(random: u64, bound: u64) -> u64 {
    ((random as u128 * bound as u128) >> 64) as u64
}
