// Copyright (c) 2024 Botho Foundation

//! Verified identities and the registry interface.
//!
//! Identity verification happens elsewhere. The stabilization engine only
//! needs the list of verified identities and the home currency each one
//! declared when it registered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::currency::CurrencyCode;

/// Public key of a verified identity. Minted outputs are spendable by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub [u8; 32]);

impl IdentityKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An identity that passed verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub key: IdentityKey,
    /// Currency the identity declared as its home currency.
    pub home_currency: CurrencyCode,
}

/// Source of verified identities.
///
/// Implementations must return the same set to every validating node for a
/// given chain state, otherwise recipient selection diverges.
pub trait IdentityRegistry: Send + Sync {
    /// All verified identities, in any order.
    fn verified_identities(&self) -> Vec<VerifiedIdentity>;

    /// Verified identities whose home currency is `currency`.
    fn identities_by_currency(&self, currency: &CurrencyCode) -> Vec<IdentityKey> {
        self.verified_identities()
            .into_iter()
            .filter(|identity| &identity.home_currency == currency)
            .map(|identity| identity.key)
            .collect()
    }
}

/// In-memory registry keyed by identity key.
#[derive(Clone, Debug, Default)]
pub struct IdentitySet {
    identities: BTreeMap<IdentityKey, CurrencyCode>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or re-home an identity.
    pub fn insert(&mut self, key: IdentityKey, home_currency: CurrencyCode) {
        self.identities.insert(key, home_currency);
    }

    pub fn remove(&mut self, key: &IdentityKey) -> bool {
        self.identities.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl IdentityRegistry for IdentitySet {
    fn verified_identities(&self) -> Vec<VerifiedIdentity> {
        self.identities
            .iter()
            .map(|(key, home)| VerifiedIdentity {
                key: *key,
                home_currency: home.clone(),
            })
            .collect()
    }
}
