// Copyright (c) 2024 Botho Foundation

//! Currency codes and per-currency stability state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::params::{ratio_to_ppm, EXPECTED_WATER_PRICE};

/// Longest accepted currency code.
pub const MAX_CURRENCY_CODE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid currency code {0:?}: expected 1-12 ASCII upper-case letters or digits")]
pub struct InvalidCurrencyCode(pub String);

/// Code of an O currency, e.g. `OUSD`.
///
/// Codes order lexicographically, and that order is the canonical order in
/// which multiple unstable currencies are processed within a block.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// The base O unit that exchange rates are quoted against.
    pub fn base() -> Self {
        Self("O".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length-prefixed bytes, used wherever a code is hashed.
    pub fn to_hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.0.len());
        bytes.push(self.0.len() as u8);
        bytes.extend_from_slice(self.0.as_bytes());
        bytes
    }
}

impl FromStr for CurrencyCode {
    type Err = InvalidCurrencyCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_CURRENCY_CODE_LEN
            && s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidCurrencyCode(s.to_string()))
        }
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = InvalidCurrencyCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Peg health of a currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilityStatus {
    /// Within the threshold (or deviating for less than the hysteresis window).
    Stable,
    /// Deviating continuously since block `since`.
    Unstable { since: u64 },
    /// No exchange-rate observation for too long.
    Inactive,
    /// Not enough measurements yet.
    Unknown,
}

impl StabilityStatus {
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable)
    }

    pub fn is_unstable(&self) -> bool {
        matches!(self, Self::Unstable { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Unstable { .. } => "unstable",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstable { since } => write!(f, "unstable since {}", since),
            other => f.write_str(other.label()),
        }
    }
}

/// Tracked stability state of one currency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrencyStabilityInfo {
    pub currency: CurrencyCode,

    /// Peg target, always [`EXPECTED_WATER_PRICE`].
    pub expected_water_price: f64,

    /// Latest observed water price in O units per liter.
    pub observed_water_price: f64,

    /// Latest observed exchange rate against the base O unit.
    pub observed_exchange_rate: f64,

    /// |expected - observed| / expected from the latest observation.
    pub stability_ratio: f64,

    /// |1 - exchange rate| from the latest exchange-rate observation.
    pub exchange_rate_deviation: f64,

    pub status: StabilityStatus,

    /// First block of the current run of deviating observations.
    pub deviating_since: Option<u64>,

    pub last_check_height: u64,

    /// Height of the latest exchange-rate observation, or of first tracking.
    pub last_exchange_rate_height: u64,

    pub measurement_count: u64,
}

impl CurrencyStabilityInfo {
    /// Fresh record for a currency first seen at `height`.
    pub fn new(currency: CurrencyCode, height: u64) -> Self {
        Self {
            currency,
            expected_water_price: EXPECTED_WATER_PRICE,
            observed_water_price: 0.0,
            observed_exchange_rate: 0.0,
            stability_ratio: 0.0,
            exchange_rate_deviation: 0.0,
            status: StabilityStatus::Unknown,
            deviating_since: None,
            last_check_height: height,
            last_exchange_rate_height: height,
            measurement_count: 0,
        }
    }

    /// Stability ratio in parts-per-million. All consensus arithmetic uses this.
    pub fn ratio_ppm(&self) -> u64 {
        ratio_to_ppm(self.stability_ratio)
    }

    /// Block at which the current instability began, 0 unless UNSTABLE.
    pub fn unstable_since_height(&self) -> u64 {
        match self.status {
            StabilityStatus::Unstable { since } => since,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_code_validation() {
        assert!("OUSD".parse::<CurrencyCode>().is_ok());
        assert!("O".parse::<CurrencyCode>().is_ok());
        assert!("".parse::<CurrencyCode>().is_err());
        assert!("ousd".parse::<CurrencyCode>().is_err());
        assert!("O-USD".parse::<CurrencyCode>().is_err());
        assert!("OABCDEFGHIJKL".parse::<CurrencyCode>().is_err());
    }

    #[test]
    fn test_currency_code_orders_lexicographically() {
        let mut codes: Vec<CurrencyCode> = ["OUSD", "OEUR", "OJPY"]
            .iter()
            .map(|c| c.parse().unwrap())
            .collect();
        codes.sort();
        let sorted: Vec<&str> = codes.iter().map(|c| c.as_str()).collect();
        assert_eq!(sorted, vec!["OEUR", "OJPY", "OUSD"]);
    }

    #[test]
    fn test_deserialize_rejects_bad_code() {
        let err = toml::from_str::<std::collections::BTreeMap<String, CurrencyCode>>(
            "code = \"usd\"",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unstable_since_only_when_unstable() {
        let mut info = CurrencyStabilityInfo::new("OUSD".parse().unwrap(), 10);
        assert_eq!(info.unstable_since_height(), 0);
        info.deviating_since = Some(42);
        assert_eq!(info.unstable_since_height(), 0);
        info.status = StabilityStatus::Unstable { since: 42 };
        assert_eq!(info.unstable_since_height(), 42);
    }
}
