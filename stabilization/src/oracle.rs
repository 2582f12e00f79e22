// Copyright (c) 2024 Botho Foundation

//! Oracle measurements anchored in the chain.
//!
//! Measuring and authenticating prices happens outside this crate. What the
//! engine needs is a view of those measurements that every node agrees on,
//! so measurements travel inside blocks and the oracle answers only from
//! blocks strictly below the height being evaluated:
//!
//! ```text
//!   block h-k ... block h-1 | block h
//!   [ committed window     ]|  <- evaluated here, cannot see its own data
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::block::Block;
use crate::currency::CurrencyCode;

/// One observation committed in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub currency: CurrencyCode,
    /// Price of one liter of water in O units of `currency`.
    pub water_price: Option<f64>,
    /// Exchange rate of `currency` against the base O unit.
    pub exchange_rate: Option<f64>,
}

impl Measurement {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.currency.to_hash_bytes());
        for value in [self.water_price, self.exchange_rate] {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update(v.to_bits().to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        hasher.finalize().into()
    }
}

/// Read-only access to measurements.
///
/// Every method takes the height under evaluation and must answer only from
/// data committed below it, so that all nodes see the same inputs.
pub trait MeasurementOracle {
    /// Currencies with at least one committed measurement below `at_height`.
    fn tracked_currencies(&self, at_height: u64) -> Vec<CurrencyCode>;

    /// Mean water price over the `window` blocks below `at_height`.
    fn average_water_price(
        &self,
        currency: &CurrencyCode,
        window: u64,
        at_height: u64,
    ) -> Option<f64>;

    /// Number of committed water-price observations behind
    /// [`average_water_price`](Self::average_water_price) for the same window.
    fn water_price_samples(&self, currency: &CurrencyCode, window: u64, at_height: u64) -> u64;

    /// Mean exchange rate of `from` against `to` over the `window` blocks
    /// below `at_height`.
    fn average_exchange_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        window: u64,
        at_height: u64,
    ) -> Option<f64>;

    /// Height of the latest committed exchange rate of `from` against `to`
    /// below `at_height`, however old.
    fn last_exchange_rate_height(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        at_height: u64,
    ) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Observed {
    water_price: Option<f64>,
    exchange_rate: Option<f64>,
}

/// Measurements collected from connected blocks, indexed by height.
#[derive(Debug, Clone, Default)]
pub struct CommittedMeasurements {
    by_currency: BTreeMap<CurrencyCode, BTreeMap<u64, Vec<Observed>>>,
}

impl CommittedMeasurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one measurement as committed at `height`.
    pub fn record(&mut self, height: u64, measurement: &Measurement) {
        self.by_currency
            .entry(measurement.currency.clone())
            .or_default()
            .entry(height)
            .or_default()
            .push(Observed {
                water_price: measurement.water_price.filter(|p| p.is_finite()),
                exchange_rate: measurement.exchange_rate.filter(|r| r.is_finite()),
            });
    }

    /// Record every measurement carried by a connected block.
    pub fn record_block(&mut self, block: &Block) {
        for measurement in &block.measurements {
            self.record(block.height(), measurement);
        }
    }

    /// Forget everything committed at `height` (block disconnected).
    pub fn remove_height(&mut self, height: u64) {
        for per_height in self.by_currency.values_mut() {
            per_height.remove(&height);
        }
        self.by_currency.retain(|_, per_height| !per_height.is_empty());
    }

    /// Drop measurements below `cutoff`.
    pub fn prune(&mut self, cutoff: u64) {
        for per_height in self.by_currency.values_mut() {
            *per_height = per_height.split_off(&cutoff);
        }
        self.by_currency.retain(|_, per_height| !per_height.is_empty());
    }

    /// Mean and sample count of the values `pick` selects in the window.
    fn window<F>(
        &self,
        currency: &CurrencyCode,
        window: u64,
        at_height: u64,
        pick: F,
    ) -> Option<(f64, u64)>
    where
        F: Fn(&Observed) -> Option<f64>,
    {
        let per_height = self.by_currency.get(currency)?;
        let start = at_height.saturating_sub(window);

        let mut sum = 0.0;
        let mut count = 0u64;
        for observations in per_height.range(start..at_height).map(|(_, obs)| obs) {
            for value in observations.iter().filter_map(&pick) {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            None
        } else {
            Some((sum / count as f64, count))
        }
    }
}

impl MeasurementOracle for CommittedMeasurements {
    fn tracked_currencies(&self, at_height: u64) -> Vec<CurrencyCode> {
        let tracked: BTreeSet<&CurrencyCode> = self
            .by_currency
            .iter()
            .filter(|(_, per_height)| per_height.range(..at_height).next().is_some())
            .map(|(currency, _)| currency)
            .collect();
        tracked.into_iter().cloned().collect()
    }

    fn average_water_price(
        &self,
        currency: &CurrencyCode,
        window: u64,
        at_height: u64,
    ) -> Option<f64> {
        self.window(currency, window, at_height, |obs| obs.water_price)
            .map(|(mean, _)| mean)
    }

    fn water_price_samples(&self, currency: &CurrencyCode, window: u64, at_height: u64) -> u64 {
        self.window(currency, window, at_height, |obs| obs.water_price)
            .map_or(0, |(_, samples)| samples)
    }

    fn average_exchange_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        window: u64,
        at_height: u64,
    ) -> Option<f64> {
        // Rates are committed against the base unit only.
        if *to != CurrencyCode::base() {
            return None;
        }
        self.window(from, window, at_height, |obs| obs.exchange_rate)
            .map(|(mean, _)| mean)
    }

    fn last_exchange_rate_height(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        at_height: u64,
    ) -> Option<u64> {
        if *to != CurrencyCode::base() {
            return None;
        }
        self.by_currency
            .get(from)?
            .range(..at_height)
            .rev()
            .find(|(_, observations)| observations.iter().any(|obs| obs.exchange_rate.is_some()))
            .map(|(height, _)| *height)
    }
}
