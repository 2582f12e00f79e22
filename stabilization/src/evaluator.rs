// Copyright (c) 2024 Botho Foundation

//! Currency stability classification.
//!
//! Each tracked currency moves through a small state machine. Transitions
//! only happen when the evaluator is called for a block height:
//!
//! ```text
//!            >= min_measurements
//!   Unknown ───────────────────────► Stable ◄──────────┐
//!                                      │               │ ratio <= threshold
//!                                      │ ratio > threshold
//!                                      │ for >= unstable_time_range blocks
//!                                      ▼               │
//!                                   Unstable ──────────┘
//!
//!   any ──(no exchange rate for inactive_time_range)──► Inactive
//!   Inactive ──(fresh exchange rate)──► re-evaluated normally
//! ```
//!
//! The hysteresis tracker (`deviating_since`) keeps running while the
//! currency is still classified STABLE, so `Unstable { since }` always names
//! the first block of the deviation rather than the block it was declared.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::consensus::ConsensusError;
use crate::currency::{CurrencyCode, CurrencyStabilityInfo, StabilityStatus};
use crate::oracle::MeasurementOracle;
use crate::params::{ratio_to_ppm, StabilizationParams, EXPECTED_WATER_PRICE};

/// Number of tracked currencies in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StabilityCounts {
    pub stable: usize,
    pub unstable: usize,
    pub inactive: usize,
    pub unknown: usize,
}

/// Inputs to one evaluation of a currency.
#[derive(Debug, Clone, Copy, Default)]
struct Observation {
    water_price: Option<f64>,
    /// Committed samples behind `water_price`. `None` counts the price as
    /// one more measurement.
    samples: Option<u64>,
    exchange_rate: Option<f64>,
    /// Height the exchange rate was committed at. `None` means the
    /// evaluation height.
    rate_height: Option<u64>,
}

/// Owns the per-currency stability map.
#[derive(Debug, Clone)]
pub struct StabilityEvaluator {
    params: StabilizationParams,
    currencies: BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
}

impl StabilityEvaluator {
    pub fn new(params: StabilizationParams) -> Self {
        Self {
            params,
            currencies: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &StabilizationParams {
        &self.params
    }

    /// Evaluate one observation of `currency` at `height`.
    ///
    /// `observed_exchange_rate` is `None` when no rate arrived for this
    /// evaluation; the inactivity clock keeps running in that case.
    pub fn evaluate(
        &mut self,
        currency: &CurrencyCode,
        observed_water_price: f64,
        observed_exchange_rate: Option<f64>,
        height: u64,
    ) -> CurrencyStabilityInfo {
        let observation = Observation {
            water_price: Some(observed_water_price),
            exchange_rate: observed_exchange_rate,
            ..Default::default()
        };
        self.observe(currency, observation, height)
    }

    /// Re-run classification for a tracked currency without a new observation.
    pub fn refresh_inactivity(
        &mut self,
        currency: &CurrencyCode,
        height: u64,
    ) -> Option<CurrencyStabilityInfo> {
        if !self.currencies.contains_key(currency) {
            return None;
        }
        Some(self.observe(currency, Observation::default(), height))
    }

    /// Evaluate every currency known to the oracle or already tracked.
    ///
    /// The measurement count is the number of committed water-price samples
    /// in the window, and the inactivity clock runs from the height of the
    /// latest committed exchange rate. Returns the number of status changes.
    pub fn reevaluate_all(&mut self, oracle: &dyn MeasurementOracle, height: u64) -> usize {
        let base = CurrencyCode::base();
        let mut currencies: BTreeSet<CurrencyCode> =
            oracle.tracked_currencies(height).into_iter().collect();
        currencies.extend(self.currencies.keys().cloned());
        currencies.remove(&base);

        let mut changes = 0;
        for currency in &currencies {
            let before = self.currencies.get(currency).map(|info| info.status);

            let water_window = self.params.water_price_window;
            let observation = Observation {
                water_price: oracle.average_water_price(currency, water_window, height),
                samples: Some(oracle.water_price_samples(currency, water_window, height)),
                exchange_rate: oracle.average_exchange_rate(
                    currency,
                    &base,
                    self.params.exchange_rate_window,
                    height,
                ),
                rate_height: oracle.last_exchange_rate_height(currency, &base, height),
            };

            let after = self.observe(currency, observation, height).status;
            if before != Some(after) {
                changes += 1;
            }
        }

        debug!(
            height,
            currencies = currencies.len(),
            changes,
            "Re-evaluated currency stability"
        );
        changes
    }

    /// Force a currency into INACTIVE, e.g. when its fiat is withdrawn.
    ///
    /// The next fresh exchange-rate observation re-evaluates it normally.
    pub fn mark_inactive(&mut self, currency: &CurrencyCode, height: u64) {
        let info = self
            .currencies
            .entry(currency.clone())
            .or_insert_with(|| CurrencyStabilityInfo::new(currency.clone(), height));
        info.last_check_height = height;
        info.status = StabilityStatus::Inactive;
        info!(currency = %currency, height, "Currency marked inactive");
    }

    fn observe(
        &mut self,
        currency: &CurrencyCode,
        observation: Observation,
        height: u64,
    ) -> CurrencyStabilityInfo {
        let threshold = self.params.stability_threshold_ppm;

        let mut info = match self.currencies.get(currency) {
            Some(info) => info.clone(),
            None => {
                let mut info = CurrencyStabilityInfo::new(currency.clone(), height);
                if let Some(rate_height) = observation.rate_height {
                    info.last_exchange_rate_height = rate_height;
                }
                info
            }
        };
        let previous = info.status;

        info.last_check_height = height;

        if let Some(price) = observation.water_price {
            if price.is_finite() && price >= 0.0 {
                info.observed_water_price = price;
                info.stability_ratio =
                    (EXPECTED_WATER_PRICE - price).abs() / EXPECTED_WATER_PRICE;
                info.measurement_count = match observation.samples {
                    Some(samples) => samples,
                    None => info.measurement_count + 1,
                };

                if info.ratio_ppm() > threshold {
                    info.deviating_since.get_or_insert(height);
                } else {
                    info.deviating_since = None;
                }
            } else {
                warn!(currency = %currency, height, price, "Ignoring invalid water price");
            }
        }

        let rate = observation.exchange_rate.filter(|r| r.is_finite() && *r >= 0.0);
        let rate_height = observation.rate_height.unwrap_or(height);
        // A rate committed before the last one seen is not fresh.
        let fresh_rate = rate.is_some() && rate_height > info.last_exchange_rate_height;
        if let Some(rate) = rate {
            info.observed_exchange_rate = rate;
            info.exchange_rate_deviation = (1.0 - rate).abs();
            info.last_exchange_rate_height = info.last_exchange_rate_height.max(rate_height);

            let rate_deviating = ratio_to_ppm(info.exchange_rate_deviation) > threshold;
            let price_deviating = info.deviating_since.is_some();
            if rate_deviating != price_deviating {
                debug!(
                    currency = %currency,
                    ratio_ppm = info.ratio_ppm(),
                    rate_deviation_ppm = ratio_to_ppm(info.exchange_rate_deviation),
                    "Exchange rate and water price disagree on peg deviation"
                );
            }
        }

        // Leaving INACTIVE takes a fresh exchange rate.
        info.status = if previous == StabilityStatus::Inactive && !fresh_rate {
            StabilityStatus::Inactive
        } else {
            match self.classify(&info, height) {
                Ok(status) => status,
                Err(e) => {
                    debug!(currency = %currency, height, "{}", e);
                    StabilityStatus::Unknown
                }
            }
        };

        if info.status != previous {
            info!(
                currency = %currency,
                height,
                from = %previous,
                to = %info.status,
                ratio_ppm = info.ratio_ppm(),
                "Currency stability changed"
            );
        }

        self.currencies.insert(currency.clone(), info.clone());
        info
    }

    /// Status implied by `info` at `height`.
    ///
    /// Too few measurements is reported as [`ConsensusError::DataInsufficient`],
    /// which callers map to UNKNOWN.
    pub fn classify(
        &self,
        info: &CurrencyStabilityInfo,
        height: u64,
    ) -> Result<StabilityStatus, ConsensusError> {
        if height.saturating_sub(info.last_exchange_rate_height) >= self.params.inactive_time_range
        {
            return Ok(StabilityStatus::Inactive);
        }

        if info.measurement_count < self.params.min_measurements {
            return Err(ConsensusError::DataInsufficient {
                currency: info.currency.clone(),
                have: info.measurement_count,
                need: self.params.min_measurements,
            });
        }

        match info.deviating_since {
            Some(since) if height.saturating_sub(since) >= self.params.unstable_time_range => {
                Ok(StabilityStatus::Unstable { since })
            }
            _ => Ok(StabilityStatus::Stable),
        }
    }

    pub fn status(&self, currency: &CurrencyCode) -> Option<&CurrencyStabilityInfo> {
        self.currencies.get(currency)
    }

    pub fn is_stable(&self, currency: &CurrencyCode) -> bool {
        self.currencies
            .get(currency)
            .is_some_and(|info| info.status.is_stable())
    }

    pub fn stable_currencies(&self) -> Vec<CurrencyCode> {
        self.filter_currencies(|status| status.is_stable())
    }

    /// Unstable currencies in canonical (code) order.
    pub fn unstable_currencies(&self) -> Vec<CurrencyCode> {
        self.filter_currencies(|status| status.is_unstable())
    }

    fn filter_currencies<F: Fn(&StabilityStatus) -> bool>(&self, keep: F) -> Vec<CurrencyCode> {
        self.currencies
            .values()
            .filter(|info| keep(&info.status))
            .map(|info| info.currency.clone())
            .collect()
    }

    pub fn all(&self) -> &BTreeMap<CurrencyCode, CurrencyStabilityInfo> {
        &self.currencies
    }

    pub fn counts(&self) -> StabilityCounts {
        let mut counts = StabilityCounts::default();
        for info in self.currencies.values() {
            match info.status {
                StabilityStatus::Stable => counts.stable += 1,
                StabilityStatus::Unstable { .. } => counts.unstable += 1,
                StabilityStatus::Inactive => counts.inactive += 1,
                StabilityStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    /// Whether a block at `height` must carry stabilization transactions,
    /// judged from the stored state alone.
    pub fn should_trigger(&self, height: u64) -> bool {
        self.currencies.values().any(|info| match info.status {
            StabilityStatus::Unstable { since } => since <= height,
            _ => false,
        })
    }

    /// Replace the whole map, e.g. after loading from disk or a reorg.
    pub fn restore(&mut self, currencies: BTreeMap<CurrencyCode, CurrencyStabilityInfo>) {
        self.currencies = currencies;
    }
}
