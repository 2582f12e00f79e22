// Copyright (c) 2024 Botho Foundation

//! Consensus parameters for stabilization mining.
//!
//! Every value in [`StabilizationParams`] is consensus-critical: two nodes
//! with different parameters will disagree on which blocks are valid.
//!
//! ## Units
//!
//! Amounts are in the smallest O unit. One O is [`O_COIN`] units, so the
//! default per-recipient band of 100..=10_000 is 1.00 O to 100.00 O.
//!
//! Ratios are integer parts-per-million so that consensus comparisons never
//! depend on floating point rounding:
//!
//! ```text
//! 0.10  ->  100_000 ppm
//! 0.23  ->  230_000 ppm
//! 1.00  -> 1_000_000 ppm
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest units per O.
pub const O_COIN: u64 = 100;

/// Fixed-point scale for ratios and factors.
pub const PPM: u64 = 1_000_000;

/// Expected water price in O units per liter. This is the peg itself.
pub const EXPECTED_WATER_PRICE: f64 = 1.0;

/// Convert a non-negative ratio to parts-per-million, rounding to nearest.
pub fn ratio_to_ppm(ratio: f64) -> u64 {
    if !ratio.is_finite() || ratio <= 0.0 {
        return 0;
    }
    (ratio * PPM as f64).round() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("reward band is inconsistent: min {min}, target {target}, max {max}")]
    RewardBand { min: u64, target: u64, max: u64 },

    #[error("stability threshold {0} ppm is not below 1_000_000")]
    Threshold(u64),
}

/// Stabilization consensus parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationParams {
    // === Classification ===
    /// Deviation above which a currency counts as deviating (ppm).
    pub stability_threshold_ppm: u64,

    /// Blocks a deviation must persist before the currency is UNSTABLE.
    pub unstable_time_range: u64,

    /// Blocks without an exchange-rate observation before INACTIVE.
    pub inactive_time_range: u64,

    /// Measurements required before STABLE/UNSTABLE can be decided.
    pub min_measurements: u64,

    // === Rewards ===
    /// Smallest per-recipient reward.
    pub min_reward: u64,

    /// Largest per-recipient reward.
    pub max_reward: u64,

    /// Per-recipient reward the recipient count aims for.
    /// Must lie inside `min_reward..=max_reward`.
    pub target_reward: u64,

    /// Upper bound on recipients (outputs) per stabilization transaction.
    pub max_recipients: u64,

    // === Severity ===
    /// Blocks per day, used for the long-instability bonus.
    pub blocks_per_day: u64,

    /// Days of instability after which the factor bonus starts.
    pub duration_bonus_after_days: u64,

    // === Ledger ===
    /// Depth before minted outputs become spendable.
    pub coinbase_maturity: u64,

    // === Oracle windows ===
    /// Averaging window for water prices (blocks).
    pub water_price_window: u64,

    /// Averaging window for exchange rates against O (blocks).
    pub exchange_rate_window: u64,
}

impl Default for StabilizationParams {
    fn default() -> Self {
        Self {
            stability_threshold_ppm: 100_000, // 10%
            unstable_time_range: 144,         // ~1 day at 10 min blocks
            inactive_time_range: 144 * 30,    // ~30 days
            min_measurements: 10,

            min_reward: O_COIN,          // 1.00 O
            max_reward: 100 * O_COIN,    // 100.00 O
            target_reward: 50 * O_COIN,  // 50.00 O
            max_recipients: 50_000,

            blocks_per_day: 144,
            duration_bonus_after_days: 7,

            coinbase_maturity: 100,

            water_price_window: 144 * 30,
            exchange_rate_window: 144 * 7,
        }
    }
}

impl StabilizationParams {
    /// Short time ranges for simulations and tests. Reward bounds are unchanged.
    pub fn fast_test() -> Self {
        Self {
            unstable_time_range: 6,
            inactive_time_range: 60,
            min_measurements: 3,
            blocks_per_day: 6,
            coinbase_maturity: 2,
            water_price_window: 12,
            exchange_rate_window: 6,
            ..Self::default()
        }
    }

    /// Largest total a single currency may mint in one block.
    pub fn max_total(&self) -> u64 {
        self.max_reward.saturating_mul(self.max_recipients)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let non_zero = [
            ("unstable_time_range", self.unstable_time_range),
            ("inactive_time_range", self.inactive_time_range),
            ("min_reward", self.min_reward),
            ("max_recipients", self.max_recipients),
            ("blocks_per_day", self.blocks_per_day),
            ("water_price_window", self.water_price_window),
            ("exchange_rate_window", self.exchange_rate_window),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ParamsError::Zero(name));
            }
        }

        if self.min_reward > self.target_reward || self.target_reward > self.max_reward {
            return Err(ParamsError::RewardBand {
                min: self.min_reward,
                target: self.target_reward,
                max: self.max_reward,
            });
        }

        if self.stability_threshold_ppm >= PPM {
            return Err(ParamsError::Threshold(self.stability_threshold_ppm));
        }

        Ok(())
    }
}
