// Copyright (c) 2024 Botho Foundation

//! Mint amount and recipient count for an unstable currency.
//!
//! ## Amount
//!
//! ```text
//! volume_difference = transfer_volume × ratio
//! total_coins       = volume_difference × factor(ratio, duration)
//!                     clamped to [min_reward, max_reward × max_recipients]
//! ```
//!
//! The factor grows with the severity of the deviation and is capped at 1.0:
//!
//! | ratio       | factor                  |
//! |-------------|-------------------------|
//! | <= 0.10     | 0.10                    |
//! | <= 0.15     | 0.10 + 2 × (r − 0.10)   |
//! | <= 0.25     | 0.20 + 2 × (r − 0.15)   |
//! | <= 0.40     | 0.40 + 2 × (r − 0.25)   |
//! | <= 0.60     | 0.70 + (r − 0.40)       |
//! | above       | 1.00                    |
//!
//! Currencies that stay unstable for more than a week get up to 0.10 extra,
//! one hundredth per additional day.
//!
//! All arithmetic is integer parts-per-million so every node computes the
//! same amounts.
//!
//! ## Recipients
//!
//! The recipient count is the smallest `R` with `total / R <= target_reward`.
//! Since `min_reward <= target_reward <= max_reward` the per-recipient share
//! always stays inside the reward band.

use tracing::debug;

use crate::block::Block;
use crate::currency::{CurrencyCode, CurrencyStabilityInfo, StabilityStatus};
use crate::params::{StabilizationParams, PPM};

/// Outcome of the mint calculation for one currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintPlan {
    pub currency: CurrencyCode,
    /// Total smallest units to mint
    pub total_coins: u64,
    /// Number of recipients the total is split between
    pub recipient_count: u64,
    /// Deviation used for the calculation
    pub ratio_ppm: u64,
    /// Severity factor applied
    pub factor_ppm: u64,
}

/// Computes how much to mint and for how many recipients.
#[derive(Debug, Clone)]
pub struct CoinMintCalculator {
    params: StabilizationParams,
}

impl CoinMintCalculator {
    pub fn new(params: StabilizationParams) -> Self {
        Self { params }
    }

    /// Mint plan for `info` in `block` at `height`.
    ///
    /// Returns `None` unless the currency is UNSTABLE and the block carries
    /// transfer volume in it.
    pub fn calculate_mint(
        &self,
        info: &CurrencyStabilityInfo,
        block: &Block,
        height: u64,
    ) -> Option<MintPlan> {
        let since = match info.status {
            StabilityStatus::Unstable { since } => since,
            _ => return None,
        };

        let ratio_ppm = info.ratio_ppm();
        let volume = block.currency_volume(&info.currency);
        let volume_difference = self.volume_difference(volume, ratio_ppm);
        if volume_difference == 0 {
            debug!(currency = %info.currency, height, "No volume difference, nothing to mint");
            return None;
        }

        let factor_ppm = self.dynamic_factor_ppm(ratio_ppm, height.saturating_sub(since));
        let raw = mul_ppm(volume_difference, factor_ppm);
        let (total_coins, recipient_count) = self.optimal_recipient_count(raw);

        debug!(
            currency = %info.currency,
            height,
            volume,
            volume_difference,
            factor_ppm,
            total_coins,
            recipient_count,
            "Calculated stabilization mint"
        );

        Some(MintPlan {
            currency: info.currency.clone(),
            total_coins,
            recipient_count,
            ratio_ppm,
            factor_ppm,
        })
    }

    /// Value gap between `volume` at the observed price and at peg.
    pub fn volume_difference(&self, volume: u64, ratio_ppm: u64) -> u64 {
        mul_ppm(volume, ratio_ppm)
    }

    /// Severity factor for a deviation of `ratio_ppm` that has lasted
    /// `unstable_blocks` blocks.
    pub fn dynamic_factor_ppm(&self, ratio_ppm: u64, unstable_blocks: u64) -> u64 {
        let base = match ratio_ppm {
            r if r <= 100_000 => 100_000,
            r if r <= 150_000 => 100_000 + (r - 100_000) * 2,
            r if r <= 250_000 => 200_000 + (r - 150_000) * 2,
            r if r <= 400_000 => 400_000 + (r - 250_000) * 2,
            r if r <= 600_000 => 700_000 + (r - 400_000),
            _ => PPM,
        };

        let days = unstable_blocks / self.params.blocks_per_day;
        let bonus = if days > self.params.duration_bonus_after_days {
            ((days - self.params.duration_bonus_after_days) * 10_000).min(100_000)
        } else {
            0
        };

        (base + bonus).min(PPM)
    }

    /// Clamp `total` to the mintable range and pick the recipient count.
    ///
    /// Returns `(total, recipients)`.
    pub fn optimal_recipient_count(&self, total: u64) -> (u64, u64) {
        let p = &self.params;
        let total = total.clamp(p.min_reward, p.max_total());
        let recipients = total.div_ceil(p.target_reward).clamp(1, p.max_recipients);

        // Only reachable with a target below max_reward and a total above
        // target × max_recipients.
        let recipients = if total / recipients > p.max_reward {
            total.div_ceil(p.max_reward).min(p.max_recipients)
        } else {
            recipients
        };

        (total, recipients)
    }

    /// Final total once the actual number of recipients is known.
    ///
    /// Caps the total at `max_reward` per recipient and drops the remainder
    /// when giving it to the first output would push that output over
    /// `max_reward`.
    pub fn finalize_total(&self, total: u64, recipients: u64) -> u64 {
        if recipients == 0 {
            return 0;
        }
        let total = total.min(self.params.max_reward.saturating_mul(recipients));
        let share = total / recipients;
        let remainder = total % recipients;
        if share + remainder > self.params.max_reward {
            total - remainder
        } else {
            total
        }
    }
}

fn mul_ppm(value: u64, ppm: u64) -> u64 {
    let product = value as u128 * ppm as u128 / PPM as u128;
    u64::try_from(product).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKey;
    use crate::transaction::{Transaction, TxOutput};

    fn calculator() -> CoinMintCalculator {
        CoinMintCalculator::new(StabilizationParams::default())
    }

    fn usd() -> CurrencyCode {
        "OUSD".parse().unwrap()
    }

    fn block_with_volume(volume: u64) -> Block {
        let tx = Transaction::transfer(
            vec![],
            vec![TxOutput {
                amount: volume,
                currency: usd(),
                recipient: IdentityKey([3; 32]),
            }],
        );
        Block::new([0u8; 32], 5200, 0, vec![tx], vec![])
    }

    fn unstable_info(price: f64, since: u64) -> CurrencyStabilityInfo {
        let mut info = CurrencyStabilityInfo::new(usd(), 0);
        info.observed_water_price = price;
        info.stability_ratio = (1.0 - price).abs();
        info.status = StabilityStatus::Unstable { since };
        info
    }

    #[test]
    fn test_factor_is_monotone_and_capped() {
        let calc = calculator();
        let mut last = 0;
        for ratio in (0..=1_000_000).step_by(5_000) {
            let factor = calc.dynamic_factor_ppm(ratio, 0);
            assert!(factor >= last, "factor decreased at {}", ratio);
            assert!(factor <= PPM);
            last = factor;
        }
        assert_eq!(calc.dynamic_factor_ppm(50_000, 0), 100_000);
        assert_eq!(calc.dynamic_factor_ppm(230_000, 0), 360_000);
        assert_eq!(calc.dynamic_factor_ppm(500_000, 0), 800_000);
        assert_eq!(calc.dynamic_factor_ppm(900_000, 0), PPM);
    }

    #[test]
    fn test_duration_bonus() {
        let calc = calculator();
        // 7 full days: no bonus yet
        assert_eq!(calc.dynamic_factor_ppm(230_000, 144 * 7), 360_000);
        // 10 days: 3 days over, +0.03
        assert_eq!(calc.dynamic_factor_ppm(230_000, 144 * 10), 390_000);
        // bonus capped at 0.10
        assert_eq!(calc.dynamic_factor_ppm(230_000, 144 * 100), 460_000);
        // total capped at 1.0
        assert_eq!(calc.dynamic_factor_ppm(700_000, 144 * 100), PPM);
    }

    #[test]
    fn test_example_mint_amount() {
        // 0.23 deviation since 4856, evaluated at 5200
        let plan = calculator()
            .calculate_mint(&unstable_info(1.23, 4856), &block_with_volume(1_449_279), 5200)
            .unwrap();
        assert_eq!(plan.ratio_ppm, 230_000);
        assert_eq!(plan.factor_ppm, 360_000);
        assert_eq!(plan.total_coins, 120_000);
        assert_eq!(plan.recipient_count, 24);
    }

    #[test]
    fn test_no_mint_unless_unstable_with_volume() {
        let calc = calculator();
        let mut stable = unstable_info(1.23, 10);
        stable.status = StabilityStatus::Stable;
        assert!(calc
            .calculate_mint(&stable, &block_with_volume(1_000_000), 500)
            .is_none());
        assert!(calc
            .calculate_mint(&unstable_info(1.23, 10), &block_with_volume(0), 500)
            .is_none());
    }

    #[test]
    fn test_small_difference_clamped_to_min_reward() {
        let plan = calculator()
            .calculate_mint(&unstable_info(1.5, 10), &block_with_volume(10), 500)
            .unwrap();
        assert_eq!(plan.total_coins, 100);
        assert_eq!(plan.recipient_count, 1);
    }

    #[test]
    fn test_optimal_recipient_count() {
        let calc = calculator();
        assert_eq!(calc.optimal_recipient_count(120_000), (120_000, 24));
        assert_eq!(calc.optimal_recipient_count(5_000), (5_000, 1));
        assert_eq!(calc.optimal_recipient_count(5_001), (5_001, 2));
        assert_eq!(calc.optimal_recipient_count(0), (100, 1));
        assert_eq!(
            calc.optimal_recipient_count(u64::MAX),
            (500_000_000, 50_000)
        );
    }

    #[test]
    fn test_target_at_max_gives_smallest_count() {
        let calc = CoinMintCalculator::new(StabilizationParams {
            target_reward: 10_000,
            ..Default::default()
        });
        assert_eq!(calc.optimal_recipient_count(120_000), (120_000, 12));
    }

    #[test]
    fn test_finalize_total() {
        let calc = calculator();
        assert_eq!(calc.finalize_total(120_000, 24), 120_000);
        // fewer recipients than planned: capped at max_reward each
        assert_eq!(calc.finalize_total(120_000, 3), 30_000);
        // remainder fits on the first output
        assert_eq!(calc.finalize_total(10_001, 2), 10_001);
        // remainder would overflow the first output
        assert_eq!(calc.finalize_total(29_999, 3), 29_997);
        assert_eq!(calc.finalize_total(1_000, 0), 0);
    }
}
