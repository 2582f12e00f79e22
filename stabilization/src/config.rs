use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::currency::CurrencyCode;
use crate::params::StabilizationParams;

/// Configuration for the stabilization simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Consensus parameters
    #[serde(default)]
    pub params: StabilizationParams,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `stabilization.mdb`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("stabilization-data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Blocks to produce per `run`
    #[serde(default = "default_blocks")]
    pub blocks: u64,

    /// Verified identities created for each currency
    #[serde(default = "default_identities")]
    pub identities_per_currency: u32,

    /// Transfer volume per currency per block, in base units
    #[serde(default = "default_transfer_volume")]
    pub transfer_volume: u64,

    /// Seconds between blocks
    #[serde(default = "default_block_interval")]
    pub block_interval: u64,

    #[serde(default = "default_currencies")]
    pub currencies: Vec<CurrencyScenario>,
}

/// Price path of one simulated currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyScenario {
    pub code: CurrencyCode,

    /// Water price until `drift_start`
    #[serde(default = "default_price")]
    pub water_price: f64,

    #[serde(default = "default_price")]
    pub exchange_rate: f64,

    /// Height from which the water price is `drift_price`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_start: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_price: Option<f64>,

    /// Height from which the water price is back at `water_price`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover_at: Option<u64>,

    /// Height from which no more exchange rates are reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rates_stop_at: Option<u64>,
}

impl CurrencyScenario {
    pub fn stable(code: CurrencyCode) -> Self {
        Self {
            code,
            water_price: default_price(),
            exchange_rate: default_price(),
            drift_start: None,
            drift_price: None,
            recover_at: None,
            rates_stop_at: None,
        }
    }

    /// Water price reported at `height`.
    pub fn water_price_at(&self, height: u64) -> f64 {
        let drifting = self.drift_start.is_some_and(|start| height >= start)
            && !self.recover_at.is_some_and(|end| height >= end);
        match (drifting, self.drift_price) {
            (true, Some(price)) => price,
            _ => self.water_price,
        }
    }

    /// Exchange rate reported at `height`, if any.
    pub fn exchange_rate_at(&self, height: u64) -> Option<f64> {
        match self.rates_stop_at {
            Some(stop) if height >= stop => None,
            _ => Some(self.exchange_rate),
        }
    }
}

fn default_blocks() -> u64 {
    400
}

fn default_identities() -> u32 {
    20
}

fn default_transfer_volume() -> u64 {
    1_449_279
}

fn default_block_interval() -> u64 {
    600
}

fn default_price() -> f64 {
    1.0
}

fn default_currencies() -> Vec<CurrencyScenario> {
    // (code, drift start, drift price)
    let table: [(&str, Option<u64>, Option<f64>); 3] = [
        ("OEUR", None, None),
        ("OJPY", None, None),
        ("OUSD", Some(20), Some(1.23)),
    ];
    table
        .into_iter()
        .filter_map(|(code, drift_start, drift_price)| {
            let code = code.parse().ok()?;
            Some(CurrencyScenario {
                drift_start,
                drift_price,
                ..CurrencyScenario::stable(code)
            })
        })
        .collect()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            blocks: default_blocks(),
            identities_per_currency: default_identities(),
            transfer_volume: default_transfer_volume(),
            block_interval: default_block_interval(),
            currencies: default_currencies(),
        }
    }
}

impl Config {
    /// Config with the short fast-test windows, for quick local runs.
    pub fn fast() -> Self {
        Self {
            params: StabilizationParams::fast_test(),
            simulation: SimulationConfig {
                blocks: 60,
                ..SimulationConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate().context("Invalid consensus parameters")?;

        let sim = &self.simulation;
        if sim.currencies.is_empty() {
            return Err(anyhow!("simulation needs at least one currency"));
        }
        if sim.identities_per_currency == 0 {
            return Err(anyhow!("identities_per_currency must be positive"));
        }

        let mut seen = BTreeSet::new();
        for scenario in &sim.currencies {
            if scenario.code == CurrencyCode::base() {
                return Err(anyhow!("the base unit {} cannot be simulated", scenario.code));
            }
            if !seen.insert(&scenario.code) {
                return Err(anyhow!("currency {} listed twice", scenario.code));
            }
            let prices = [
                Some(scenario.water_price),
                Some(scenario.exchange_rate),
                scenario.drift_price,
            ];
            if prices.iter().flatten().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err(anyhow!("{} has a non-positive price", scenario.code));
            }
        }
        Ok(())
    }

    /// Path of the LMDB directory, relative paths resolved against the
    /// config file's directory.
    pub fn data_dir(&self, config_path: &Path) -> PathBuf {
        if self.storage.data_dir.is_absolute() {
            return self.storage.data_dir.clone();
        }
        config_path
            .parent()
            .unwrap_or(config_path)
            .join(&self.storage.data_dir)
    }
}
