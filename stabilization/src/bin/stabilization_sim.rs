// Copyright (c) 2024 Botho Foundation

//! Stabilization Simulation Tool
//!
//! Drives the stabilization engine through a scripted price scenario and
//! persists the resulting state, so mints can be inspected afterwards.
//!
//! Usage:
//!   cargo run --bin stabilization-sim -- init --fast
//!   cargo run --bin stabilization-sim -- run --blocks 200
//!   cargo run --bin stabilization-sim -- status
//!   cargo run --bin stabilization-sim -- history OUSD --from 100

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use o_stabilization::config::{Config, CurrencyScenario};
use o_stabilization::identity::{IdentityKey, IdentitySet};
use o_stabilization::ledger::{CoinsCache, StabilizationStore};
use o_stabilization::oracle::{CommittedMeasurements, Measurement};
use o_stabilization::transaction::{TxInput, TxOutput, UtxoId};
use o_stabilization::{Block, ConsensusContext, CurrencyCode, Transaction};

#[derive(Parser)]
#[command(name = "stabilization-sim")]
#[command(
    about = "Simulate O stabilization mining over a scripted price scenario",
    long_about = None
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "stabilization.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Use the short fast-test windows
        #[arg(long)]
        fast: bool,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Produce and connect blocks, continuing from the stored tip
    Run {
        /// Number of blocks (defaults to the config's simulation.blocks)
        #[arg(short, long)]
        blocks: Option<u64>,
    },

    /// Show stored stability state and mint totals
    Status,

    /// List stabilization mints for a currency
    History {
        /// Currency code, e.g. OUSD
        currency: String,

        /// First height (inclusive)
        #[arg(long, default_value = "0")]
        from: u64,

        /// Last height (inclusive)
        #[arg(long)]
        to: Option<u64>,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init { fast, force } => init(&cli.config, fast, force),
        Commands::Run { blocks } => run(&cli.config, blocks),
        Commands::Status => status(&cli.config),
        Commands::History { currency, from, to } => {
            history(&cli.config, &currency, from, to.unwrap_or(u64::MAX))
        }
    }
}

fn init(config_path: &Path, fast: bool, force: bool) -> Result<()> {
    if Config::exists(config_path) && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config = if fast { Config::fast() } else { Config::default() };
    config.save(config_path)?;

    println!("Wrote {}", config_path.display());
    println!(
        "  {} currencies, {} blocks per run",
        config.simulation.currencies.len(),
        config.simulation.blocks
    );
    Ok(())
}

fn open_store(config: &Config, config_path: &Path) -> Result<StabilizationStore> {
    let data_dir = config.data_dir(config_path);
    StabilizationStore::open(&data_dir)
        .with_context(|| format!("Failed to open store in {}", data_dir.display()))
}

/// Deterministic identity key for the `index`th simulated user of `currency`.
fn identity_key(currency: &CurrencyCode, index: u32) -> IdentityKey {
    let mut hasher = Sha256::new();
    hasher.update(b"O_SIM_IDENTITY");
    hasher.update(currency.to_hash_bytes());
    hasher.update(index.to_le_bytes());
    IdentityKey(hasher.finalize().into())
}

fn registry(config: &Config) -> IdentitySet {
    let mut set = IdentitySet::new();
    for scenario in &config.simulation.currencies {
        for index in 0..config.simulation.identities_per_currency {
            set.insert(identity_key(&scenario.code, index), scenario.code.clone());
        }
    }
    set
}

fn measurements_at(scenarios: &[CurrencyScenario], height: u64) -> Vec<Measurement> {
    scenarios
        .iter()
        .map(|scenario| Measurement {
            currency: scenario.code.clone(),
            water_price: Some(scenario.water_price_at(height)),
            exchange_rate: scenario.exchange_rate_at(height),
        })
        .collect()
}

/// One transfer per currency, paying its first simulated user.
fn transfers_at(config: &Config, height: u64) -> Vec<Transaction> {
    config
        .simulation
        .currencies
        .iter()
        .map(|scenario| {
            let mut hasher = Sha256::new();
            hasher.update(b"O_SIM_FUNDING");
            hasher.update(scenario.code.to_hash_bytes());
            hasher.update(height.to_le_bytes());

            Transaction::transfer(
                vec![TxInput {
                    prev_out: UtxoId::new(hasher.finalize().into(), 0),
                }],
                vec![TxOutput {
                    amount: config.simulation.transfer_volume,
                    currency: scenario.code.clone(),
                    recipient: identity_key(&scenario.code, 0),
                }],
            )
        })
        .collect()
}

fn run(config_path: &Path, blocks: Option<u64>) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'init' first.")?;
    let store = open_store(&config, config_path)?;
    let scenarios = &config.simulation.currencies;

    let context = ConsensusContext::new(config.params.clone(), Arc::new(registry(&config)));
    context.restore(store.stability_map()?, store.records()?, store.mint_stats()?);

    let tip = store.tip_height()?.unwrap_or(0);
    let mut prev_hash = store.tip_hash()?.unwrap_or([0u8; 32]);

    // Measurements are a pure function of the scenario, so the committed
    // history below the tip can be regenerated.
    let mut oracle = CommittedMeasurements::new();
    for height in 1..=tip {
        for measurement in measurements_at(scenarios, height) {
            oracle.record(height, &measurement);
        }
    }
    let mut view = CoinsCache::from_coins(store.coins()?);

    let count = blocks.unwrap_or(config.simulation.blocks);
    info!(from = tip + 1, blocks = count, "Starting simulation");

    let mut minted_blocks = 0u64;
    for height in tip + 1..=tip + count {
        let template = Block::new(
            prev_hash,
            height,
            height * config.simulation.block_interval,
            transfers_at(&config, height),
            measurements_at(scenarios, height),
        );

        let block = context
            .prepare_block_template(&template, &oracle)
            .with_context(|| format!("Failed to build block {}", height))?;
        let undo = context
            .connect_block(&block, &mut view, &oracle)
            .map_err(|e| anyhow!("Block {} rejected ({}): {}", height, e.reject_reason(), e))?;
        oracle.record_block(&block);

        let records: Vec<_> = undo
            .records
            .iter()
            .filter_map(|tx_id| context.record(tx_id))
            .collect();
        if !records.is_empty() {
            minted_blocks += 1;
        }

        prev_hash = block.hash();
        store.commit_block(
            &prev_hash,
            &undo,
            &context.stability_snapshot(),
            &records,
            &view.take_changes(),
            &context.mint_stats(),
        )?;
    }

    let stats = context.mint_stats();
    let counts = context.stability_counts();
    println!();
    println!("=== Simulation ===");
    println!("  Blocks: {} -> {}", tip + 1, tip + count);
    println!("  Blocks with stabilization: {}", minted_blocks);
    println!(
        "  Currencies: {} stable, {} unstable, {} inactive, {} unknown",
        counts.stable, counts.unstable, counts.inactive, counts.unknown
    );
    println!(
        "  Total minted: {} in {} transactions",
        stats.total_coins_created, stats.total_transactions
    );
    for (currency, coins) in &stats.coins_by_currency {
        println!("    {}: {}", currency, coins);
    }
    println!();
    Ok(())
}

fn status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'init' first.")?;
    let store = open_store(&config, config_path)?;

    let Some(tip) = store.tip_height()? else {
        println!("No blocks yet. Run 'run' first.");
        return Ok(());
    };

    println!();
    println!("=== Stabilization Status ===");
    println!();
    println!("Chain:");
    println!("  Height: {}", tip);
    if let Some(hash) = store.tip_hash()? {
        println!("  Tip hash: {}", hex::encode(&hash[0..8]));
    }
    println!();
    println!("Currencies:");
    println!(
        "  {:<8} {:<20} {:>12} {:>10} {:>8}",
        "Code", "Status", "Water price", "Ratio", "Samples"
    );
    for info in store.stability_map()?.values() {
        println!(
            "  {:<8} {:<20} {:>12.4} {:>9.2}% {:>8}",
            info.currency,
            info.status.to_string(),
            info.observed_water_price,
            info.stability_ratio * 100.0,
            info.measurement_count
        );
    }

    let stats = store.mint_stats()?;
    println!();
    println!("Minting:");
    println!("  Transactions: {}", stats.total_transactions);
    println!("  Recipients paid: {}", stats.total_recipients);
    println!("  Coins created: {}", stats.total_coins_created);
    for (currency, coins) in &stats.coins_by_currency {
        println!("    {}: {}", currency, coins);
    }
    println!();
    Ok(())
}

fn history(config_path: &Path, currency: &str, from: u64, to: u64) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'init' first.")?;
    let store = open_store(&config, config_path)?;
    let currency: CurrencyCode = currency.parse()?;

    let records = store.history(&currency, from, to)?;
    if records.is_empty() {
        println!("No stabilization mints for {}", currency);
        return Ok(());
    }

    println!(
        "{:>8} {:<18} {:>10} {:>10} {:>8}",
        "Height", "Tx", "Coins", "Recipients", "Ratio"
    );
    for record in &records {
        println!(
            "{:>8} {:<18} {:>10} {:>10} {:>7.2}%",
            record.block_height,
            hex::encode(&record.tx_id[0..8]),
            record.coins_created,
            record.recipients.len(),
            record.deviation_ratio_ppm as f64 / 10_000.0
        );
    }
    Ok(())
}
