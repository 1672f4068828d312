use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use dca_backtest_engine::batch::{self, BatchConfig, CancelToken, ParamRange};
use dca_backtest_engine::engine::{self, AlwaysAdmit};
use dca_backtest_engine::errors::EngineError;
use dca_backtest_engine::portfolio::{self, PortfolioConfig, SymbolSpec};
use dca_backtest_engine::types::{Bar, Params};

#[derive(Parser)]
#[command(name = "dca-backtest", about = "CLI for the DCA trailing-stop backtest engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single-symbol or multi-symbol backtest from a JSON config file.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Sweep a cartesian product of parameters over a single symbol.
    Batch {
        #[arg(long)]
        config: PathBuf,
    },
}

/// One symbol entry in a `run` config file. `prices_file` holds a JSON array
/// of `Bar`s (spec §3.1) -- the CLI never fetches prices itself.
#[derive(Deserialize)]
struct SymbolEntry {
    symbol: String,
    prices_file: PathBuf,
    #[serde(default)]
    params: serde_json::Value,
    join_date: Option<chrono::NaiveDate>,
    leave_date: Option<chrono::NaiveDate>,
}

#[derive(Deserialize)]
struct RunConfig {
    #[serde(default)]
    global_params: serde_json::Value,
    #[serde(default = "default_total_capital")]
    total_capital: Decimal,
    #[serde(default = "default_margin_fraction")]
    margin_fraction: Decimal,
    max_parallelism: Option<usize>,
    symbols: Vec<SymbolEntry>,
}

fn default_total_capital() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_margin_fraction() -> Decimal {
    Decimal::ZERO
}

#[derive(Deserialize)]
struct BatchFileConfig {
    symbol: String,
    prices_file: PathBuf,
    #[serde(default)]
    base_params: serde_json::Value,
    ranges: Vec<ParamRange>,
    max_parallelism: Option<usize>,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run { config } => run_cmd(&config),
        Commands::Batch { config } => batch_cmd(&config),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            let code = err.downcast_ref::<EngineError>().map(|e| e.exit_code()).unwrap_or(2);
            ExitCode::from(code as u8)
        }
    }
}

fn load_prices(path: &std::path::Path) -> Result<Vec<Bar>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading prices file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing prices file {}", path.display()))
}

fn build_params(global: &serde_json::Value, ticker_override: &serde_json::Value) -> Result<Params> {
    let empty = serde_json::Value::Object(serde_json::Map::new());
    let params = dca_backtest_engine::config::ParamBuilder::merge(global, &empty, ticker_override)?;
    params.validate()?;
    Ok(params)
}

fn run_cmd(config_path: &std::path::Path) -> Result<()> {
    let raw = fs::read_to_string(config_path).with_context(|| format!("reading config {}", config_path.display()))?;
    let config: RunConfig = serde_json::from_str(&raw).with_context(|| format!("parsing config {}", config_path.display()))?;

    if config.symbols.is_empty() {
        anyhow::bail!("config must list at least one symbol");
    }

    if config.symbols.len() == 1 && config.symbols[0].join_date.is_none() && config.symbols[0].leave_date.is_none() {
        let entry = &config.symbols[0];
        let series = load_prices(&entry.prices_file)?;
        let params = build_params(&config.global_params, &entry.params)?;
        let mut admit = AlwaysAdmit;
        let result = engine::run_single(&entry.symbol, &series, &params, &mut admit);
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let mut specs = Vec::with_capacity(config.symbols.len());
    for entry in &config.symbols {
        let series = load_prices(&entry.prices_file)?;
        let params = build_params(&config.global_params, &entry.params)?;
        specs.push(SymbolSpec {
            symbol: entry.symbol.clone(),
            series,
            params,
            join_date: entry.join_date,
            leave_date: entry.leave_date,
        });
    }

    let portfolio_config = PortfolioConfig {
        total_capital: config.total_capital,
        margin_fraction: config.margin_fraction,
        max_parallelism: config.max_parallelism.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
    };

    let result = portfolio::run_portfolio(specs, portfolio_config, &|| false).map_err(anyhow::Error::from)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn batch_cmd(config_path: &std::path::Path) -> Result<()> {
    let raw = fs::read_to_string(config_path).with_context(|| format!("reading config {}", config_path.display()))?;
    let config: BatchFileConfig = serde_json::from_str(&raw).with_context(|| format!("parsing config {}", config_path.display()))?;

    let series = load_prices(&config.prices_file)?;
    let base = build_params(&config.base_params, &serde_json::Value::Object(serde_json::Map::new()))?;

    let batch_config = BatchConfig { max_parallelism: config.max_parallelism };
    let cancel = CancelToken::new();

    let results = batch::run_batch(&config.symbol, &series, &base, &config.ranges, &batch_config, &cancel, &|done, total| {
        tracing::debug!(done, total, "batch progress");
    })
    .map_err(anyhow::Error::from)?;

    let top = batch::top_k(&results, config.top_k);
    println!("{}", serde_json::to_string_pretty(top)?);
    Ok(())
}
