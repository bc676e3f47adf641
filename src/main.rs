use anyhow::{Context, Result};
use chrono::{Duration, Local};
use clap::Parser;
use frontier_mc::config::{self, AppConfig, DEFAULT_SAMPLES, DEFAULT_WEBUI_PORT};
use frontier_mc::data::{check_window, parse_date};
use frontier_mc::portfolio::{self, PortfolioSimulator, SimulationConfig, WeightSampling};
use frontier_mc::provider::{PriceProvider, Provider};
use frontier_mc::repository::{MissingSymbolPolicy, PriceRepository};
use frontier_mc::Symbol;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "frontier-mc: Monte Carlo efficient frontier for a basket of stocks",
    after_help = "EXAMPLES:
    # Optimize over one year of prices
    cargo run --release -- --symbols AAPL,MSFT,GOOG --start 2023-01-01 --end 2023-12-31

    # Reproducible run with CSV export
    cargo run --release -- --symbols SPY,TLT,GLD --seed 42 --csv frontier.csv

    # Launch the HTTP API
    cargo run --release -- --webui --webui-port 8080"
)]
struct Args {
    /// Comma-separated ticker symbols (e.g., AAPL,MSFT,GOOG)
    #[arg(long)]
    symbols: Option<String>,

    /// First date of the window, YYYY-MM-DD (default: one year before --end)
    #[arg(long)]
    start: Option<String>,

    /// Last date of the window, YYYY-MM-DD (default: today)
    #[arg(long)]
    end: Option<String>,

    /// Number of random portfolios (100..=10000)
    #[arg(long, default_value_t = DEFAULT_SAMPLES)]
    samples: usize,

    /// Annual risk-free rate as a fraction (0.04 = 4%)
    #[arg(long, default_value_t = 0.0)]
    risk_free_rate: f64,

    /// RNG seed for reproducible runs. Overrides FRONTIER_SEED.
    #[arg(long)]
    seed: Option<u64>,

    /// Weight sampler (dirichlet|normalized). Overrides FRONTIER_SAMPLER.
    #[arg(long)]
    sampler: Option<WeightSampling>,

    /// Fail when a symbol has no data instead of dropping it
    #[arg(long)]
    abort_on_missing: bool,

    /// Write the full metrics table to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Print the result as JSON instead of the summary box
    #[arg(long)]
    json: bool,

    /// Launch in WebUI mode
    #[arg(long)]
    webui: bool,

    /// WebUI server port
    #[arg(long, default_value_t = DEFAULT_WEBUI_PORT)]
    webui_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frontier_mc=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    config::init_cpu_parallelism();
    let args = Args::parse();

    let mut app_config = AppConfig::from_env();
    if args.abort_on_missing {
        app_config.repository.missing_symbols = MissingSymbolPolicy::Abort;
    }
    if let Some(sampling) = args.sampler {
        app_config.sampling = sampling;
    }
    if args.seed.is_some() {
        app_config.seed = args.seed;
    }

    if args.webui {
        return frontier_mc::webui::run_webui_server(args.webui_port, app_config).await;
    }

    run_cli(&args, app_config).await
}

async fn run_cli(args: &Args, app_config: AppConfig) -> Result<()> {
    let raw_symbols = args
        .symbols
        .as_deref()
        .context("--symbols is required unless --webui is set (e.g. --symbols AAPL,MSFT)")?;
    let symbols = Symbol::parse_list(raw_symbols)?;

    let end = match args.end.as_deref() {
        Some(raw) => parse_date("end date", raw)?,
        None => Local::now().date_naive(),
    };
    let start = match args.start.as_deref() {
        Some(raw) => parse_date("start date", raw)?,
        None => end - Duration::days(365),
    };
    check_window(start, end)?;

    let mut sim_config = SimulationConfig::new(args.samples, args.risk_free_rate)
        .with_sampling(app_config.sampling);
    if let Some(seed) = app_config.seed {
        sim_config = sim_config.with_seed(seed);
    }
    sim_config.validate()?;

    let provider = Provider::from_config(&app_config)?;
    info!(
        "Loading {} symbols from {} for {} → {}",
        symbols.len(),
        provider.name(),
        start,
        end
    );
    let repository = PriceRepository::new(provider, app_config.repository.clone());
    let table = repository
        .load(&symbols, start, end)
        .await
        .context("Failed to load price history")?;

    let result = PortfolioSimulator::new(sim_config)
        .simulate(&table)
        .context("Portfolio simulation failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        portfolio::print_summary(&result, &table);
    }

    if let Some(path) = &args.csv {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        portfolio::write_metrics_csv(&result, BufWriter::new(file))?;
        info!("Wrote {} portfolios to {}", result.samples.len(), path.display());
    }

    Ok(())
}
