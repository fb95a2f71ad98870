use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use stock_forecast::config::{Config, LoggingConfig};
use stock_forecast::forecaster::Forecaster;
use stock_forecast::market_data::{MarketDataProvider, YahooChartClient};
use stock_forecast::pipeline::{Pipeline, StageSummary};
use stock_forecast::registry::{ArtifactLayout, ModelRegistry};
use stock_forecast::server::{self, AppState};

/// Per-ticker LSTM price forecasting.
#[derive(Debug, Parser)]
#[command(name = "stock-forecast", version, about)]
struct Cli {
    /// Config file; falls back to STOCK_FORECAST_CONFIG, then config/default.toml.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch history for every configured ticker and stage train/test splits.
    Ingest,
    /// Fit scalers and train a model per staged dataset.
    Train,
    /// Score best checkpoints on their test partitions.
    Evaluate,
    /// Ingest, train and evaluate in one go.
    Run,
    /// Predict the next close for a symbol.
    Predict { symbol: String },
    /// Roll a forecast forward for a symbol.
    Forecast {
        symbol: String,
        #[arg(long)]
        horizon: Option<usize>,
    },
    /// Serve predictions over HTTP.
    Serve {
        /// Overrides serving.bind.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    init_tracing(&config.logging)?;

    let provider: Arc<dyn MarketDataProvider> = Arc::new(YahooChartClient::new(
        &config.market_data.base_url,
        Duration::from_millis(config.market_data.timeout_ms),
    )?);
    let layout = ArtifactLayout::new(
        &config.artifacts.root,
        &config.data_ingestion.specialized_symbols(),
    );
    let registry = Arc::new(ModelRegistry::new(layout));

    match cli.command {
        Command::Ingest => {
            let pipeline = Pipeline::new(config, provider, registry)?;
            report("ingest", &pipeline.ingest_all().await?);
        }
        Command::Train => {
            let pipeline = Arc::new(Pipeline::new(config, provider, registry)?);
            report("train", &run_training(pipeline).await?);
        }
        Command::Evaluate => {
            let pipeline = Arc::new(Pipeline::new(config, provider, registry)?);
            let summary = tokio::task::spawn_blocking(move || pipeline.evaluate_all()).await??;
            report("evaluate", &summary);
        }
        Command::Run => {
            let pipeline = Arc::new(Pipeline::new(config, provider, registry)?);
            report("ingest", &pipeline.ingest_all().await?);
            report("train", &run_training(Arc::clone(&pipeline)).await?);
            let summary = tokio::task::spawn_blocking(move || pipeline.evaluate_all()).await??;
            report("evaluate", &summary);
        }
        Command::Predict { symbol } => {
            let forecaster = build_forecaster(&config, provider, registry);
            let resp = forecaster.get_prediction(&symbol).await;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            if resp.error.is_some() {
                std::process::exit(2);
            }
        }
        Command::Forecast { symbol, horizon } => {
            let horizon = horizon.unwrap_or(config.serving.default_horizon);
            let forecaster = build_forecaster(&config, provider, registry);
            let resp = forecaster.get_forecast(&symbol, horizon).await;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            if resp.error.is_some() {
                std::process::exit(2);
            }
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.serving.bind.clone());
            let state = AppState {
                forecaster: Arc::new(build_forecaster(&config, provider, registry)),
                default_horizon: config.serving.default_horizon,
            };
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {}", bind))?;
            server::serve(listener, state).await?;
        }
    }
    Ok(())
}

fn build_forecaster(
    config: &Config,
    provider: Arc<dyn MarketDataProvider>,
    registry: Arc<ModelRegistry>,
) -> Forecaster {
    Forecaster::new(
        registry,
        provider,
        Duration::from_millis(config.market_data.timeout_ms),
        config.market_data.lookback_days.unsigned_abs(),
    )
}

async fn run_training(pipeline: Arc<Pipeline>) -> Result<StageSummary> {
    let summary = tokio::task::spawn_blocking(move || pipeline.train_all()).await??;
    Ok(summary)
}

fn report(stage: &str, summary: &StageSummary) {
    tracing::info!(
        stage,
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "Stage finished"
    );
    println!(
        "{}: {} ok, {} failed",
        stage,
        summary.succeeded.len(),
        summary.failed.len()
    );
    for (key, err) in &summary.failed {
        println!("  {}: {}", key, err);
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        logging
            .level
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });

    let (writer, ansi) = match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        bail!("failed to install tracing subscriber: {}", e);
    }
    Ok(())
}
