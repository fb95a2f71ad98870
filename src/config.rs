use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const DEFAULT_START_DATE: &str = "2015-01-01";
pub const DEFAULT_END_DATE: &str = "2025-12-31";
/// Slack for market holidays on top of the five-in-seven trading week.
const HOLIDAY_MARGIN_DAYS: u64 = 14;

/// Calendar days of history needed to see at least `trading_days` sessions.
pub fn min_lookback_days(trading_days: usize) -> u64 {
    (trading_days as u64 * 7).div_ceil(5) + HOLIDAY_MARGIN_DAYS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data_ingestion: DataIngestionConfig,
    pub lstm_model: LstmModelConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataIngestionConfig {
    pub tickers: Vec<String>,
    pub test_size: f64,
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Rmsprop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Mse,
    Mae,
    Huber,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LstmModelConfig {
    pub units: usize,
    pub dropout: f64,
    pub activation: Activation,
    pub optimizer: OptimizerKind,
    pub loss: LossKind,
    pub epochs: usize,
    pub batch_size: usize,
    #[serde(default = "default_time_step")]
    pub time_step: usize,
    /// Overrides the optimizer's default step size.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Calendar days of history requested when serving a forecast.
    pub lookback_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactsConfig {
    pub root: PathBuf,
    pub history_db: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServingConfig {
    pub bind: String,
    pub default_horizon: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default()
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, 31).unwrap_or_default()
}

fn default_time_step() -> usize {
    60
}

fn default_clip_norm() -> f64 {
    5.0
}

fn default_seed() -> u64 {
    42
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query1.finance.yahoo.com".to_string(),
            timeout_ms: 10_000,
            lookback_days: 180,
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            history_db: PathBuf::from("data/price_history.sqlite"),
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            default_horizon: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl DataIngestionConfig {
    /// Upper-cased, trimmed, de-duplicated tickers in configured order.
    pub fn specialized_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sym in &self.tickers {
            let s = sym.trim().to_ascii_uppercase();
            if !s.is_empty() && !out.iter().any(|v| v == &s) {
                out.push(s);
            }
        }
        out
    }
}

impl Config {
    /// Resolve the config path from an explicit argument, then
    /// `STOCK_FORECAST_CONFIG`, then `config/default.toml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var("STOCK_FORECAST_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ingest = &self.data_ingestion;
        if ingest.specialized_symbols().is_empty() {
            bail!("data_ingestion.tickers must list at least one symbol");
        }
        if !(ingest.test_size > 0.0 && ingest.test_size < 1.0) {
            bail!(
                "data_ingestion.test_size must be in (0, 1), got {}",
                ingest.test_size
            );
        }
        if ingest.start_date >= ingest.end_date {
            bail!(
                "data_ingestion.start_date ({}) must be before end_date ({})",
                ingest.start_date,
                ingest.end_date
            );
        }

        let lstm = &self.lstm_model;
        if lstm.units == 0 {
            bail!("lstm_model.units must be > 0");
        }
        if !(0.0..1.0).contains(&lstm.dropout) {
            bail!("lstm_model.dropout must be in [0, 1), got {}", lstm.dropout);
        }
        if lstm.epochs == 0 {
            bail!("lstm_model.epochs must be > 0");
        }
        if lstm.batch_size == 0 {
            bail!("lstm_model.batch_size must be > 0");
        }
        if lstm.time_step == 0 {
            bail!("lstm_model.time_step must be > 0");
        }
        if let Some(lr) = lstm.learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                bail!("lstm_model.learning_rate must be a positive number, got {}", lr);
            }
        }
        if !(lstm.clip_norm.is_finite() && lstm.clip_norm > 0.0) {
            bail!("lstm_model.clip_norm must be a positive number");
        }

        if self.market_data.timeout_ms == 0 {
            bail!("market_data.timeout_ms must be > 0");
        }
        if self.market_data.lookback_days <= 0 {
            bail!("market_data.lookback_days must be > 0");
        }
        let needed = min_lookback_days(lstm.time_step);
        if self.market_data.lookback_days.unsigned_abs() < needed {
            bail!(
                "market_data.lookback_days ({}) cannot cover lstm_model.time_step ({}) trading days; need at least {}",
                self.market_data.lookback_days,
                lstm.time_step,
                needed
            );
        }
        if self.serving.default_horizon == 0 {
            bail!("serving.default_horizon must be > 0");
        }
        Ok(())
    }
}
