use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate};

use crate::config::min_lookback_days;
use crate::error::{ForecastError, Result};
use crate::market_data::MarketDataProvider;
use crate::model::forecast::{
    Forecast, ForecastPoint, ForecastResponse, Prediction, PredictionResponse, UnavailableReason,
};
use crate::model::symbol::normalize_symbol;
use crate::network::{column_window, LstmRegressor};
use crate::registry::{ArtifactLookup, LoadedArtifacts, ModelRegistry};

/// Longest rollout served in one request.
pub const MAX_HORIZON: usize = 365;

/// Serving-side inference over registry artifacts and live market data.
pub struct Forecaster {
    registry: Arc<ModelRegistry>,
    provider: Arc<dyn MarketDataProvider>,
    fetch_timeout: Duration,
    lookback_days: u64,
}

/// Artifacts plus the most recent unscaled closes that fill one window.
struct ServingInput {
    symbol: String,
    artifacts: Arc<LoadedArtifacts>,
    window_prices: Vec<f64>,
}

impl Forecaster {
    pub fn new(
        registry: Arc<ModelRegistry>,
        provider: Arc<dyn MarketDataProvider>,
        fetch_timeout: Duration,
        lookback_days: u64,
    ) -> Self {
        Self {
            registry,
            provider,
            fetch_timeout,
            lookback_days,
        }
    }

    /// Closes from a window wide enough to hold `window_length` sessions,
    /// even if the artifact was trained with a longer window than configured.
    async fn recent_closes(&self, symbol: &str, window_length: usize) -> Result<Vec<f64>> {
        let lookback = self.lookback_days.max(min_lookback_days(window_length));
        let end = Local::now()
            .date_naive()
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ForecastError::Config("date out of range".to_string()))?;
        let start = end
            .checked_sub_days(Days::new(lookback))
            .ok_or_else(|| ForecastError::Config("lookback out of range".to_string()))?;

        let fetch = self.provider.fetch_history(symbol, start, end);
        let mut bars = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(ForecastError::Timeout {
                    millis: self.fetch_timeout.as_millis() as u64,
                })
            }
        };
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Ok(bars.iter().map(|b| b.close).collect())
    }

    async fn prepare(&self, symbol: &str) -> Result<ServingInput> {
        let symbol = normalize_symbol(symbol)?;
        let artifacts = match self.registry.load(&symbol)? {
            ArtifactLookup::Found(artifacts) => artifacts,
            ArtifactLookup::NotFound { key, .. } => {
                return Err(ForecastError::ArtifactNotFound { key });
            }
        };

        // The serving pipeline feeds closes only.
        let model_width = artifacts.model.input_features();
        if model_width != 1 || artifacts.scaler.feature_count() != 1 {
            return Err(ForecastError::ShapeMismatch {
                key: artifacts.key.clone(),
                expected: model_width,
                actual: 1,
            });
        }

        let window_length = artifacts.window_length();
        let closes = self.recent_closes(&symbol, window_length).await.map_err(|e| {
            tracing::warn!(symbol = %symbol, error = %e, "Market data unavailable");
            e
        })?;
        if closes.len() < window_length {
            return Err(ForecastError::NotEnoughData {
                key: symbol,
                required: window_length,
                available: closes.len(),
            });
        }
        let window_prices = closes[closes.len() - window_length..].to_vec();
        Ok(ServingInput {
            symbol,
            artifacts,
            window_prices,
        })
    }

    /// One step ahead from the latest `window_length` closes. Conditions that
    /// only make this symbol unservable come back as `Unavailable`.
    pub async fn predict_next(&self, symbol: &str) -> Result<Prediction> {
        let input = match self.prepare(symbol).await {
            Ok(input) => input,
            Err(e) if e.is_unavailable() => return Ok(Prediction::Unavailable(e.into())),
            Err(e) => return Err(e),
        };
        let scaled = input.artifacts.scaler.transform_series(&input.window_prices)?;
        let artifacts = Arc::clone(&input.artifacts);
        let scaled_next = run_blocking(move || rollout(&artifacts.model.network, &scaled, 1)).await?;
        let price = match scaled_next.first() {
            Some(&s) => input.artifacts.scaler.inverse_value(0, s)?,
            None => {
                return Ok(Prediction::Unavailable(UnavailableReason::Internal {
                    detail: "model produced no output".to_string(),
                }))
            }
        };
        tracing::debug!(symbol = %input.symbol, key = %input.artifacts.key, price, "Prediction ready");
        Ok(Prediction::Available {
            symbol: input.symbol,
            model_key: input.artifacts.key.clone(),
            price,
            window_prices: input.window_prices,
        })
    }

    /// Autoregressive rollout of `horizon` daily steps dated from today.
    pub async fn predict_horizon(&self, symbol: &str, horizon: usize) -> Result<Forecast> {
        check_horizon(horizon)?;
        let input = self.prepare(symbol).await?;
        let scaled = input.artifacts.scaler.transform_series(&input.window_prices)?;
        let artifacts = Arc::clone(&input.artifacts);
        let scaled_path = run_blocking(move || rollout(&artifacts.model.network, &scaled, horizon)).await?;
        let prices = input.artifacts.scaler.inverse_series(&scaled_path)?;
        let dates = forecast_dates(Local::now().date_naive(), horizon)?;

        Ok(Forecast {
            symbol: input.symbol,
            model_key: input.artifacts.key.clone(),
            points: dates
                .into_iter()
                .zip(prices)
                .map(|(date, price)| ForecastPoint { date, price })
                .collect(),
        })
    }

    pub async fn get_prediction(&self, symbol: &str) -> PredictionResponse {
        let shown = symbol.trim().to_ascii_uppercase();
        match self.predict_next(symbol).await {
            Ok(Prediction::Available {
                symbol,
                model_key,
                price,
                window_prices,
            }) => PredictionResponse {
                symbol,
                prediction: Some(price),
                confidence: Some(confidence_score(&window_prices, price)),
                model_key: Some(model_key),
                error: None,
            },
            Ok(Prediction::Unavailable(reason)) => PredictionResponse {
                symbol: shown,
                prediction: None,
                confidence: None,
                model_key: None,
                error: Some(reason.to_string()),
            },
            Err(e) => {
                tracing::warn!(symbol = %shown, error = %e, "Prediction failed");
                PredictionResponse {
                    symbol: shown,
                    prediction: None,
                    confidence: None,
                    model_key: None,
                    error: Some(UnavailableReason::from(e).to_string()),
                }
            }
        }
    }

    pub async fn get_forecast(&self, symbol: &str, horizon: usize) -> ForecastResponse {
        let shown = symbol.trim().to_ascii_uppercase();
        let failed = |symbol: String, error: String| ForecastResponse {
            symbol,
            dates: Vec::new(),
            prices: Vec::new(),
            error: Some(error),
        };
        match self.predict_horizon(symbol, horizon).await {
            Ok(forecast) => ForecastResponse {
                dates: forecast
                    .dates()
                    .iter()
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .collect(),
                prices: forecast.prices(),
                symbol: forecast.symbol,
                error: None,
            },
            Err(e) => {
                if !e.is_unavailable() && !matches!(e, ForecastError::InvalidHorizon { .. }) {
                    tracing::warn!(symbol = %shown, horizon, error = %e, "Forecast failed");
                }
                failed(shown, UnavailableReason::from(e).to_string())
            }
        }
    }
}

impl From<ForecastError> for UnavailableReason {
    fn from(e: ForecastError) -> Self {
        match e {
            ForecastError::ArtifactNotFound { key } => Self::ArtifactNotFound { key },
            ForecastError::NotEnoughData {
                required, available, ..
            } => Self::NotEnoughData {
                required,
                available,
            },
            ForecastError::ShapeMismatch {
                expected, actual, ..
            } => Self::ShapeMismatch { expected, actual },
            ForecastError::InvalidHorizon { horizon, max } => Self::InvalidHorizon { horizon, max },
            e @ (ForecastError::UpstreamFetch(_) | ForecastError::Timeout { .. } | ForecastError::Http(_)) => {
                Self::UpstreamFailure {
                    detail: e.to_string(),
                }
            }
            other => Self::Internal {
                detail: other.to_string(),
            },
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ForecastError::Config(format!("inference task failed: {}", e)))?
}

pub fn check_horizon(horizon: usize) -> Result<()> {
    if horizon == 0 || horizon > MAX_HORIZON {
        return Err(ForecastError::InvalidHorizon {
            horizon,
            max: MAX_HORIZON,
        });
    }
    Ok(())
}

/// Feed each scaled prediction back into the window (oldest value dropped)
/// and return the `horizon` scaled predictions in order.
pub fn rollout(model: &LstmRegressor, scaled_window: &[f64], horizon: usize) -> Result<Vec<f64>> {
    if scaled_window.is_empty() {
        return Err(ForecastError::NotEnoughData {
            key: "rollout".to_string(),
            required: 1,
            available: 0,
        });
    }
    if model.input_features() != 1 {
        return Err(ForecastError::ShapeMismatch {
            key: "rollout".to_string(),
            expected: model.input_features(),
            actual: 1,
        });
    }

    let mut window = scaled_window.to_vec();
    let mut out = Vec::with_capacity(horizon);
    for _ in 0..horizon {
        let next = model.predict(column_window(&window).view())?;
        out.push(next);
        window.remove(0);
        window.push(next);
    }
    Ok(out)
}

/// Calendar days `start + 1 ..= start + horizon`; weekends and holidays are
/// not skipped.
pub fn forecast_dates(start: NaiveDate, horizon: usize) -> Result<Vec<NaiveDate>> {
    (1..=horizon as u64)
        .map(|i| {
            start
                .checked_add_days(Days::new(i))
                .ok_or_else(|| ForecastError::Config(format!("{} + {} days overflows", start, i)))
        })
        .collect()
}

/// Heuristic in `[0, 100]`: 100 minus the window's population std-dev as a
/// percentage of the prediction. Not a statistical interval.
pub fn confidence_score(window_prices: &[f64], prediction: f64) -> f64 {
    if window_prices.is_empty() || !prediction.is_finite() || prediction <= 0.0 {
        return 0.0;
    }
    let n = window_prices.len() as f64;
    let mean = window_prices.iter().sum::<f64>() / n;
    let var = window_prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    (100.0 - var.sqrt() / prediction * 100.0).clamp(0.0, 100.0)
}
