use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// Output of an autoregressive rollout. Each step feeds on the previous
/// prediction, so error compounds with distance from the last observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub symbol: String,
    /// Artifact key the model came from (`generalized` for fallback symbols).
    pub model_key: String,
    pub points: Vec<ForecastPoint>,
}

impl Forecast {
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnavailableReason {
    ArtifactNotFound { key: String },
    NotEnoughData { required: usize, available: usize },
    ShapeMismatch { expected: usize, actual: usize },
    UpstreamFailure { detail: String },
    InvalidHorizon { horizon: usize, max: usize },
    Internal { detail: String },
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArtifactNotFound { key } => write!(f, "model not available for '{}'", key),
            Self::NotEnoughData {
                required,
                available,
            } => write!(
                f,
                "not enough price history ({} of {} observations)",
                available, required
            ),
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "model expects {} features but pipeline produced {}",
                expected, actual
            ),
            Self::UpstreamFailure { detail } => write!(f, "market data unavailable: {}", detail),
            Self::InvalidHorizon { horizon, max } => {
                write!(f, "horizon must be in 1..={}, got {}", max, horizon)
            }
            Self::Internal { detail } => write!(f, "prediction failed: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Available {
        symbol: String,
        model_key: String,
        price: f64,
        /// Unscaled closes that formed the model's input window.
        window_prices: Vec<f64>,
    },
    Unavailable(UnavailableReason),
}

/// What the web layer renders for a single-step prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub symbol: String,
    pub prediction: Option<f64>,
    /// Heuristic score in [0, 100]; not a statistical confidence interval.
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub symbol: String,
    pub dates: Vec<String>,
    pub prices: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
