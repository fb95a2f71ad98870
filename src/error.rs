use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("config error: {0}")]
    Config(String),

    #[error("no model/scaler artifacts found for '{key}'")]
    ArtifactNotFound { key: String },

    #[error("not enough data for '{key}': need {required} observations, have {available}")]
    NotEnoughData {
        key: String,
        required: usize,
        available: usize,
    },

    #[error("shape mismatch for '{key}': expected {expected} features, got {actual}")]
    ShapeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("scaler for '{key}' is degenerate: feature '{feature}' has zero range")]
    ScalerDegenerate { key: String, feature: String },

    #[error("horizon must be in 1..={max}, got {horizon}")]
    InvalidHorizon { horizon: usize, max: usize },

    #[error("market data fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("market data fetch timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("training already in progress for '{0}'")]
    TrainingLocked(String),

    #[error("training diverged for '{key}' at epoch {epoch} (non-finite loss)")]
    TrainingDiverged { key: String, epoch: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForecastError {
    /// Errors that mean "this symbol cannot be served right now" rather than a
    /// broken process. Batch stages log and move on for every variant anyway.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound { .. }
                | Self::NotEnoughData { .. }
                | Self::ShapeMismatch { .. }
                | Self::UpstreamFetch(_)
                | Self::Timeout { .. }
                | Self::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
