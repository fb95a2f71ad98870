pub mod config;
pub mod error;
pub mod evaluation;
pub mod forecaster;
pub mod history_store;
pub mod ingestion;
pub mod market_data;
pub mod model;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod scaler;
pub mod sequence;
pub mod server;
pub mod trainer;

pub use error::{ForecastError, Result};
