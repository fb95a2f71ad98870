use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::network::LstmRegressor;
use crate::scaler::MinMaxScaler;
use crate::sequence::SequenceSet;

/// Test-window error metrics in price scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub key: String,
    pub samples: usize,
    pub mae: f64,
    pub rmse: f64,
    /// Percent; rows with a zero actual price are left out.
    pub mape: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationReport {
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&payload)?)
    }
}

pub fn evaluate(
    key: &str,
    model: &LstmRegressor,
    scaler: &MinMaxScaler,
    test_set: &SequenceSet,
) -> Result<EvaluationReport> {
    test_set.require_non_empty(key)?;
    test_set.check_consistent(key)?;
    if model.input_features() != test_set.feature_count() {
        return Err(ForecastError::ShapeMismatch {
            key: key.to_string(),
            expected: model.input_features(),
            actual: test_set.feature_count(),
        });
    }

    let scaled_preds = model.predict_batch(&test_set.inputs)?;
    let preds = scaler.inverse_series(&scaled_preds.to_vec())?;
    let actuals = scaler.inverse_series(&test_set.targets.to_vec())?;
    Ok(metrics(key, &preds, &actuals))
}

fn metrics(key: &str, preds: &[f64], actuals: &[f64]) -> EvaluationReport {
    let n = preds.len().max(1) as f64;
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    let mut pct_sum = 0.0;
    let mut pct_rows = 0usize;
    for (p, a) in preds.iter().zip(actuals) {
        let err = p - a;
        abs_sum += err.abs();
        sq_sum += err * err;
        if *a != 0.0 {
            pct_sum += (err / a).abs();
            pct_rows += 1;
        }
    }
    EvaluationReport {
        key: key.to_string(),
        samples: preds.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
        mape: (pct_rows > 0).then(|| pct_sum / pct_rows as f64 * 100.0),
        evaluated_at: Utc::now(),
    }
}
