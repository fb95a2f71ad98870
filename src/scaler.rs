use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Per-feature min/max normalizer. Fitted on a training partition only and
/// applied unchanged to test and inference data; values outside the fitted
/// range map outside [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    key: String,
    feature_names: Vec<String>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl MinMaxScaler {
    /// Fit over row-major training data (`rows[i][feature]`).
    pub fn fit(key: &str, feature_names: &[&str], rows: &[Vec<f64>]) -> Result<Self> {
        let width = feature_names.len();
        if width == 0 {
            return Err(ForecastError::Config(format!(
                "scaler '{}' needs at least one feature",
                key
            )));
        }
        if rows.is_empty() {
            return Err(ForecastError::NotEnoughData {
                key: key.to_string(),
                required: 1,
                available: 0,
            });
        }

        let mut min = vec![f64::INFINITY; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        for row in rows {
            if row.len() != width {
                return Err(ForecastError::ShapeMismatch {
                    key: key.to_string(),
                    expected: width,
                    actual: row.len(),
                });
            }
            for (j, &v) in row.iter().enumerate() {
                if !v.is_finite() {
                    return Err(ForecastError::ScalerDegenerate {
                        key: key.to_string(),
                        feature: feature_names[j].to_string(),
                    });
                }
                min[j] = min[j].min(v);
                max[j] = max[j].max(v);
            }
        }

        let scaler = Self {
            key: key.to_string(),
            feature_names: feature_names.iter().map(|s| s.to_string()).collect(),
            min,
            max,
        };
        scaler.check_range()?;
        Ok(scaler)
    }

    pub fn fit_series(key: &str, feature_name: &str, values: &[f64]) -> Result<Self> {
        let rows: Vec<Vec<f64>> = values.iter().map(|&v| vec![v]).collect();
        Self::fit(key, &[feature_name], &rows)
    }

    fn check_range(&self) -> Result<()> {
        if self.min.len() != self.max.len() || self.min.len() != self.feature_names.len() {
            return Err(ForecastError::ShapeMismatch {
                key: self.key.clone(),
                expected: self.feature_names.len(),
                actual: self.min.len().min(self.max.len()),
            });
        }
        for (j, name) in self.feature_names.iter().enumerate() {
            let (lo, hi) = (self.min[j], self.max[j]);
            if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
                return Err(ForecastError::ScalerDegenerate {
                    key: self.key.clone(),
                    feature: name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn range(&self, feature: usize) -> Option<(f64, f64)> {
        Some((*self.min.get(feature)?, *self.max.get(feature)?))
    }

    fn feature_bounds(&self, feature: usize) -> Result<(f64, f64)> {
        self.range(feature).ok_or_else(|| ForecastError::ShapeMismatch {
            key: self.key.clone(),
            expected: self.feature_count(),
            actual: feature + 1,
        })
    }

    pub fn transform_value(&self, feature: usize, v: f64) -> Result<f64> {
        let (lo, hi) = self.feature_bounds(feature)?;
        Ok((v - lo) / (hi - lo))
    }

    pub fn inverse_value(&self, feature: usize, scaled: f64) -> Result<f64> {
        let (lo, hi) = self.feature_bounds(feature)?;
        Ok(scaled * (hi - lo) + lo)
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter()
            .map(|row| {
                self.check_width(row.len())?;
                row.iter()
                    .enumerate()
                    .map(|(j, &v)| self.transform_value(j, v))
                    .collect()
            })
            .collect()
    }

    pub fn inverse_transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter()
            .map(|row| {
                self.check_width(row.len())?;
                row.iter()
                    .enumerate()
                    .map(|(j, &v)| self.inverse_value(j, v))
                    .collect()
            })
            .collect()
    }

    /// Single-feature shortcut used by the close-price pipeline.
    pub fn transform_series(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.check_width(1)?;
        values.iter().map(|&v| self.transform_value(0, v)).collect()
    }

    pub fn inverse_series(&self, scaled: &[f64]) -> Result<Vec<f64>> {
        self.check_width(1)?;
        scaled.iter().map(|&v| self.inverse_value(0, v)).collect()
    }

    fn check_width(&self, width: usize) -> Result<()> {
        if width != self.feature_count() {
            return Err(ForecastError::ShapeMismatch {
                key: self.key.clone(),
                expected: self.feature_count(),
                actual: width,
            });
        }
        Ok(())
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(key = %self.key, path = %path.display(), "Scaler persisted");
        Ok(())
    }

    /// Load a persisted scaler. A file whose range is degenerate is rejected
    /// instead of producing NaN later.
    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)?;
        let scaler: Self = serde_json::from_str(&payload)?;
        scaler.check_range()?;
        Ok(scaler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_uses_training_values_only() {
        let scaler = MinMaxScaler::fit_series("AAPL", "Close", &[10.0, 20.0, 15.0]).unwrap();
        assert_eq!(scaler.range(0), Some((10.0, 20.0)));
        let scaled = scaler.transform_series(&[10.0, 15.0, 20.0, 25.0, 5.0]).unwrap();
        assert_eq!(scaled, vec![0.0, 0.5, 1.0, 1.5, -0.5]);
    }

    #[test]
    fn zero_range_is_rejected() {
        let err = MinMaxScaler::fit_series("FLAT", "Close", &[3.0, 3.0, 3.0]).unwrap_err();
        assert!(matches!(err, ForecastError::ScalerDegenerate { .. }));
    }

    #[test]
    fn nan_input_is_rejected() {
        let err = MinMaxScaler::fit_series("BAD", "Close", &[1.0, f64::NAN]).unwrap_err();
        assert!(matches!(err, ForecastError::ScalerDegenerate { .. }));
    }

    #[test]
    fn multi_feature_width_is_checked() {
        let rows = vec![vec![1.0, 10.0], vec![2.0, 30.0]];
        let scaler = MinMaxScaler::fit("X", &["Open", "Close"], &rows).unwrap();
        assert_eq!(scaler.transform(&rows).unwrap()[1], vec![1.0, 1.0]);
        let err = scaler.transform(&[vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::ShapeMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        assert!(scaler.transform_series(&[1.0]).is_err());
    }
}
