use ndarray::{s, Array1, Array3, ArrayView2};

use crate::error::{ForecastError, Result};

/// Supervised pairs cut from a scaled series: `inputs` is
/// `(samples, window_length, features)` and `targets[i]` is the value that
/// immediately follows window `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSet {
    pub inputs: Array3<f64>,
    pub targets: Array1<f64>,
}

impl SequenceSet {
    pub fn empty(window_length: usize, feature_count: usize) -> Self {
        Self {
            inputs: Array3::zeros((0, window_length, feature_count)),
            targets: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn window_length(&self) -> usize {
        self.inputs.dim().1
    }

    pub fn feature_count(&self) -> usize {
        self.inputs.dim().2
    }

    pub fn window(&self, i: usize) -> ArrayView2<'_, f64> {
        self.inputs.slice(s![i, .., ..])
    }

    /// An empty set is a valid windowing result, but training and evaluation
    /// cannot proceed on one.
    pub fn require_non_empty(&self, key: &str) -> Result<()> {
        if self.is_empty() {
            return Err(ForecastError::NotEnoughData {
                key: key.to_string(),
                required: self.window_length() + 1,
                available: self.window_length(),
            });
        }
        Ok(())
    }

    /// Inputs and targets must agree on sample count.
    pub fn check_consistent(&self, key: &str) -> Result<()> {
        if self.inputs.dim().0 != self.targets.len() {
            return Err(ForecastError::ShapeMismatch {
                key: key.to_string(),
                expected: self.inputs.dim().0,
                actual: self.targets.len(),
            });
        }
        Ok(())
    }

    /// Concatenate sets cut from separate series (e.g. one per symbol in the
    /// pooled dataset) so no window straddles two series.
    pub fn concat(key: &str, sets: &[SequenceSet]) -> Result<Self> {
        let Some(first) = sets.first() else {
            return Err(ForecastError::NotEnoughData {
                key: key.to_string(),
                required: 1,
                available: 0,
            });
        };
        let (window_length, features) = (first.window_length(), first.feature_count());
        let total: usize = sets.iter().map(SequenceSet::len).sum();
        let mut inputs = Array3::<f64>::zeros((total, window_length, features));
        let mut targets = Array1::<f64>::zeros(total);
        let mut offset = 0;
        for set in sets {
            if set.window_length() != window_length || set.feature_count() != features {
                return Err(ForecastError::ShapeMismatch {
                    key: key.to_string(),
                    expected: features,
                    actual: set.feature_count(),
                });
            }
            let n = set.len();
            inputs
                .slice_mut(s![offset..offset + n, .., ..])
                .assign(&set.inputs);
            targets.slice_mut(s![offset..offset + n]).assign(&set.targets);
            offset += n;
        }
        Ok(Self { inputs, targets })
    }
}

/// Window a single-feature series: for `i` in `window_length..len`, the input
/// is `series[i - window_length..i]` and the target is `series[i]`.
pub fn make_sequences(series: &[f64], window_length: usize) -> Result<SequenceSet> {
    let rows = ArrayView2::from_shape((series.len(), 1), series).map_err(|e| {
        ForecastError::Config(format!("series cannot be viewed as one column: {}", e))
    })?;
    make_feature_sequences(rows, window_length, 0)
}

/// Multi-feature variant: each window keeps every column, the target is the
/// `target_column` value of the following row.
pub fn make_feature_sequences(
    rows: ArrayView2<'_, f64>,
    window_length: usize,
    target_column: usize,
) -> Result<SequenceSet> {
    if window_length == 0 {
        return Err(ForecastError::Config(
            "window length must be > 0".to_string(),
        ));
    }
    let (len, features) = rows.dim();
    if target_column >= features {
        return Err(ForecastError::Config(format!(
            "target column {} out of range for {} features",
            target_column, features
        )));
    }
    if len <= window_length {
        return Ok(SequenceSet::empty(window_length, features));
    }

    let samples = len - window_length;
    let mut inputs = Array3::<f64>::zeros((samples, window_length, features));
    let mut targets = Array1::<f64>::zeros(samples);
    for (k, i) in (window_length..len).enumerate() {
        inputs
            .slice_mut(s![k, .., ..])
            .assign(&rows.slice(s![i - window_length..i, ..]));
        targets[k] = rows[[i, target_column]];
    }
    Ok(SequenceSet { inputs, targets })
}
