//! Two-layer LSTM regressor with back-propagation through time.
//!
//! Layout: `LSTM(units, sequences) -> Dropout -> LSTM(units) -> Dropout ->
//! Dense(1, activation)`. Gate blocks in every weight matrix are ordered
//! input, forget, candidate, output.

use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Activation, LossKind, OptimizerKind};
use crate::error::{ForecastError, Result};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
const HUBER_DELTA: f64 = 1.0;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn glorot_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    col.dot(&row)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmLayer {
    /// `(4 * hidden, input)`
    w_x: Array2<f64>,
    /// `(4 * hidden, hidden)`
    w_h: Array2<f64>,
    /// `(4 * hidden)`
    bias: Array1<f64>,
}

#[derive(Debug, Clone)]
struct LstmStep {
    x: Array1<f64>,
    h_prev: Array1<f64>,
    c_prev: Array1<f64>,
    i: Array1<f64>,
    f: Array1<f64>,
    g: Array1<f64>,
    o: Array1<f64>,
    tanh_c: Array1<f64>,
}

#[derive(Debug, Clone)]
struct LstmGrads {
    w_x: Array2<f64>,
    w_h: Array2<f64>,
    bias: Array1<f64>,
}

impl LstmGrads {
    fn zeros_like(layer: &LstmLayer) -> Self {
        Self {
            w_x: Array2::zeros(layer.w_x.raw_dim()),
            w_h: Array2::zeros(layer.w_h.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }

    fn sum_sq(&self) -> f64 {
        self.w_x.iter().chain(self.w_h.iter()).chain(self.bias.iter()).map(|g| g * g).sum()
    }

    fn scale(&mut self, k: f64) {
        self.w_x *= k;
        self.w_h *= k;
        self.bias *= k;
    }
}

impl LstmLayer {
    fn new<R: Rng + ?Sized>(input: usize, hidden: usize, rng: &mut R) -> Self {
        let mut bias = Array1::<f64>::zeros(4 * hidden);
        // Forget gate starts open so early gradients flow through time.
        bias.slice_mut(s![hidden..2 * hidden]).fill(1.0);
        Self {
            w_x: glorot_uniform(4 * hidden, input, rng),
            w_h: glorot_uniform(4 * hidden, hidden, rng),
            bias,
        }
    }

    pub fn input_size(&self) -> usize {
        self.w_x.ncols()
    }

    pub fn hidden_size(&self) -> usize {
        self.w_h.ncols()
    }

    /// Run the sequence `(T, input)` and return every hidden state `(T, hidden)`.
    /// When `cache` is given, per-step activations are recorded for backprop.
    fn forward(&self, xs: ArrayView2<'_, f64>, mut cache: Option<&mut Vec<LstmStep>>) -> Array2<f64> {
        let hsz = self.hidden_size();
        let steps = xs.nrows();
        let mut hs = Array2::<f64>::zeros((steps, hsz));
        let mut h = Array1::<f64>::zeros(hsz);
        let mut c = Array1::<f64>::zeros(hsz);

        for t in 0..steps {
            let x = xs.row(t);
            let z = self.w_x.dot(&x) + self.w_h.dot(&h) + &self.bias;
            let i = z.slice(s![0..hsz]).mapv(sigmoid);
            let f = z.slice(s![hsz..2 * hsz]).mapv(sigmoid);
            let g = z.slice(s![2 * hsz..3 * hsz]).mapv(f64::tanh);
            let o = z.slice(s![3 * hsz..4 * hsz]).mapv(sigmoid);
            let c_next = &f * &c + &i * &g;
            let tanh_c = c_next.mapv(f64::tanh);
            let h_next = &o * &tanh_c;
            hs.row_mut(t).assign(&h_next);

            if let Some(cache) = cache.as_deref_mut() {
                cache.push(LstmStep {
                    x: x.to_owned(),
                    h_prev: h,
                    c_prev: c,
                    i,
                    f,
                    g,
                    o,
                    tanh_c,
                });
            }
            h = h_next;
            c = c_next;
        }
        hs
    }

    /// Accumulate parameter gradients for upstream `d_hs` `(T, hidden)` and
    /// return the gradient with respect to the inputs `(T, input)`.
    fn backward(&self, steps: &[LstmStep], d_hs: &Array2<f64>, grads: &mut LstmGrads) -> Array2<f64> {
        let hsz = self.hidden_size();
        let mut dx = Array2::<f64>::zeros((steps.len(), self.input_size()));
        let mut dh_next = Array1::<f64>::zeros(hsz);
        let mut dc_next = Array1::<f64>::zeros(hsz);

        for (t, st) in steps.iter().enumerate().rev() {
            let dh = &d_hs.row(t) + &dh_next;
            let d_o = &dh * &st.tanh_c;
            let dc = &dc_next + &(&dh * &st.o * &st.tanh_c.mapv(|v| 1.0 - v * v));
            let d_i = &dc * &st.g;
            let d_f = &dc * &st.c_prev;
            let d_g = &dc * &st.i;
            dc_next = &dc * &st.f;

            let mut dz = Array1::<f64>::zeros(4 * hsz);
            dz.slice_mut(s![0..hsz])
                .assign(&(&d_i * &st.i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![hsz..2 * hsz])
                .assign(&(&d_f * &st.f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![2 * hsz..3 * hsz])
                .assign(&(&d_g * &st.g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![3 * hsz..4 * hsz])
                .assign(&(&d_o * &st.o.mapv(|v| v * (1.0 - v))));

            grads.w_x += &outer(&dz, &st.x);
            grads.w_h += &outer(&dz, &st.h_prev);
            grads.bias += &dz;
            dx.row_mut(t).assign(&self.w_x.t().dot(&dz));
            dh_next = self.w_h.t().dot(&dz);
        }
        dx
    }
}

/// Intermediate values from one training-mode forward pass.
struct ForwardTrace {
    steps1: Vec<LstmStep>,
    mask1: Option<Array2<f64>>,
    steps2: Vec<LstmStep>,
    mask2: Option<Array1<f64>>,
    last_hidden: Array1<f64>,
    pre_activation: f64,
    output: f64,
}

#[derive(Debug, Clone)]
pub struct RegressorGrads {
    lstm1: LstmGrads,
    lstm2: LstmGrads,
    dense_w: Array1<f64>,
    dense_b: Array1<f64>,
}

impl RegressorGrads {
    pub fn zeros_like(model: &LstmRegressor) -> Self {
        Self {
            lstm1: LstmGrads::zeros_like(&model.lstm1),
            lstm2: LstmGrads::zeros_like(&model.lstm2),
            dense_w: Array1::zeros(model.dense_w.raw_dim()),
            dense_b: Array1::zeros(1),
        }
    }

    pub fn global_norm(&self) -> f64 {
        let dense: f64 = self
            .dense_w
            .iter()
            .chain(self.dense_b.iter())
            .map(|g| g * g)
            .sum();
        (self.lstm1.sum_sq() + self.lstm2.sum_sq() + dense).sqrt()
    }

    pub fn scale(&mut self, k: f64) {
        self.lstm1.scale(k);
        self.lstm2.scale(k);
        self.dense_w *= k;
        self.dense_b *= k;
    }

    /// Rescale so the global L2 norm is at most `max_norm`.
    pub fn clip(&mut self, max_norm: f64) {
        let norm = self.global_norm();
        if norm.is_finite() && norm > max_norm {
            self.scale(max_norm / norm);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmRegressor {
    input_features: usize,
    units: usize,
    dropout: f64,
    activation: Activation,
    lstm1: LstmLayer,
    lstm2: LstmLayer,
    dense_w: Array1<f64>,
    dense_b: Array1<f64>,
}

impl LstmRegressor {
    pub fn new<R: Rng + ?Sized>(
        input_features: usize,
        units: usize,
        dropout: f64,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let dense = glorot_uniform(1, units, rng);
        Self {
            input_features,
            units,
            dropout,
            activation,
            lstm1: LstmLayer::new(input_features, units, rng),
            lstm2: LstmLayer::new(units, units, rng),
            dense_w: dense.row(0).to_owned(),
            dense_b: Array1::zeros(1),
        }
    }

    pub fn input_features(&self) -> usize {
        self.input_features
    }

    fn activate(&self, z: f64) -> f64 {
        match self.activation {
            Activation::Linear => z,
            Activation::Relu => z.max(0.0),
            Activation::Sigmoid => sigmoid(z),
            Activation::Tanh => z.tanh(),
        }
    }

    fn activation_grad(&self, z: f64, y: f64) -> f64 {
        match self.activation {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
        }
    }

    fn check_width(&self, key: &str, width: usize) -> Result<()> {
        if width != self.input_features {
            return Err(ForecastError::ShapeMismatch {
                key: key.to_string(),
                expected: self.input_features,
                actual: width,
            });
        }
        Ok(())
    }

    /// Inference on one window `(T, features)`; dropout is inactive.
    pub fn predict(&self, window: ArrayView2<'_, f64>) -> Result<f64> {
        self.check_width("model", window.ncols())?;
        let hs1 = self.lstm1.forward(window, None);
        let hs2 = self.lstm2.forward(hs1.view(), None);
        let last = match hs2.nrows() {
            0 => Array1::zeros(self.units),
            n => hs2.row(n - 1).to_owned(),
        };
        Ok(self.activate(self.dense_w.dot(&last) + self.dense_b[0]))
    }

    pub fn predict_batch(&self, inputs: &Array3<f64>) -> Result<Array1<f64>> {
        self.check_width("model", inputs.dim().2)?;
        let mut out = Array1::<f64>::zeros(inputs.dim().0);
        for (k, window) in inputs.outer_iter().enumerate() {
            out[k] = self.predict(window)?;
        }
        Ok(out)
    }

    fn forward_train<R: Rng + ?Sized>(&self, window: ArrayView2<'_, f64>, rng: &mut R) -> ForwardTrace {
        let keep = 1.0 - self.dropout;
        let use_dropout = self.dropout > 0.0;

        let mut steps1 = Vec::with_capacity(window.nrows());
        let hs1 = self.lstm1.forward(window, Some(&mut steps1));
        let mask1 = use_dropout.then(|| {
            hs1.mapv(|_| if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
        });
        let hs1 = match &mask1 {
            Some(m) => &hs1 * m,
            None => hs1,
        };

        let mut steps2 = Vec::with_capacity(window.nrows());
        let hs2 = self.lstm2.forward(hs1.view(), Some(&mut steps2));
        let last = match hs2.nrows() {
            0 => Array1::zeros(self.units),
            n => hs2.row(n - 1).to_owned(),
        };
        let mask2 = use_dropout.then(|| {
            last.mapv(|_| if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
        });
        let last_hidden = match &mask2 {
            Some(m) => &last * m,
            None => last,
        };

        let pre_activation = self.dense_w.dot(&last_hidden) + self.dense_b[0];
        ForwardTrace {
            steps1,
            mask1,
            steps2,
            mask2,
            output: self.activate(pre_activation),
            last_hidden,
            pre_activation,
        }
    }

    fn backward(&self, trace: &ForwardTrace, d_output: f64, grads: &mut RegressorGrads) {
        let dz = d_output * self.activation_grad(trace.pre_activation, trace.output);
        grads.dense_w.scaled_add(dz, &trace.last_hidden);
        grads.dense_b[0] += dz;

        let steps = trace.steps2.len();
        if steps == 0 {
            return;
        }
        let mut d_last = &self.dense_w * dz;
        if let Some(m) = &trace.mask2 {
            d_last *= m;
        }
        let mut d_hs2 = Array2::<f64>::zeros((steps, self.units));
        d_hs2.row_mut(steps - 1).assign(&d_last);

        let mut d_hs1 = self.lstm2.backward(&trace.steps2, &d_hs2, &mut grads.lstm2);
        if let Some(m) = &trace.mask1 {
            d_hs1 *= m;
        }
        self.lstm1.backward(&trace.steps1, &d_hs1, &mut grads.lstm1);
    }

    /// One training sample: forward with dropout, accumulate `weight`-scaled
    /// gradients of `loss`, and return the unweighted sample loss.
    pub fn accumulate_sample<R: Rng + ?Sized>(
        &self,
        window: ArrayView2<'_, f64>,
        target: f64,
        loss: LossKind,
        weight: f64,
        rng: &mut R,
        grads: &mut RegressorGrads,
    ) -> f64 {
        let trace = self.forward_train(window, rng);
        let value = loss_value(loss, trace.output, target);
        let d_output = weight * loss_grad(loss, trace.output, target);
        self.backward(&trace, d_output, grads);
        value
    }

    pub fn apply_gradients(&mut self, grads: &RegressorGrads, optimizer: &mut Optimizer) {
        optimizer.begin_step();
        let params: [(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>); 8] = [
            (self.lstm1.w_x.view_mut().into_dyn(), grads.lstm1.w_x.view().into_dyn()),
            (self.lstm1.w_h.view_mut().into_dyn(), grads.lstm1.w_h.view().into_dyn()),
            (self.lstm1.bias.view_mut().into_dyn(), grads.lstm1.bias.view().into_dyn()),
            (self.lstm2.w_x.view_mut().into_dyn(), grads.lstm2.w_x.view().into_dyn()),
            (self.lstm2.w_h.view_mut().into_dyn(), grads.lstm2.w_h.view().into_dyn()),
            (self.lstm2.bias.view_mut().into_dyn(), grads.lstm2.bias.view().into_dyn()),
            (self.dense_w.view_mut().into_dyn(), grads.dense_w.view().into_dyn()),
            (self.dense_b.view_mut().into_dyn(), grads.dense_b.view().into_dyn()),
        ];
        for (slot, (param, grad)) in params.into_iter().enumerate() {
            optimizer.update(slot, param, grad);
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            &self.lstm1.w_x,
            &self.lstm1.w_h,
            &self.lstm2.w_x,
            &self.lstm2.w_h,
        ]
        .iter()
        .all(|w| w.iter().all(|v| v.is_finite()))
            && self.lstm1.bias.iter().all(|v| v.is_finite())
            && self.lstm2.bias.iter().all(|v| v.is_finite())
            && self.dense_w.iter().all(|v| v.is_finite())
            && self.dense_b.iter().all(|v| v.is_finite())
    }
}

pub fn loss_value(kind: LossKind, pred: f64, target: f64) -> f64 {
    let e = pred - target;
    match kind {
        LossKind::Mse => e * e,
        LossKind::Mae => e.abs(),
        LossKind::Huber => {
            if e.abs() <= HUBER_DELTA {
                0.5 * e * e
            } else {
                HUBER_DELTA * (e.abs() - 0.5 * HUBER_DELTA)
            }
        }
    }
}

pub fn loss_grad(kind: LossKind, pred: f64, target: f64) -> f64 {
    let e = pred - target;
    match kind {
        LossKind::Mse => 2.0 * e,
        LossKind::Mae => {
            if e == 0.0 {
                0.0
            } else {
                e.signum()
            }
        }
        LossKind::Huber => e.clamp(-HUBER_DELTA, HUBER_DELTA),
    }
}

/// Mean loss over a whole set with dropout disabled.
pub fn mean_loss(model: &LstmRegressor, inputs: &Array3<f64>, targets: &Array1<f64>, loss: LossKind) -> Result<f64> {
    if targets.is_empty() {
        return Ok(0.0);
    }
    let preds = model.predict_batch(inputs)?;
    let total: f64 = preds
        .iter()
        .zip(targets.iter())
        .map(|(&p, &y)| loss_value(loss, p, y))
        .sum();
    Ok(total / targets.len() as f64)
}

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f64>,
    v: ArrayD<f64>,
}

/// First-order optimizers with Keras-style default step sizes.
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    step: i32,
    slots: Vec<Option<Moments>>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: Option<f64>) -> Self {
        let default_lr = match kind {
            OptimizerKind::Adam => 0.001,
            OptimizerKind::Sgd => 0.01,
            OptimizerKind::Rmsprop => 0.001,
        };
        Self {
            kind,
            learning_rate: learning_rate.unwrap_or(default_lr),
            step: 0,
            slots: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn begin_step(&mut self) {
        self.step = self.step.saturating_add(1);
    }

    fn update(&mut self, slot: usize, param: ArrayViewMutD<'_, f64>, grad: ArrayViewD<'_, f64>) {
        const EPS: f64 = 1e-7;
        let lr = self.learning_rate;
        let step = self.step.max(1);
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, None);
        }
        let moments = self.slots[slot].get_or_insert_with(|| Moments {
            m: ArrayD::zeros(grad.raw_dim()),
            v: ArrayD::zeros(grad.raw_dim()),
        });

        match self.kind {
            OptimizerKind::Sgd => {
                Zip::from(param).and(grad).for_each(|p, &g| *p -= lr * g);
            }
            OptimizerKind::Adam => {
                let (b1, b2) = (0.9_f64, 0.999_f64);
                let lr_t = lr * (1.0 - b2.powi(step)).sqrt() / (1.0 - b1.powi(step));
                Zip::from(param)
                    .and(grad)
                    .and(&mut moments.m)
                    .and(&mut moments.v)
                    .for_each(|p, &g, m, v| {
                        *m = b1 * *m + (1.0 - b1) * g;
                        *v = b2 * *v + (1.0 - b2) * g * g;
                        *p -= lr_t * *m / (v.sqrt() + EPS);
                    });
            }
            OptimizerKind::Rmsprop => {
                let rho = 0.9;
                Zip::from(param)
                    .and(grad)
                    .and(&mut moments.v)
                    .for_each(|p, &g, v| {
                        *v = rho * *v + (1.0 - rho) * g * g;
                        *p -= lr * g / (v.sqrt() + EPS);
                    });
            }
        }
    }
}

/// Persisted network plus the metadata serving needs to use it safely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub key: String,
    pub window_length: usize,
    pub epoch: usize,
    pub val_loss: Option<f64>,
    pub saved_at: DateTime<Utc>,
    pub network: LstmRegressor,
}

impl ModelArtifact {
    pub fn new(key: &str, window_length: usize, epoch: usize, val_loss: f64, network: LstmRegressor) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            key: key.to_string(),
            window_length,
            epoch,
            val_loss: val_loss.is_finite().then_some(val_loss),
            saved_at: Utc::now(),
            network,
        }
    }

    pub fn input_features(&self) -> usize {
        self.network.input_features()
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&payload)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ForecastError::Config(format!(
                "{} has artifact format {}, expected {}",
                path.display(),
                artifact.format_version,
                ARTIFACT_FORMAT_VERSION
            )));
        }
        if artifact.network.lstm1.input_size() != artifact.network.input_features {
            return Err(ForecastError::ShapeMismatch {
                key: artifact.key.clone(),
                expected: artifact.network.input_features,
                actual: artifact.network.lstm1.input_size(),
            });
        }
        Ok(artifact)
    }
}

/// Window view helper for callers holding a flat single-feature slice.
pub fn column_window(values: &[f64]) -> Array2<f64> {
    ArrayView1::from(values).insert_axis(Axis(1)).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny(activation: Activation) -> LstmRegressor {
        let mut rng = StdRng::seed_from_u64(7);
        LstmRegressor::new(2, 3, 0.0, activation, &mut rng)
    }

    fn sample_window() -> Array2<f64> {
        Array2::from_shape_fn((4, 2), |(t, f)| 0.1 * (t as f64 + 1.0) - 0.05 * f as f64)
    }

    fn sample_loss(model: &LstmRegressor, window: &Array2<f64>, target: f64) -> f64 {
        loss_value(LossKind::Mse, model.predict(window.view()).unwrap(), target)
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let window = sample_window();
        let target = 0.3;
        for activation in [Activation::Linear, Activation::Tanh] {
            let model = tiny(activation);
            let mut grads = RegressorGrads::zeros_like(&model);
            let mut rng = StdRng::seed_from_u64(1);
            model.accumulate_sample(window.view(), target, LossKind::Mse, 1.0, &mut rng, &mut grads);

            let eps = 1e-6;
            let checks: Vec<(f64, f64)> = vec![
                {
                    let mut plus = model.clone();
                    plus.lstm1.w_x[[5, 1]] += eps;
                    let mut minus = model.clone();
                    minus.lstm1.w_x[[5, 1]] -= eps;
                    let numeric = (sample_loss(&plus, &window, target)
                        - sample_loss(&minus, &window, target))
                        / (2.0 * eps);
                    (grads.lstm1.w_x[[5, 1]], numeric)
                },
                {
                    let mut plus = model.clone();
                    plus.lstm2.w_h[[7, 2]] += eps;
                    let mut minus = model.clone();
                    minus.lstm2.w_h[[7, 2]] -= eps;
                    let numeric = (sample_loss(&plus, &window, target)
                        - sample_loss(&minus, &window, target))
                        / (2.0 * eps);
                    (grads.lstm2.w_h[[7, 2]], numeric)
                },
                {
                    let mut plus = model.clone();
                    plus.lstm1.bias[4] += eps;
                    let mut minus = model.clone();
                    minus.lstm1.bias[4] -= eps;
                    let numeric = (sample_loss(&plus, &window, target)
                        - sample_loss(&minus, &window, target))
                        / (2.0 * eps);
                    (grads.lstm1.bias[4], numeric)
                },
                {
                    let mut plus = model.clone();
                    plus.dense_w[0] += eps;
                    let mut minus = model.clone();
                    minus.dense_w[0] -= eps;
                    let numeric = (sample_loss(&plus, &window, target)
                        - sample_loss(&minus, &window, target))
                        / (2.0 * eps);
                    (grads.dense_w[0], numeric)
                },
            ];
            for (analytic, numeric) in checks {
                let tol = 1e-5 * (1.0 + analytic.abs() + numeric.abs());
                assert!(
                    (analytic - numeric).abs() < tol,
                    "{:?}: analytic {} vs numeric {}",
                    activation,
                    analytic,
                    numeric
                );
            }
        }
    }

    #[test]
    fn predict_rejects_wrong_feature_width() {
        let model = tiny(Activation::Linear);
        let window = Array2::<f64>::zeros((4, 5));
        assert!(matches!(
            model.predict(window.view()),
            Err(ForecastError::ShapeMismatch {
                expected: 2,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn clip_bounds_global_norm() {
        let model = tiny(Activation::Linear);
        let mut grads = RegressorGrads::zeros_like(&model);
        grads.dense_w.fill(10.0);
        grads.clip(1.0);
        assert!((grads.global_norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn artifact_round_trips_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/best/AAPL.json");
        let model = tiny(Activation::Sigmoid);
        let artifact = ModelArtifact::new("AAPL", 4, 3, 0.01, model.clone());
        artifact.persist(&path).unwrap();
        let loaded = ModelArtifact::load(&path).unwrap();
        let window = sample_window();
        assert_eq!(
            model.predict(window.view()).unwrap(),
            loaded.network.predict(window.view()).unwrap()
        );
        assert_eq!(loaded.window_length, 4);
        assert_eq!(loaded.input_features(), 2);
    }
}
