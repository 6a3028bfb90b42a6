use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use adlts_models::{EngineError, FeatureVector, ForecastEstimate, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecasterConfig {
    /// Flattened feature-window length this model consumes.
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    /// Samples accumulated before one training pass runs.
    pub batch_size: usize,
    /// Below this many trained samples every forecast is low-confidence.
    pub min_samples: u64,
    /// Uncertainty above this flags the forecast low-confidence.
    pub uncertainty_ceiling: f64,
    /// EWMA weight given to each new squared residual.
    pub residual_decay: f64,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            input_dim: 300,
            hidden_dim: 50,
            learning_rate: 0.001,
            batch_size: 32,
            min_samples: 64,
            uncertainty_ceiling: 0.02,
            residual_decay: 0.05,
        }
    }
}

impl ForecasterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.hidden_dim == 0 {
            return Err(EngineError::Config(
                "forecaster dimensions must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config(
                "forecaster batch size must be positive".to_string(),
            ));
        }
        if self.uncertainty_ceiling <= 0.0 {
            return Err(EngineError::Config(format!(
                "uncertainty ceiling must be positive, got {}",
                self.uncertainty_ceiling
            )));
        }
        if !(self.residual_decay > 0.0 && self.residual_decay <= 1.0) {
            return Err(EngineError::Config(format!(
                "residual decay must be in (0, 1], got {}",
                self.residual_decay
            )));
        }
        Ok(())
    }
}

/// Serializable forecaster parameters for checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecasterSnapshot {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub w1: Vec<f64>,
    pub b1: Vec<f64>,
    pub w2: Vec<f64>,
    pub b2: f64,
    pub residual_var: f64,
    pub samples_seen: u64,
    pub updates: u64,
}

/// Short-horizon return forecaster: a small MLP (tanh hidden layer, linear
/// scalar output) trained incrementally on (feature window, realized
/// next-step return) pairs. Training is batched so the per-tick cost is one
/// forward pass; uncertainty is the square root of an exponentially-weighted
/// average of squared training residuals, so confidence has to be earned
/// from data before any forecast is trusted.
#[derive(Debug)]
pub struct Forecaster {
    config: ForecasterConfig,
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array1<f64>,
    b2: f64,
    pending: Vec<(Vec<f64>, f64)>,
    residual_var: f64,
    samples_seen: u64,
    updates: u64,
}

impl Forecaster {
    pub fn new(config: ForecasterConfig) -> Result<Self> {
        let seed = rand::thread_rng().gen();
        Self::with_seed(config, seed)
    }

    pub fn with_seed(config: ForecasterConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let w1_scale = (2.0 / (config.input_dim + config.hidden_dim) as f64).sqrt();
        let w1 = Array2::from_shape_fn((config.input_dim, config.hidden_dim), |_| {
            rng.gen_range(-1.0..1.0) * w1_scale
        });
        let w2_scale = (2.0 / (config.hidden_dim + 1) as f64).sqrt();
        let w2 = Array1::from_shape_fn(config.hidden_dim, |_| rng.gen_range(-1.0..1.0) * w2_scale);

        // Start dispersion above the ceiling so early forecasts stay
        // low-confidence until training residuals actually shrink.
        let residual_var = (2.0 * config.uncertainty_ceiling).powi(2);
        Ok(Self {
            b1: Array1::zeros(config.hidden_dim),
            w1,
            w2,
            b2: 0.0,
            pending: Vec::with_capacity(config.batch_size),
            residual_var,
            samples_seen: 0,
            updates: 0,
            config,
        })
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current uncertainty measure (square root of the residual EWMA).
    pub fn uncertainty(&self) -> f64 {
        self.residual_var.sqrt()
    }

    fn forward(&self, values: &[f64]) -> f64 {
        let x = ArrayView1::from(values);
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(f64::tanh);
        hidden.dot(&self.w2) + self.b2
    }

    /// Point estimate plus uncertainty for one feature window. Until
    /// `min_samples` observations have been trained on, the estimate is the
    /// uninformed placeholder.
    pub fn predict(&self, features: &FeatureVector) -> Result<ForecastEstimate> {
        if features.len() != self.config.input_dim {
            return Err(EngineError::InvalidFeatures(format!(
                "forecaster expects {} values, got {}",
                self.config.input_dim,
                features.len()
            )));
        }
        if self.samples_seen < self.config.min_samples {
            return Ok(ForecastEstimate::uninformed());
        }
        Ok(ForecastEstimate::new(
            self.forward(&features.values),
            self.uncertainty(),
            self.config.uncertainty_ceiling,
        ))
    }

    /// Queues one (features, realized next-step return) observation and
    /// trains when a full batch has accumulated. Returns the batch loss when
    /// a training pass ran.
    pub fn push_sample(&mut self, features: &FeatureVector, realized_return: f64) -> Result<Option<f64>> {
        if features.len() != self.config.input_dim {
            return Err(EngineError::InvalidFeatures(format!(
                "forecaster expects {} values, got {}",
                self.config.input_dim,
                features.len()
            )));
        }
        if !realized_return.is_finite() {
            warn!(realized_return, "non-finite training target skipped");
            return Ok(None);
        }
        self.pending.push((features.values.clone(), realized_return));
        if self.pending.len() < self.config.batch_size {
            return Ok(None);
        }
        Ok(self.train_pending())
    }

    fn train_pending(&mut self) -> Option<f64> {
        let n = self.pending.len();
        let mut states = Array2::zeros((n, self.config.input_dim));
        let mut targets = Array1::zeros(n);
        for (row, (values, target)) in self.pending.iter().enumerate() {
            states.row_mut(row).assign(&ArrayView1::from(values.as_slice()));
            targets[row] = *target;
        }

        let hidden = (states.dot(&self.w1) + &self.b1).mapv(f64::tanh);
        let predictions = hidden.dot(&self.w2) + self.b2;
        let residuals = &predictions - &targets;
        let loss = residuals.mapv(|r| r * r).mean().unwrap_or(f64::NAN);

        if !loss.is_finite() {
            warn!(batch = n, loss, "non-finite forecaster loss, batch discarded");
            self.pending.clear();
            return None;
        }

        let scale = 2.0 / n as f64;
        let out_grad = residuals.mapv(|r| r * scale);
        let grad_w2 = hidden.t().dot(&out_grad);
        let grad_b2 = out_grad.sum();
        let hidden_grad = Array2::from_shape_fn((n, self.config.hidden_dim), |(i, j)| {
            out_grad[i] * self.w2[j] * (1.0 - hidden[[i, j]].powi(2))
        });
        let grad_w1 = states.t().dot(&hidden_grad);
        let grad_b1 = hidden_grad.sum_axis(Axis(0));

        let lr = self.config.learning_rate;
        self.w1.scaled_add(-lr, &grad_w1);
        self.b1.scaled_add(-lr, &grad_b1);
        self.w2.scaled_add(-lr, &grad_w2);
        self.b2 -= lr * grad_b2;

        let alpha = self.config.residual_decay;
        for residual in residuals.iter() {
            self.residual_var = (1.0 - alpha) * self.residual_var + alpha * residual * residual;
        }

        self.samples_seen += n as u64;
        self.updates += 1;
        self.pending.clear();
        debug!(
            batch = n,
            loss,
            uncertainty = self.uncertainty(),
            "🔮 forecaster trained"
        );
        Some(loss)
    }

    pub fn snapshot(&self) -> ForecasterSnapshot {
        ForecasterSnapshot {
            input_dim: self.config.input_dim,
            hidden_dim: self.config.hidden_dim,
            w1: self.w1.iter().copied().collect(),
            b1: self.b1.to_vec(),
            w2: self.w2.to_vec(),
            b2: self.b2,
            residual_var: self.residual_var,
            samples_seen: self.samples_seen,
            updates: self.updates,
        }
    }

    /// Replaces parameters from a checkpoint; pending samples are dropped.
    pub fn restore(&mut self, snapshot: &ForecasterSnapshot) -> Result<()> {
        if snapshot.input_dim != self.config.input_dim
            || snapshot.hidden_dim != self.config.hidden_dim
        {
            return Err(EngineError::Checkpoint(format!(
                "forecaster shape mismatch: have {}x{}, snapshot {}x{}",
                self.config.input_dim,
                self.config.hidden_dim,
                snapshot.input_dim,
                snapshot.hidden_dim
            )));
        }
        if snapshot.b1.len() != self.config.hidden_dim
            || snapshot.w2.len() != self.config.hidden_dim
        {
            return Err(EngineError::Checkpoint(
                "forecaster vector length mismatch".to_string(),
            ));
        }
        self.w1 = Array2::from_shape_vec(
            (self.config.input_dim, self.config.hidden_dim),
            snapshot.w1.clone(),
        )
        .map_err(|e| EngineError::Checkpoint(format!("w1 layout: {e}")))?;
        self.b1 = Array1::from_vec(snapshot.b1.clone());
        self.w2 = Array1::from_vec(snapshot.w2.clone());
        self.b2 = snapshot.b2;
        self.residual_var = snapshot.residual_var;
        self.samples_seen = snapshot.samples_seen;
        self.updates = snapshot.updates;
        self.pending.clear();
        Ok(())
    }
}
