use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use adlts_models::{EngineError, Result};

/// Serializable weight snapshot. Row-major flattening of each matrix; the
/// layout is part of the checkpoint format and must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QWeights {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub action_dim: usize,
    pub version: u64,
    pub w1: Vec<f64>,
    pub b1: Vec<f64>,
    pub w2: Vec<f64>,
    pub b2: Vec<f64>,
}

/// Single-hidden-layer action-value estimator: input → ReLU hidden → one
/// linear Q output per action. Small enough to train on the tick path
/// without a tensor backend.
#[derive(Debug, Clone)]
pub struct QNetwork {
    input_dim: usize,
    hidden_dim: usize,
    action_dim: usize,
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
    version: u64,
}

impl QNetwork {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden_dim: usize,
        action_dim: usize,
        rng: &mut R,
    ) -> Self {
        let xavier = |fan_in: usize, fan_out: usize| (2.0 / (fan_in + fan_out) as f64).sqrt();

        let w1_scale = xavier(input_dim, hidden_dim);
        let w1 = Array2::from_shape_fn((input_dim, hidden_dim), |_| {
            rng.gen_range(-1.0..1.0) * w1_scale
        });
        let w2_scale = xavier(hidden_dim, action_dim);
        let w2 = Array2::from_shape_fn((hidden_dim, action_dim), |_| {
            rng.gen_range(-1.0..1.0) * w2_scale
        });

        Self {
            input_dim,
            hidden_dim,
            action_dim,
            w1,
            b1: Array1::zeros(hidden_dim),
            w2,
            b2: Array1::zeros(action_dim),
            version: 0,
        }
    }

    pub fn from_weights(weights: &QWeights) -> Result<Self> {
        let mut network = Self {
            input_dim: weights.input_dim,
            hidden_dim: weights.hidden_dim,
            action_dim: weights.action_dim,
            w1: Array2::zeros((weights.input_dim, weights.hidden_dim)),
            b1: Array1::zeros(weights.hidden_dim),
            w2: Array2::zeros((weights.hidden_dim, weights.action_dim)),
            b2: Array1::zeros(weights.action_dim),
            version: 0,
        };
        network.restore(weights)?;
        Ok(network)
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Q-values for one state.
    pub fn forward(&self, state: &[f64]) -> Array1<f64> {
        let x = ArrayView1::from(state);
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        hidden.dot(&self.w2) + &self.b2
    }

    /// Q-values for a batch of states, one row per state.
    pub fn forward_batch(&self, states: &Array2<f64>) -> Array2<f64> {
        let hidden = (states.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        hidden.dot(&self.w2) + &self.b2
    }

    /// One SGD step toward the given per-row targets on the taken actions,
    /// Huber loss with gradient-norm clipping. Returns the mean loss. A
    /// non-finite loss leaves the weights completely untouched so the caller
    /// can treat the update as discarded.
    pub fn train_batch(
        &mut self,
        states: &Array2<f64>,
        actions: &[usize],
        targets: &[f64],
        learning_rate: f64,
        grad_clip: f64,
    ) -> f64 {
        let batch = states.nrows();
        debug_assert_eq!(actions.len(), batch);
        debug_assert_eq!(targets.len(), batch);
        if batch == 0 {
            return 0.0;
        }

        let pre_hidden = states.dot(&self.w1) + &self.b1;
        let hidden = pre_hidden.mapv(|v| v.max(0.0));
        let q = hidden.dot(&self.w2) + &self.b2;

        // Huber on the taken-action outputs; untouched outputs carry zero
        // gradient.
        let scale = 1.0 / batch as f64;
        let mut out_grad = Array2::zeros(q.raw_dim());
        let mut loss_sum = 0.0;
        for (row, (&action, &target)) in actions.iter().zip(targets).enumerate() {
            let delta = q[[row, action]] - target;
            loss_sum += if delta.abs() <= 1.0 {
                0.5 * delta * delta
            } else {
                delta.abs() - 0.5
            };
            out_grad[[row, action]] = delta.clamp(-1.0, 1.0) * scale;
        }
        let loss = loss_sum * scale;
        if !loss.is_finite() {
            return loss;
        }

        let grad_w2 = hidden.t().dot(&out_grad);
        let grad_b2 = out_grad.sum_axis(Axis(0));
        let relu_mask = pre_hidden.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let hidden_grad = out_grad.dot(&self.w2.t()) * &relu_mask;
        let grad_w1 = states.t().dot(&hidden_grad);
        let grad_b1 = hidden_grad.sum_axis(Axis(0));

        let norm_sq: f64 = grad_w1
            .iter()
            .chain(grad_b1.iter())
            .chain(grad_w2.iter())
            .chain(grad_b2.iter())
            .map(|g| g * g)
            .sum();
        let norm = norm_sq.sqrt();
        let step = if norm > grad_clip && norm > 0.0 {
            learning_rate * grad_clip / norm
        } else {
            learning_rate
        };

        self.w1.scaled_add(-step, &grad_w1);
        self.b1.scaled_add(-step, &grad_b1);
        self.w2.scaled_add(-step, &grad_w2);
        self.b2.scaled_add(-step, &grad_b2);
        self.version += 1;

        loss
    }

    pub fn snapshot(&self) -> QWeights {
        QWeights {
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim,
            action_dim: self.action_dim,
            version: self.version,
            w1: self.w1.iter().copied().collect(),
            b1: self.b1.to_vec(),
            w2: self.w2.iter().copied().collect(),
            b2: self.b2.to_vec(),
        }
    }

    /// Replaces every weight from a snapshot. All-or-nothing: dimension
    /// mismatches error out before anything is written.
    pub fn restore(&mut self, weights: &QWeights) -> Result<()> {
        if weights.input_dim != self.input_dim
            || weights.hidden_dim != self.hidden_dim
            || weights.action_dim != self.action_dim
        {
            return Err(EngineError::Checkpoint(format!(
                "weight shape mismatch: have {}x{}x{}, snapshot {}x{}x{}",
                self.input_dim,
                self.hidden_dim,
                self.action_dim,
                weights.input_dim,
                weights.hidden_dim,
                weights.action_dim
            )));
        }
        if weights.b1.len() != self.hidden_dim || weights.b2.len() != self.action_dim {
            return Err(EngineError::Checkpoint("bias length mismatch".to_string()));
        }

        let w1 = Array2::from_shape_vec((self.input_dim, self.hidden_dim), weights.w1.clone())
            .map_err(|e| EngineError::Checkpoint(format!("w1 layout: {e}")))?;
        let w2 = Array2::from_shape_vec((self.hidden_dim, self.action_dim), weights.w2.clone())
            .map_err(|e| EngineError::Checkpoint(format!("w2 layout: {e}")))?;

        self.w1 = w1;
        self.b1 = Array1::from_vec(weights.b1.clone());
        self.w2 = w2;
        self.b2 = Array1::from_vec(weights.b2.clone());
        self.version = weights.version;
        Ok(())
    }

    /// Hard copy of another network's weights (target synchronization). The
    /// caller holds the write lock, so readers never observe a partial set.
    pub fn sync_from(&mut self, source: &QNetwork) {
        self.w1.assign(&source.w1);
        self.b1.assign(&source.b1);
        self.w2.assign(&source.w2);
        self.b2.assign(&source.b2);
        self.version = source.version;
    }
}
