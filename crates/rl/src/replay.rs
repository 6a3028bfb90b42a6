use std::collections::VecDeque;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use adlts_models::TradeAction;

/// One recorded (state, action, reward, next_state, terminal) tuple. The
/// buffer owns it exclusively; the learner only ever sees cloned copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Vec<f64>,
    pub action: TradeAction,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub terminal: bool,
}

impl Transition {
    pub fn new(
        state: Vec<f64>,
        action: TradeAction,
        reward: f64,
        next_state: Vec<f64>,
        terminal: bool,
    ) -> Self {
        Self { state, action, reward, next_state, terminal }
    }

    /// Intermediate step with no realized outcome yet.
    pub fn step(state: Vec<f64>, action: TradeAction, next_state: Vec<f64>) -> Self {
        Self::new(state, action, 0.0, next_state, false)
    }

    /// Episode-ending transition. The successor state is a placeholder copy
    /// of the current one; the terminal flag masks it out of bootstrapping.
    pub fn closing(state: Vec<f64>, action: TradeAction, reward: f64) -> Self {
        let next_state = state.clone();
        Self::new(state, action, reward, next_state, true)
    }
}

/// Fixed-capacity FIFO experience store with uniform sampling.
#[derive(Debug)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a transition, evicting the oldest entry once full. The length
    /// can therefore never exceed the configured capacity.
    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_ratio(&self) -> f64 {
        self.buffer.len() as f64 / self.capacity as f64
    }

    pub fn has_at_least(&self, count: usize) -> bool {
        self.buffer.len() >= count
    }

    /// Uniform sample without replacement, in no particular order. Returns
    /// fewer than `batch` copies when the buffer is smaller than `batch`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, batch: usize) -> Vec<Transition> {
        let amount = batch.min(self.buffer.len());
        if amount == 0 {
            return Vec::new();
        }
        index::sample(rng, self.buffer.len(), amount)
            .into_iter()
            .map(|i| self.buffer[i].clone())
            .collect()
    }

    pub fn oldest(&self) -> Option<&Transition> {
        self.buffer.front()
    }

    /// Summary used in checkpoints; the full buffer is never persisted.
    pub fn stats(&self) -> ReplayStats {
        let len = self.buffer.len();
        let (mean_reward, terminal_fraction) = if len == 0 {
            (0.0, 0.0)
        } else {
            let reward_sum: f64 = self.buffer.iter().map(|t| t.reward).sum();
            let terminals = self.buffer.iter().filter(|t| t.terminal).count();
            (reward_sum / len as f64, terminals as f64 / len as f64)
        };
        ReplayStats {
            len,
            capacity: self.capacity,
            mean_reward,
            terminal_fraction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayStats {
    pub len: usize,
    pub capacity: usize,
    pub mean_reward: f64,
    pub terminal_fraction: f64,
}
