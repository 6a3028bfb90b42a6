use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ndarray::{Array2, ArrayView1};
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use adlts_models::{EngineError, Result, TradeAction, ACTION_COUNT};

use crate::estimator::{QNetwork, QWeights};
use crate::replay::{ReplayBuffer, ReplayStats, Transition};

/// Hyperparameters for the trading policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Length of the state vector handed to `select_action`.
    pub state_dim: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    /// Discount factor γ applied to bootstrapped next-state values.
    pub discount: f64,
    pub epsilon_start: f64,
    pub epsilon_floor: f64,
    pub epsilon_decay: f64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    /// Transitions required in the buffer before learning starts.
    pub min_replay: usize,
    /// Learn every K recorded steps.
    pub learn_interval: u64,
    /// Sync the target estimator every N recorded steps. Must be > 1.
    pub target_sync_interval: u64,
    pub grad_clip: f64,
    /// Consecutive non-finite losses tolerated before training halts.
    pub max_divergences: u32,
    /// After a fatal halt: keep serving greedy actions from the last good
    /// weights (true) or refuse to act (false).
    pub continue_after_halt: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dim: 305,
            hidden_dim: 64,
            learning_rate: 0.001,
            discount: 0.99,
            epsilon_start: 1.0,
            epsilon_floor: 0.01,
            epsilon_decay: 0.995,
            replay_capacity: 10_000,
            batch_size: 32,
            min_replay: 256,
            learn_interval: 4,
            target_sync_interval: 100,
            grad_clip: 10.0,
            max_divergences: 3,
            continue_after_halt: true,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.state_dim == 0 || self.hidden_dim == 0 {
            return Err(EngineError::Config(
                "policy dimensions must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.epsilon_start)
            || !(0.0..=1.0).contains(&self.epsilon_floor)
            || self.epsilon_start < self.epsilon_floor
        {
            return Err(EngineError::Config(format!(
                "epsilon range invalid: start {} floor {}",
                self.epsilon_start, self.epsilon_floor
            )));
        }
        if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            return Err(EngineError::Config(format!(
                "epsilon decay must be in (0, 1], got {}",
                self.epsilon_decay
            )));
        }
        if !(0.0..=1.0).contains(&self.discount) {
            return Err(EngineError::Config(format!(
                "discount must be in [0, 1], got {}",
                self.discount
            )));
        }
        if self.batch_size == 0
            || self.replay_capacity < self.batch_size
            || self.min_replay < self.batch_size
        {
            return Err(EngineError::Config(format!(
                "replay sizing invalid: capacity {} min {} batch {}",
                self.replay_capacity, self.min_replay, self.batch_size
            )));
        }
        if self.learn_interval == 0 {
            return Err(EngineError::Config(
                "learn interval must be positive".to_string(),
            ));
        }
        if self.target_sync_interval <= 1 {
            return Err(EngineError::Config(
                "target sync interval must exceed 1".to_string(),
            ));
        }
        if self.max_divergences == 0 {
            return Err(EngineError::Config(
                "divergence tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable learning progress, checkpointed atomically with the weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyState {
    pub epsilon: f64,
    pub steps: u64,
    pub weights_version: u64,
    pub last_sync_step: u64,
}

/// Everything needed to resume the policy exactly where it left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub state: PolicyState,
    pub weights: QWeights,
}

/// Result of one learning opportunity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnOutcome {
    /// The current step is not a learning step.
    NotDue,
    /// Replay buffer has not reached the minimum fill yet.
    BufferFilling,
    Updated { loss: f64, synced_target: bool },
    /// Non-finite loss: update discarded, weights rolled back.
    Diverged { consecutive: u32 },
    /// Training is permanently halted; no update was attempted.
    Halted,
}

/// ε-greedy Q-learning policy over {hold, open-long, open-short, close}.
///
/// Thread-safe: concurrent symbol pipelines may call `select_action` and
/// `record_transition` freely; `maybe_learn` guards itself so each learning
/// step runs at most once. Weight updates and target syncs happen under a
/// write lock, so readers always observe a complete weight set.
pub struct PolicyAgent {
    config: AgentConfig,
    online: RwLock<QNetwork>,
    target: RwLock<QNetwork>,
    /// Rollback point: refreshed on every successful target sync.
    last_good: RwLock<QWeights>,
    replay: Mutex<ReplayBuffer>,
    rng: Mutex<SmallRng>,
    state: Mutex<PolicyState>,
    last_learn_step: AtomicU64,
    divergences: AtomicU32,
    halted: AtomicBool,
}

impl PolicyAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let seed = rand::thread_rng().gen();
        Self::with_seed(config, seed)
    }

    pub fn with_seed(config: AgentConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let online = QNetwork::new(config.state_dim, config.hidden_dim, ACTION_COUNT, &mut rng);
        let target = online.clone();
        let last_good = online.snapshot();
        let state = PolicyState {
            epsilon: config.epsilon_start,
            steps: 0,
            weights_version: 0,
            last_sync_step: 0,
        };
        Ok(Self {
            replay: Mutex::new(ReplayBuffer::new(config.replay_capacity)),
            config,
            online: RwLock::new(online),
            target: RwLock::new(target),
            last_good: RwLock::new(last_good),
            rng: Mutex::new(rng),
            state: Mutex::new(state),
            last_learn_step: AtomicU64::new(0),
            divergences: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn current_epsilon(&self) -> f64 {
        self.state.lock().epsilon
    }

    pub fn policy_state(&self) -> PolicyState {
        self.state.lock().clone()
    }

    pub fn replay_stats(&self) -> ReplayStats {
        self.replay.lock().stats()
    }

    /// Picks an action for the given state. Illegal actions for the current
    /// position status are filtered before both the random and the greedy
    /// branch. A halted agent serves greedily from the last good weights, or
    /// refuses, per configuration.
    pub fn select_action(&self, state: &[f64], position_open: bool) -> Result<TradeAction> {
        if state.len() != self.config.state_dim {
            return Err(EngineError::InvalidFeatures(format!(
                "state has {} dims, policy expects {}",
                state.len(),
                self.config.state_dim
            )));
        }
        let legal = TradeAction::legal_when(position_open);

        if self.is_halted() {
            if !self.config.continue_after_halt {
                return Err(EngineError::TrainingHalted(
                    "policy halted after repeated divergence".to_string(),
                ));
            }
            return Ok(self.greedy_action(state, legal));
        }

        let epsilon = self.current_epsilon();
        let explore = {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < epsilon {
                Some(legal[rng.gen_range(0..legal.len())])
            } else {
                None
            }
        };
        match explore {
            Some(action) => Ok(action),
            None => Ok(self.greedy_action(state, legal)),
        }
    }

    fn greedy_action(&self, state: &[f64], legal: &[TradeAction]) -> TradeAction {
        let q = self.online.read().forward(state);
        let mut best = legal[0];
        let mut best_value = f64::NEG_INFINITY;
        for &action in legal {
            let value = q[action.index()];
            if value > best_value {
                best_value = value;
                best = action;
            }
        }
        best
    }

    /// Stores a transition and advances the step counter. ε decays
    /// multiplicatively toward its floor on every recorded step, whether or
    /// not a learning update follows. No-op once training has halted.
    pub fn record_transition(&self, transition: Transition) {
        if self.is_halted() {
            debug!("transition dropped, training halted");
            return;
        }
        if transition.state.len() != self.config.state_dim
            || transition.next_state.len() != self.config.state_dim
        {
            warn!(
                state_len = transition.state.len(),
                expected = self.config.state_dim,
                "transition dropped, state dimension mismatch"
            );
            return;
        }
        self.replay.lock().push(transition);
        let mut state = self.state.lock();
        state.steps += 1;
        state.epsilon = (state.epsilon * self.config.epsilon_decay).max(self.config.epsilon_floor);
    }

    /// Runs one learning update if the current step is due for one. Samples a
    /// uniform mini-batch, computes TD targets from the target estimator
    /// (zeroed on terminal transitions), and applies one SGD step. A
    /// non-finite loss discards the update, rolls the online weights back to
    /// the last good snapshot, and after `max_divergences` consecutive
    /// failures halts training fatally.
    pub fn maybe_learn(&self) -> Result<LearnOutcome> {
        if self.is_halted() {
            return Ok(LearnOutcome::Halted);
        }
        let (steps, last_sync) = {
            let state = self.state.lock();
            (state.steps, state.last_sync_step)
        };
        if steps == 0 || steps % self.config.learn_interval != 0 {
            return Ok(LearnOutcome::NotDue);
        }
        // Concurrent pipelines may land on the same step; only one learns.
        if self.last_learn_step.swap(steps, Ordering::SeqCst) == steps {
            return Ok(LearnOutcome::NotDue);
        }

        let batch = {
            let replay = self.replay.lock();
            if !replay.has_at_least(self.config.min_replay) {
                return Ok(LearnOutcome::BufferFilling);
            }
            let mut rng = self.rng.lock();
            replay.sample(&mut *rng, self.config.batch_size)
        };
        if batch.is_empty() {
            return Ok(LearnOutcome::BufferFilling);
        }

        let n = batch.len();
        let dim = self.config.state_dim;
        let mut states = Array2::zeros((n, dim));
        let mut next_states = Array2::zeros((n, dim));
        let mut actions = Vec::with_capacity(n);
        for (row, transition) in batch.iter().enumerate() {
            states
                .row_mut(row)
                .assign(&ArrayView1::from(transition.state.as_slice()));
            next_states
                .row_mut(row)
                .assign(&ArrayView1::from(transition.next_state.as_slice()));
            actions.push(transition.action.index());
        }

        let next_q = self.target.read().forward_batch(&next_states);
        let mut targets = Vec::with_capacity(n);
        for (row, transition) in batch.iter().enumerate() {
            let bootstrap = if transition.terminal {
                0.0
            } else {
                let best_next = next_q
                    .row(row)
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                self.config.discount * best_next
            };
            targets.push(transition.reward + bootstrap);
        }

        let (loss, version) = {
            let mut online = self.online.write();
            let loss = online.train_batch(
                &states,
                &actions,
                &targets,
                self.config.learning_rate,
                self.config.grad_clip,
            );
            (loss, online.version())
        };

        if !loss.is_finite() {
            return self.handle_divergence(steps, loss);
        }

        self.divergences.store(0, Ordering::Release);
        let synced_target = if steps.saturating_sub(last_sync) >= self.config.target_sync_interval {
            self.sync_target(steps);
            true
        } else {
            false
        };
        {
            let mut state = self.state.lock();
            state.weights_version = version;
            if synced_target {
                state.last_sync_step = steps;
            }
        }
        debug!(step = steps, loss, "📉 policy updated");
        Ok(LearnOutcome::Updated {
            loss,
            synced_target,
        })
    }

    fn sync_target(&self, steps: u64) {
        let online = self.online.read();
        self.target.write().sync_from(&online);
        *self.last_good.write() = online.snapshot();
        info!(step = steps, version = online.version(), "🎯 target estimator synchronized");
    }

    fn handle_divergence(&self, steps: u64, loss: f64) -> Result<LearnOutcome> {
        let consecutive = self.divergences.fetch_add(1, Ordering::AcqRel) + 1;
        let rollback = self.last_good.read().clone();
        {
            let mut online = self.online.write();
            if let Err(e) = online.restore(&rollback) {
                error!(error = %e, "rollback snapshot rejected");
            }
        }
        warn!(
            step = steps,
            loss, consecutive, "⚠️ non-finite loss, update discarded and weights rolled back"
        );

        if consecutive >= self.config.max_divergences {
            self.halted.store(true, Ordering::Release);
            {
                let online = self.online.read();
                self.target.write().sync_from(&online);
            }
            error!(
                step = steps,
                consecutive, "🛑 training halted after repeated divergence"
            );
            return Err(EngineError::TrainingHalted(format!(
                "{consecutive} consecutive non-finite losses at step {steps}"
            )));
        }
        Ok(LearnOutcome::Diverged { consecutive })
    }

    /// Atomic view of the current policy for checkpointing.
    pub fn snapshot(&self) -> PolicySnapshot {
        let weights = self.online.read().snapshot();
        let state = self.state.lock().clone();
        PolicySnapshot { state, weights }
    }

    /// Replaces weights and progress from a checkpoint. The target estimator
    /// re-syncs to the restored weights and divergence bookkeeping resets.
    pub fn restore(&self, snapshot: &PolicySnapshot) -> Result<()> {
        {
            let mut online = self.online.write();
            online.restore(&snapshot.weights)?;
            self.target.write().sync_from(&online);
        }
        *self.last_good.write() = snapshot.weights.clone();
        {
            let mut state = self.state.lock();
            state.epsilon = snapshot.state.epsilon.max(self.config.epsilon_floor);
            state.steps = snapshot.state.steps;
            state.weights_version = snapshot.state.weights_version;
            state.last_sync_step = snapshot.state.last_sync_step;
        }
        self.last_learn_step.store(snapshot.state.steps, Ordering::Release);
        self.divergences.store(0, Ordering::Release);
        self.halted.store(false, Ordering::Release);
        info!(
            steps = snapshot.state.steps,
            epsilon = snapshot.state.epsilon,
            "policy restored from checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adlts_models::TradeAction;

    fn test_config() -> AgentConfig {
        AgentConfig {
            state_dim: 6,
            hidden_dim: 8,
            replay_capacity: 64,
            batch_size: 4,
            min_replay: 4,
            learn_interval: 1,
            target_sync_interval: 10,
            ..AgentConfig::default()
        }
    }

    fn transition(reward: f64) -> Transition {
        Transition::new(
            vec![0.1; 6],
            TradeAction::OpenLong,
            reward,
            vec![0.2; 6],
            false,
        )
    }

    #[test]
    fn test_epsilon_decays_monotonically_to_floor() {
        let agent = PolicyAgent::with_seed(test_config(), 7).unwrap();
        let mut previous = agent.current_epsilon();
        for _ in 0..2000 {
            agent.record_transition(transition(0.01));
            let now = agent.current_epsilon();
            assert!(now <= previous);
            assert!(now >= agent.config().epsilon_floor);
            previous = now;
        }
        assert!((previous - agent.config().epsilon_floor).abs() < 1e-9);
    }

    #[test]
    fn test_selection_respects_legality() {
        let config = AgentConfig {
            epsilon_start: 1.0,
            epsilon_decay: 1.0,
            epsilon_floor: 1.0,
            ..test_config()
        };
        let agent = PolicyAgent::with_seed(config, 11).unwrap();
        let state = vec![0.3; 6];

        for _ in 0..100 {
            let flat = agent.select_action(&state, false).unwrap();
            assert!(matches!(
                flat,
                TradeAction::Hold | TradeAction::OpenLong | TradeAction::OpenShort
            ));
            let open = agent.select_action(&state, true).unwrap();
            assert!(matches!(open, TradeAction::Hold | TradeAction::Close));
        }
    }

    #[test]
    fn test_state_dimension_mismatch_rejected() {
        let agent = PolicyAgent::with_seed(test_config(), 3).unwrap();
        assert!(agent.select_action(&[0.1, 0.2], false).is_err());
    }

    #[test]
    fn test_learning_updates_weights() {
        let agent = PolicyAgent::with_seed(test_config(), 19).unwrap();
        for _ in 0..3 {
            agent.record_transition(transition(0.05));
            agent.maybe_learn().unwrap();
        }
        agent.record_transition(transition(0.05));
        let outcome = agent.maybe_learn().unwrap();

        match outcome {
            LearnOutcome::Updated { loss, .. } => assert!(loss.is_finite()),
            other => panic!("expected update, got {other:?}"),
        }
        assert!(agent.policy_state().weights_version > 0);
    }

    #[test]
    fn test_learning_waits_for_minimum_fill() {
        let config = AgentConfig {
            min_replay: 8,
            ..test_config()
        };
        let agent = PolicyAgent::with_seed(config, 23).unwrap();
        agent.record_transition(transition(0.0));
        assert_eq!(agent.maybe_learn().unwrap(), LearnOutcome::BufferFilling);
    }

    #[test]
    fn test_divergence_rolls_back_then_halts() {
        let agent = PolicyAgent::with_seed(test_config(), 31).unwrap();
        let good_weights = agent.snapshot().weights;
        for _ in 0..4 {
            agent.record_transition(transition(f64::NAN));
        }

        // Interval is 1, so each extra recorded step makes learning due again.
        let first = agent.maybe_learn().unwrap();
        assert_eq!(first, LearnOutcome::Diverged { consecutive: 1 });
        agent.record_transition(transition(f64::NAN));
        let second = agent.maybe_learn().unwrap();
        assert_eq!(second, LearnOutcome::Diverged { consecutive: 2 });
        agent.record_transition(transition(f64::NAN));
        let fatal = agent.maybe_learn();
        assert!(matches!(fatal, Err(EngineError::TrainingHalted(_))));

        assert!(agent.is_halted());
        assert_eq!(agent.snapshot().weights, good_weights);
        assert_eq!(agent.maybe_learn().unwrap(), LearnOutcome::Halted);
    }

    #[test]
    fn test_halted_agent_still_serves_greedily() {
        let agent = PolicyAgent::with_seed(test_config(), 37).unwrap();
        agent.halted.store(true, Ordering::Release);
        let action = agent.select_action(&vec![0.1; 6], false).unwrap();
        assert!(action.is_legal(false));
    }

    #[test]
    fn test_halted_agent_refuses_when_configured() {
        let config = AgentConfig {
            continue_after_halt: false,
            ..test_config()
        };
        let agent = PolicyAgent::with_seed(config, 41).unwrap();
        agent.halted.store(true, Ordering::Release);
        assert!(agent.select_action(&vec![0.1; 6], false).is_err());
    }

    #[test]
    fn test_restore_reproduces_greedy_choice() {
        let config = AgentConfig {
            epsilon_start: 0.0,
            epsilon_floor: 0.0,
            ..test_config()
        };
        let source = PolicyAgent::with_seed(config.clone(), 43).unwrap();
        for _ in 0..16 {
            source.record_transition(transition(0.02));
            let _ = source.maybe_learn().unwrap();
        }
        let snapshot = source.snapshot();
        let state = vec![0.4, -0.2, 0.1, 0.0, 0.6, -0.5];
        let expected = source.select_action(&state, false).unwrap();

        let clone = PolicyAgent::with_seed(config, 999).unwrap();
        clone.restore(&snapshot).unwrap();
        assert_eq!(clone.select_action(&state, false).unwrap(), expected);
        assert_eq!(clone.policy_state(), snapshot.state);
    }

    #[test]
    fn test_target_sync_refreshes_rollback_point() {
        let config = AgentConfig {
            target_sync_interval: 2,
            ..test_config()
        };
        let agent = PolicyAgent::with_seed(config, 47).unwrap();
        let initial = agent.snapshot().weights;
        let mut synced = false;
        for _ in 0..8 {
            agent.record_transition(transition(0.03));
            if let LearnOutcome::Updated { synced_target, .. } = agent.maybe_learn().unwrap() {
                synced |= synced_target;
            }
        }
        assert!(synced);
        assert_ne!(*agent.last_good.read(), initial);
    }
}
