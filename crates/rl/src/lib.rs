//! Reinforcement-learning decision making for the trading engine.
//!
//! The policy is a small ε-greedy Q-learner: a [`QNetwork`] estimates action
//! values, a FIFO [`ReplayBuffer`] decorrelates updates, and a periodically
//! synchronized target copy of the network stabilizes the temporal-difference
//! targets. [`PolicyAgent`] ties the three together and owns all mutable
//! learning state.

pub mod agent;
pub mod estimator;
pub mod replay;

pub use agent::{AgentConfig, LearnOutcome, PolicyAgent, PolicySnapshot, PolicyState};
pub use estimator::{QNetwork, QWeights};
pub use replay::{ReplayBuffer, ReplayStats, Transition};
