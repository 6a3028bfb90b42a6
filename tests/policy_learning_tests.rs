use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use adlts_models::{EngineError, TradeAction};
use adlts_rl::{AgentConfig, LearnOutcome, PolicyAgent, ReplayBuffer, Transition};
use adlts_store::{Checkpoint, CheckpointStore};
use std::collections::BTreeMap;

fn fast_learner() -> AgentConfig {
    AgentConfig {
        state_dim: 10,
        hidden_dim: 8,
        replay_capacity: 128,
        batch_size: 8,
        min_replay: 8,
        learn_interval: 1,
        target_sync_interval: 16,
        ..AgentConfig::default()
    }
}

fn step_transition(reward: f64) -> Transition {
    Transition::new(
        vec![0.1; 10],
        TradeAction::OpenLong,
        reward,
        vec![0.2; 10],
        false,
    )
}

fn temp_checkpoint_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "adlts-policy-{tag}-{}.json",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ))
}

#[tokio::test]
async fn test_epsilon_anneals_to_floor_over_session() {
    let agent = PolicyAgent::with_seed(fast_learner(), 5).unwrap();
    assert_eq!(agent.current_epsilon(), 1.0);

    for _ in 0..2000 {
        agent.record_transition(step_transition(0.001));
    }

    let floor = agent.config().epsilon_floor;
    assert!((agent.current_epsilon() - floor).abs() < 1e-9);

    // Further steps never push exploration below the floor
    agent.record_transition(step_transition(0.001));
    assert!(agent.current_epsilon() >= floor);
}

#[tokio::test]
async fn test_learning_runs_on_interval_steps_only() {
    let config = AgentConfig {
        learn_interval: 4,
        ..fast_learner()
    };
    let agent = PolicyAgent::with_seed(config, 13).unwrap();

    let mut updates = 0;
    for step in 1..=32u64 {
        agent.record_transition(step_transition(0.01));
        match agent.maybe_learn().unwrap() {
            LearnOutcome::Updated { loss, .. } => {
                assert!(loss.is_finite());
                assert_eq!(step % 4, 0, "update landed on off-interval step {step}");
                updates += 1;
            }
            LearnOutcome::NotDue => assert_ne!(step % 4, 0),
            LearnOutcome::BufferFilling => assert!(step < 8),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(updates, 32 / 4 - 1); // step 4 still finds the buffer filling
}

#[tokio::test]
async fn test_divergent_updates_roll_back_then_halt() {
    let agent = PolicyAgent::with_seed(fast_learner(), 29).unwrap();
    let pristine = agent.snapshot().weights;

    // Poison the buffer so every sampled batch produces a NaN loss
    for _ in 0..8 {
        agent.record_transition(step_transition(f64::NAN));
    }

    let mut diverged = 0;
    let halted_error = loop {
        agent.record_transition(step_transition(f64::NAN));
        match agent.maybe_learn() {
            Ok(LearnOutcome::Diverged { consecutive }) => {
                diverged = consecutive;
                // Rolled back, never left with poisoned weights
                assert_eq!(agent.snapshot().weights, pristine);
            }
            Ok(other) => panic!("expected divergence, got {other:?}"),
            Err(e) => break e,
        }
    };

    assert_eq!(diverged, agent.config().max_divergences - 1);
    assert!(matches!(halted_error, EngineError::TrainingHalted(_)));
    assert!(agent.is_halted());

    // Halted agent keeps serving greedy actions from the last good weights
    let action = agent.select_action(&vec![0.3; 10], false).unwrap();
    assert!(action.is_legal(false));
    assert_eq!(agent.maybe_learn().unwrap(), LearnOutcome::Halted);

    // New experience is discarded once training stops
    let steps_at_halt = agent.policy_state().steps;
    agent.record_transition(step_transition(0.5));
    assert_eq!(agent.policy_state().steps, steps_at_halt);
}

#[tokio::test]
async fn test_restore_clears_halt_and_resumes_training() {
    let config = AgentConfig {
        replay_capacity: 16,
        ..fast_learner()
    };
    let agent = PolicyAgent::with_seed(config, 31).unwrap();
    for _ in 0..8 {
        agent.record_transition(step_transition(0.02));
        let _ = agent.maybe_learn().unwrap();
    }
    let healthy = agent.snapshot();

    for _ in 0..16 {
        agent.record_transition(step_transition(f64::NAN));
        let _ = agent.maybe_learn();
    }
    assert!(agent.is_halted());

    agent.restore(&healthy).unwrap();
    assert!(!agent.is_halted());
    assert_eq!(agent.policy_state(), healthy.state);

    // Refill the small buffer with clean experience; the poisoned
    // transitions age out before learning resumes.
    for _ in 0..16 {
        agent.record_transition(step_transition(0.02));
    }
    assert!(matches!(
        agent.maybe_learn().unwrap(),
        LearnOutcome::Updated { .. }
    ));
}

#[tokio::test]
async fn test_snapshot_restore_reproduces_greedy_decisions() {
    let config = AgentConfig {
        epsilon_start: 0.0,
        epsilon_floor: 0.0,
        ..fast_learner()
    };
    let trained = PolicyAgent::with_seed(config.clone(), 37).unwrap();
    for i in 0..64 {
        let reward = if i % 3 == 0 { 0.05 } else { -0.01 };
        trained.record_transition(step_transition(reward));
        let _ = trained.maybe_learn().unwrap();
    }
    let snapshot = trained.snapshot();

    // A differently seeded agent converges to the same choices once restored
    let restored = PolicyAgent::with_seed(config, 4242).unwrap();
    restored.restore(&snapshot).unwrap();

    for probe in 0..20 {
        let state: Vec<f64> = (0..10).map(|d| ((probe * 7 + d) as f64).sin()).collect();
        for position_open in [false, true] {
            assert_eq!(
                trained.select_action(&state, position_open).unwrap(),
                restored.select_action(&state, position_open).unwrap(),
                "decision drifted for probe {probe}"
            );
        }
    }
    assert_eq!(restored.policy_state(), snapshot.state);
}

#[tokio::test]
async fn test_checkpoint_file_round_trip_preserves_policy() {
    let path = temp_checkpoint_path("roundtrip");
    let store = CheckpointStore::new(path.clone());

    let config = AgentConfig {
        epsilon_start: 0.0,
        epsilon_floor: 0.0,
        ..fast_learner()
    };
    let agent = PolicyAgent::with_seed(config.clone(), 41).unwrap();
    for _ in 0..32 {
        agent.record_transition(step_transition(0.01));
        let _ = agent.maybe_learn().unwrap();
    }

    let checkpoint = Checkpoint::new(agent.snapshot(), BTreeMap::new(), agent.replay_stats());
    store.save(&checkpoint).await.unwrap();
    let loaded = store.load().await.unwrap().expect("checkpoint should exist");

    let revived = PolicyAgent::with_seed(config, 99).unwrap();
    revived.restore(&loaded.policy).unwrap();

    let state = vec![0.25; 10];
    assert_eq!(
        revived.select_action(&state, false).unwrap(),
        agent.select_action(&state, false).unwrap()
    );
    assert_eq!(revived.policy_state(), agent.policy_state());

    let _ = std::fs::remove_file(path);
}

proptest! {
    #[test]
    fn prop_replay_never_exceeds_capacity(
        capacity in 1usize..64,
        pushes in 0usize..200,
    ) {
        let mut buffer = ReplayBuffer::new(capacity);
        for i in 0..pushes {
            buffer.push(Transition::new(
                vec![i as f64; 4],
                TradeAction::Hold,
                0.0,
                vec![i as f64; 4],
                false,
            ));
            prop_assert!(buffer.len() <= capacity);
        }
        prop_assert_eq!(buffer.len(), pushes.min(capacity));
    }

    #[test]
    fn prop_replay_evicts_oldest_first(pushes in 1usize..100) {
        let capacity = 16;
        let mut buffer = ReplayBuffer::new(capacity);
        for i in 0..pushes {
            buffer.push(Transition::new(
                vec![i as f64],
                TradeAction::Hold,
                i as f64,
                vec![i as f64],
                false,
            ));
        }
        let expected_oldest = pushes.saturating_sub(capacity) as f64;
        let oldest = buffer.oldest().expect("buffer is non-empty");
        prop_assert!((oldest.reward - expected_oldest).abs() < f64::EPSILON);
    }

    #[test]
    fn prop_sampled_batch_is_bounded(fill in 1usize..40, batch in 1usize..64) {
        let mut buffer = ReplayBuffer::new(64);
        for i in 0..fill {
            buffer.push(Transition::new(
                vec![i as f64],
                TradeAction::Hold,
                0.0,
                vec![i as f64],
                false,
            ));
        }
        let mut rng = SmallRng::seed_from_u64(7);
        let sampled = buffer.sample(&mut rng, batch);
        prop_assert_eq!(sampled.len(), batch.min(fill));
    }
}
