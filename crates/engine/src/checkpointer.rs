use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use adlts_ml::Forecaster;
use adlts_rl::PolicyAgent;
use adlts_store::{Checkpoint, CheckpointConfig, CheckpointStore};
use adlts_models::Result;

use crate::metrics::MetricsCollector;

/// Cuts periodic checkpoints of the shared policy and every symbol's
/// forecaster, and restores them at startup. Runs as one task beside the
/// pipelines; the final checkpoint at shutdown is the session's explicit
/// `save_now` call.
pub struct CheckpointService {
    store: CheckpointStore,
    interval: Duration,
    agent: Arc<PolicyAgent>,
    forecasters: BTreeMap<String, Arc<Mutex<Forecaster>>>,
    metrics: Arc<MetricsCollector>,
}

impl CheckpointService {
    pub fn new(
        config: CheckpointConfig,
        agent: Arc<PolicyAgent>,
        forecasters: BTreeMap<String, Arc<Mutex<Forecaster>>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store: CheckpointStore::new(config.path),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            agent,
            forecasters,
            metrics,
        }
    }

    pub async fn save_now(&self) -> Result<()> {
        let policy = self.agent.snapshot();
        let replay = self.agent.replay_stats();
        let forecasters: BTreeMap<_, _> = self
            .forecasters
            .iter()
            .map(|(symbol, forecaster)| (symbol.clone(), forecaster.lock().snapshot()))
            .collect();

        self.store
            .save(&Checkpoint::new(policy, forecasters, replay))
            .await?;
        self.metrics.record_checkpoint();
        Ok(())
    }

    /// Restores the previous session if a checkpoint exists. Symbols present
    /// on only one side are logged and skipped, never fatal.
    pub async fn restore_latest(&self) -> Result<bool> {
        let checkpoint = match self.store.load().await? {
            Some(checkpoint) => checkpoint,
            None => {
                info!("no previous checkpoint, starting fresh");
                return Ok(false);
            }
        };

        self.agent.restore(&checkpoint.policy)?;
        for (symbol, snapshot) in &checkpoint.forecasters {
            match self.forecasters.get(symbol) {
                Some(forecaster) => forecaster.lock().restore(snapshot)?,
                None => warn!(symbol, "checkpointed symbol is no longer configured"),
            }
        }
        for symbol in self.forecasters.keys() {
            if !checkpoint.forecasters.contains_key(symbol) {
                warn!(symbol, "symbol missing from checkpoint, forecaster starts cold");
            }
        }
        info!(
            steps = checkpoint.policy.state.steps,
            epsilon = checkpoint.policy.state.epsilon,
            replay_len = checkpoint.replay.len,
            "🔄 session state restored"
        );
        Ok(true)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.save_now().await {
                        warn!(error = %e, "periodic checkpoint failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
