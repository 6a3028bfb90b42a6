use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use adlts_engine::{state_dim_for, ExecutionConfig, MonitoringConfig, PipelineConfig, RiskConfig};
use adlts_feed::FeedConfig;
use adlts_ml::{ForecasterConfig, FEATURE_DIMS};
use adlts_models::Result as EngineResult;
use adlts_rl::AgentConfig;
use adlts_store::{get_typed, CheckpointConfig, ConfigStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub feed: FeedConfig,
    pub forecaster: ForecasterConfig,
    pub rl: AgentConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub checkpoint: CheckpointConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// Provider the gateway submits orders to; candles may come from any
    /// configured feed source.
    pub venue: String,
    pub initial_balance: Decimal,
    pub stake_fraction: f64,
    pub feature_window: usize,
    pub tick_interval_secs: u64,
    /// Optional JSON config store; tunables found there override the file
    /// and environment values at startup.
    pub config_store_path: Option<String>,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default values
            .set_default("trading.symbols", vec!["BTC/USDT".to_string()])?
            .set_default("trading.timeframe", "1h")?
            .set_default("trading.venue", "paper")?
            .set_default("trading.initial_balance", "10000.00")?
            .set_default("trading.stake_fraction", 0.10)?
            .set_default("trading.feature_window", 60)?
            .set_default("trading.tick_interval_secs", 60)?
            .set_default("feed.sources", vec!["paper".to_string()])?
            .set_default("feed.fetch_timeout_secs", 30)?
            .set_default("feed.staleness_tolerance_secs", 7200)?
            .set_default("feed.breaker_threshold", 3)?
            .set_default("feed.breaker_cooldown_secs", 60)?
            .set_default("feed.candle_limit", 100)?
            .set_default("forecaster.input_dim", 300)?
            .set_default("forecaster.hidden_dim", 50)?
            .set_default("forecaster.learning_rate", 0.001)?
            .set_default("forecaster.batch_size", 32)?
            .set_default("forecaster.min_samples", 64)?
            .set_default("forecaster.uncertainty_ceiling", 0.02)?
            .set_default("forecaster.residual_decay", 0.05)?
            .set_default("rl.state_dim", 305)?
            .set_default("rl.hidden_dim", 64)?
            .set_default("rl.learning_rate", 0.001)?
            .set_default("rl.discount", 0.99)?
            .set_default("rl.epsilon_start", 1.0)?
            .set_default("rl.epsilon_floor", 0.01)?
            .set_default("rl.epsilon_decay", 0.995)?
            .set_default("rl.replay_capacity", 10000)?
            .set_default("rl.batch_size", 32)?
            .set_default("rl.min_replay", 256)?
            .set_default("rl.learn_interval", 4)?
            .set_default("rl.target_sync_interval", 100)?
            .set_default("rl.grad_clip", 10.0)?
            .set_default("rl.max_divergences", 3)?
            .set_default("rl.continue_after_halt", true)?
            .set_default("risk.max_position_fraction", 0.10)?
            .set_default("risk.stop_loss_fraction", 0.02)?
            .set_default("risk.take_profit_fraction", 0.05)?
            .set_default("execution.submit_timeout_secs", 10)?
            .set_default("execution.max_attempts", 3)?
            .set_default("execution.backoff_ms", 250)?
            .set_default("execution.resume_after_secs", 300)?
            .set_default("checkpoint.path", "data/checkpoint.json")?
            .set_default("checkpoint.interval_secs", 300)?
            .set_default("monitoring.report_interval_secs", 60)?
            // Add in settings from configuration files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables
            .add_source(Environment::with_prefix("ADLTS").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Policy hyperparameters with the state dimension pinned to what the
    /// configured feature window actually produces.
    pub fn agent_config(&self) -> AgentConfig {
        let mut rl = self.rl.clone();
        rl.state_dim = state_dim_for(self.trading.feature_window);
        rl
    }

    /// Forecaster hyperparameters with the input width pinned to the
    /// configured feature window.
    pub fn forecaster_config(&self) -> ForecasterConfig {
        let mut forecaster = self.forecaster.clone();
        forecaster.input_dim = self.trading.feature_window * FEATURE_DIMS;
        forecaster
    }

    /// Feed settings with the cache lifetime defaulting to one tick
    /// interval when not set explicitly.
    pub fn feed_config(&self) -> FeedConfig {
        let mut feed = self.feed.clone();
        if feed.cache_ttl_secs.is_none() {
            feed.cache_ttl_secs = Some(self.trading.tick_interval_secs as i64);
        }
        feed
    }

    pub fn pipeline_config(&self, symbol: &str) -> PipelineConfig {
        PipelineConfig {
            symbol: symbol.to_string(),
            timeframe: self.trading.timeframe.clone(),
            feature_window: self.trading.feature_window,
            tick_interval_secs: self.trading.tick_interval_secs,
            stake_fraction: self.trading.stake_fraction,
        }
    }

    /// Applies tunables from the external config store over the loaded
    /// configuration. Only known keys are consulted; absent keys leave the
    /// loaded values untouched.
    pub async fn overlay_tunables(&mut self, store: &dyn ConfigStore) -> EngineResult<()> {
        macro_rules! overlay {
            ($key:literal, $target:expr, $ty:ty) => {
                if let Some(value) = get_typed::<$ty>(store, $key).await? {
                    debug!(key = $key, %value, "tunable overridden from config store");
                    $target = value;
                }
            };
        }

        overlay!("risk.max_position_fraction", self.risk.max_position_fraction, f64);
        overlay!("risk.stop_loss_fraction", self.risk.stop_loss_fraction, f64);
        overlay!("risk.take_profit_fraction", self.risk.take_profit_fraction, f64);
        overlay!("trading.stake_fraction", self.trading.stake_fraction, f64);
        overlay!("rl.learning_rate", self.rl.learning_rate, f64);
        overlay!("rl.epsilon_floor", self.rl.epsilon_floor, f64);
        overlay!("rl.epsilon_decay", self.rl.epsilon_decay, f64);
        overlay!("rl.discount", self.rl.discount, f64);
        overlay!("forecaster.learning_rate", self.forecaster.learning_rate, f64);
        overlay!(
            "forecaster.uncertainty_ceiling",
            self.forecaster.uncertainty_ceiling,
            f64
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adlts_store::MemoryConfigStore;
    use serde_json::json;

    #[test]
    fn test_defaults_load_without_files() {
        let config = AppConfig::new().unwrap();
        assert_eq!(config.trading.symbols, vec!["BTC/USDT".to_string()]);
        assert_eq!(config.trading.timeframe, "1h");
        assert_eq!(config.trading.feature_window, 60);
        assert_eq!(config.rl.replay_capacity, 10000);
        assert_eq!(config.risk.stop_loss_fraction, 0.02);
        assert_eq!(config.checkpoint.interval_secs, 300);
    }

    #[test]
    fn test_derived_dimensions_follow_window() {
        let mut config = AppConfig::new().unwrap();
        config.trading.feature_window = 20;

        assert_eq!(config.agent_config().state_dim, state_dim_for(20));
        assert_eq!(config.forecaster_config().input_dim, 20 * FEATURE_DIMS);
        assert_eq!(
            config.feed_config().cache_ttl_secs,
            Some(config.trading.tick_interval_secs as i64)
        );
    }

    #[tokio::test]
    async fn test_store_overlays_known_tunables() {
        let store = MemoryConfigStore::new();
        store
            .set("risk.max_position_fraction", json!(0.05))
            .await
            .unwrap();
        store.set("rl.epsilon_floor", json!(0.02)).await.unwrap();
        store.set("unrelated.key", json!(42)).await.unwrap();

        let mut config = AppConfig::new().unwrap();
        config.overlay_tunables(&store).await.unwrap();

        assert_eq!(config.risk.max_position_fraction, 0.05);
        assert_eq!(config.rl.epsilon_floor, 0.02);
        // Untouched keys keep their defaults.
        assert_eq!(config.risk.take_profit_fraction, 0.05);
    }
}
