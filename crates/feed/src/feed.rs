use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use adlts_models::{EngineError, MarketSnapshot, Result};

use crate::provider::{timeframe_duration, ExchangeProvider, ProviderRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Source ids in priority order; all of them race on every fetch.
    pub sources: Vec<String>,
    pub fetch_timeout_secs: u64,
    /// How far a candle may lag the expected bar boundary before it counts
    /// as stale.
    pub staleness_tolerance_secs: i64,
    /// Consecutive failures before a source is pulled from rotation.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: i64,
    /// Cache lifetime; `None` derives one tick interval from the timeframe.
    pub cache_ttl_secs: Option<i64>,
    /// History depth forwarded to providers.
    pub candle_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            sources: vec!["paper".to_string()],
            fetch_timeout_secs: 30,
            staleness_tolerance_secs: 7_200,
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
            cache_ttl_secs: None,
            candle_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: MarketSnapshot,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

/// Multi-source market-data ingestion with caching and per-source circuit
/// breaking.
///
/// Every fetch races all healthy sources concurrently; the first successful
/// non-stale candle wins and the remaining attempts are aborted. Sources
/// that keep failing are pulled from rotation until their cool-down expires.
/// Breaker counters and the cache are only touched from the supervising
/// call, never from the racing tasks, so aborting a slow attempt cannot
/// leave either inconsistent.
pub struct DataFeed {
    config: FeedConfig,
    providers: Vec<Arc<dyn ExchangeProvider>>,
    cache: DashMap<String, CacheEntry>,
    breakers: DashMap<String, BreakerState>,
}

impl DataFeed {
    pub fn new(config: FeedConfig, registry: &ProviderRegistry) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(EngineError::Config(
                "data feed needs at least one source".to_string(),
            ));
        }
        if config.breaker_threshold == 0 {
            return Err(EngineError::Config(
                "breaker threshold must be positive".to_string(),
            ));
        }
        let providers = registry.resolve(&config.sources)?;
        info!(sources = ?config.sources, "📡 data feed ready");
        Ok(Self {
            config,
            providers,
            cache: DashMap::new(),
            breakers: DashMap::new(),
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Consecutive failure count currently recorded for a source.
    pub fn failure_count(&self, source_id: &str) -> u32 {
        self.breakers
            .get(source_id)
            .map_or(0, |state| state.consecutive_failures)
    }

    /// Whether a source is currently out of rotation.
    pub fn is_tripped(&self, source_id: &str) -> bool {
        self.breakers
            .get(source_id)
            .and_then(|state| state.open_until)
            .is_some_and(|until| until > Utc::now())
    }

    /// Latest usable candle for symbol+timeframe. Serves from cache within
    /// one tick interval, otherwise races the healthy sources.
    pub async fn fetch(&self, symbol: &str, timeframe: &str) -> Result<MarketSnapshot> {
        let step = timeframe_duration(timeframe)?;
        let key = format!("{symbol}|{timeframe}");
        let now = Utc::now();

        let ttl = self
            .config
            .cache_ttl_secs
            .map_or(step, Duration::seconds);
        let cached = self.cache.get(&key).and_then(|entry| {
            (now - entry.fetched_at < ttl).then(|| entry.snapshot.clone())
        });
        if let Some(snapshot) = cached {
            debug!(symbol, timeframe, "cache hit");
            return Ok(snapshot);
        }

        let expected = now.duration_trunc(step).unwrap_or(now);
        let candidates = self.healthy_sources(now);
        if candidates.is_empty() {
            return Err(EngineError::connectivity(
                "feed",
                "every configured source is circuit-broken",
            ));
        }

        let mut attempts = JoinSet::new();
        for provider in candidates {
            let symbol = symbol.to_string();
            let timeframe = timeframe.to_string();
            let timeout = std::time::Duration::from_secs(self.config.fetch_timeout_secs);
            let limit = self.config.candle_limit;
            attempts.spawn(async move {
                let source = provider.source_id().to_string();
                let result = match tokio::time::timeout(
                    timeout,
                    provider.fetch_ohlcv(&symbol, &timeframe, limit),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::connectivity(&source, "fetch timed out")),
                };
                (source, result)
            });
        }

        let tolerance = Duration::seconds(self.config.staleness_tolerance_secs);
        let mut connectivity_failures = 0u32;
        let mut last_error: Option<EngineError> = None;
        while let Some(joined) = attempts.join_next().await {
            let (source, result) = match joined {
                Ok(pair) => pair,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    warn!(error = %e, "fetch attempt crashed");
                    continue;
                }
            };
            match result {
                Ok(snapshot) if snapshot.lags_behind(expected, tolerance) => {
                    self.record_failure(&source, now);
                    warn!(
                        source,
                        candle = %snapshot.timestamp,
                        expected = %expected,
                        "stale candle rejected"
                    );
                    last_error = Some(EngineError::DataIntegrity(format!(
                        "stale candle from {source}: {} lags {expected}",
                        snapshot.timestamp
                    )));
                }
                Ok(snapshot) => {
                    self.record_success(&source);
                    attempts.abort_all();
                    self.cache.insert(
                        key,
                        CacheEntry {
                            snapshot: snapshot.clone(),
                            fetched_at: now,
                        },
                    );
                    debug!(
                        source,
                        symbol,
                        latency_ms = snapshot.fetch_latency_ms,
                        "candle accepted"
                    );
                    return Ok(snapshot);
                }
                Err(e) => {
                    self.record_failure(&source, now);
                    if e.is_retryable() {
                        connectivity_failures += 1;
                    }
                    warn!(source, error = %e, "source attempt failed");
                    last_error = Some(e);
                }
            }
        }

        // Nothing usable this tick. Report integrity only when some source
        // answered and every answer was bad data.
        match last_error {
            Some(integrity @ EngineError::DataIntegrity(_)) if connectivity_failures == 0 => {
                Err(integrity)
            }
            Some(e) if connectivity_failures == 0 && !e.is_retryable() => Err(e),
            _ => Err(EngineError::connectivity(
                "feed",
                format!("all {} sources failed for {symbol}", self.providers.len()),
            )),
        }
    }

    fn healthy_sources(&self, now: DateTime<Utc>) -> Vec<Arc<dyn ExchangeProvider>> {
        self.providers
            .iter()
            .filter(|provider| {
                let tripped = self
                    .breakers
                    .get(provider.source_id())
                    .and_then(|state| state.open_until)
                    .is_some_and(|until| until > now);
                !tripped
            })
            .cloned()
            .collect()
    }

    fn record_failure(&self, source_id: &str, now: DateTime<Utc>) {
        let mut state = self.breakers.entry(source_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.breaker_threshold {
            state.open_until = Some(now + Duration::seconds(self.config.breaker_cooldown_secs));
            warn!(
                source = source_id,
                failures = state.consecutive_failures,
                cooldown_secs = self.config.breaker_cooldown_secs,
                "⛔ source pulled from rotation"
            );
        }
    }

    fn record_success(&self, source_id: &str) {
        if let Some(mut state) = self.breakers.get_mut(source_id) {
            if state.consecutive_failures > 0 || state.open_until.is_some() {
                info!(source = source_id, "source recovered");
            }
            *state = BreakerState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockExchangeProvider;
    use rust_decimal_macros::dec;

    fn fresh_candle(symbol: &str, source: &str) -> MarketSnapshot {
        MarketSnapshot::new(
            symbol.to_string(),
            Utc::now(),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100.5),
            dec!(25),
            source.to_string(),
        )
        .unwrap()
    }

    fn mock_provider(id: &'static str) -> MockExchangeProvider {
        let mut mock = MockExchangeProvider::new();
        mock.expect_source_id().return_const(id.to_string());
        mock
    }

    fn feed_config(sources: &[&str]) -> FeedConfig {
        FeedConfig {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            fetch_timeout_secs: 2,
            breaker_cooldown_secs: 60,
            ..FeedConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fallback_to_second_source() {
        let mut registry = ProviderRegistry::new();

        let mut broken = mock_provider("kraken");
        broken.expect_fetch_ohlcv().returning(|_, _, _| {
            Err(EngineError::connectivity("kraken", "refused"))
        });
        registry.register(Arc::new(broken));

        let mut healthy = mock_provider("coinbase");
        healthy
            .expect_fetch_ohlcv()
            .returning(|symbol, _, _| Ok(fresh_candle(symbol, "coinbase")));
        registry.register(Arc::new(healthy));

        let feed = DataFeed::new(feed_config(&["kraken", "coinbase"]), &registry).unwrap();
        let snapshot = feed.fetch("BTC/USDT", "1h").await.unwrap();

        assert_eq!(snapshot.source, "coinbase");
        assert_eq!(feed.failure_count("kraken"), 1);
        assert_eq!(feed.failure_count("coinbase"), 0);
    }

    #[tokio::test]
    async fn test_breaker_trips_after_threshold() {
        let mut registry = ProviderRegistry::new();
        let mut broken = mock_provider("kraken");
        broken.expect_fetch_ohlcv().returning(|_, _, _| {
            Err(EngineError::connectivity("kraken", "refused"))
        });
        registry.register(Arc::new(broken));

        let config = FeedConfig {
            cache_ttl_secs: Some(0),
            ..feed_config(&["kraken"])
        };
        let feed = DataFeed::new(config, &registry).unwrap();

        for _ in 0..3 {
            assert!(feed.fetch("BTC/USDT", "1h").await.is_err());
        }
        assert_eq!(feed.failure_count("kraken"), 3);
        assert!(feed.is_tripped("kraken"));

        // With the only source out of rotation the fetch fails fast.
        let err = feed.fetch("BTC/USDT", "1h").await.unwrap_err();
        assert!(matches!(err, EngineError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let mut registry = ProviderRegistry::new();
        let mut provider = mock_provider("paper");
        provider
            .expect_fetch_ohlcv()
            .times(1)
            .returning(|symbol, _, _| Ok(fresh_candle(symbol, "paper")));
        registry.register(Arc::new(provider));

        let feed = DataFeed::new(feed_config(&["paper"]), &registry).unwrap();
        let first = feed.fetch("BTC/USDT", "1h").await.unwrap();
        let second = feed.fetch("BTC/USDT", "1h").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_candles_rejected_as_integrity_failure() {
        let mut registry = ProviderRegistry::new();
        let mut provider = mock_provider("kraken");
        provider.expect_fetch_ohlcv().returning(|symbol, _, _| {
            let old = Utc::now() - Duration::hours(12);
            Ok(MarketSnapshot::new(
                symbol.to_string(),
                old,
                dec!(100),
                dec!(101),
                dec!(99),
                dec!(100.5),
                dec!(25),
                "kraken".to_string(),
            )
            .unwrap())
        });
        registry.register(Arc::new(provider));

        let config = FeedConfig {
            staleness_tolerance_secs: 3_600,
            ..feed_config(&["kraken"])
        };
        let feed = DataFeed::new(config, &registry).unwrap();

        let err = feed.fetch("BTC/USDT", "1h").await.unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
        assert_eq!(feed.failure_count("kraken"), 1);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected_at_startup() {
        let registry = ProviderRegistry::new();
        let result = DataFeed::new(feed_config(&["nowhere"]), &registry);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
