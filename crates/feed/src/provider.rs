use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::warn;

use adlts_models::{AccountBalance, EngineError, Fill, MarketSnapshot, OrderSpec, Result};

/// Capability surface of one market venue. The engine talks to every venue
/// through this trait only; concrete integrations register under a stable
/// source id and are resolved once at startup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    /// Identifier used for fallback ordering, caching and circuit breaking.
    fn source_id(&self) -> &str;

    /// Newest closed candle for the symbol. `limit` bounds how much history
    /// the venue may pull to answer.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<MarketSnapshot>;

    async fn submit_order(&self, spec: &OrderSpec) -> Result<Fill>;

    async fn query_balance(&self) -> Result<AccountBalance>;
}

/// Parses timeframe strings like "1m", "15m", "1h", "4h", "1d".
pub fn timeframe_duration(timeframe: &str) -> Result<Duration> {
    if timeframe.len() < 2 {
        return Err(EngineError::Config(format!(
            "unrecognized timeframe '{timeframe}'"
        )));
    }
    let (digits, unit) = timeframe.split_at(timeframe.len() - 1);
    let value: i64 = digits.parse().map_err(|_| {
        EngineError::Config(format!("unrecognized timeframe '{timeframe}'"))
    })?;
    if value <= 0 {
        return Err(EngineError::Config(format!(
            "timeframe must be positive, got '{timeframe}'"
        )));
    }
    match unit {
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        other => Err(EngineError::Config(format!(
            "unrecognized timeframe unit '{other}'"
        ))),
    }
}

/// Maps source ids to provider implementations. Built once during wiring;
/// the feed resolves its ordered candidate list from here at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ExchangeProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ExchangeProvider>) {
        let id = provider.source_id().to_string();
        if self.providers.insert(id.clone(), provider).is_some() {
            warn!(source = %id, "provider re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn ExchangeProvider>> {
        self.providers.get(source_id).cloned()
    }

    /// Resolves an ordered candidate list, erroring on unknown ids so a
    /// misconfigured source list fails at startup rather than at fetch time.
    pub fn resolve(&self, source_ids: &[String]) -> Result<Vec<Arc<dyn ExchangeProvider>>> {
        source_ids
            .iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| EngineError::Config(format!("unknown data source '{id}'")))
            })
            .collect()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
