use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use adlts_feed::ExchangeProvider;
use adlts_models::{ApprovedOrder, EngineError, Fill, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub submit_timeout_secs: u64,
    pub max_attempts: u32,
    /// Linear backoff base; attempt n sleeps n * backoff_ms before retrying.
    pub backoff_ms: u64,
    /// Automatic resume delay after a halt. `None` keeps the symbol halted
    /// until `clear` is called.
    pub resume_after_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            submit_timeout_secs: 10,
            max_attempts: 3,
            backoff_ms: 250,
            resume_after_secs: Some(300),
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config(
                "execution max_attempts must be at least 1".to_string(),
            ));
        }
        if self.submit_timeout_secs == 0 {
            return Err(EngineError::Config(
                "execution submit_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Submits approved orders to the venue with timeout and retry. A
/// submission that fails for good halts trading on that symbol; the halt
/// lifts manually via `clear` or automatically after the configured resume
/// delay.
pub struct ExecutionGateway {
    config: ExecutionConfig,
    provider: Arc<dyn ExchangeProvider>,
    halted: DashMap<String, DateTime<Utc>>,
}

impl ExecutionGateway {
    pub fn new(config: ExecutionConfig, provider: Arc<dyn ExchangeProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            halted: DashMap::new(),
        })
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        let expired = match self.halted.get(symbol) {
            None => return false,
            Some(entry) => match self.config.resume_after_secs {
                Some(resume_secs) => {
                    Utc::now() >= *entry.value() + chrono::Duration::seconds(resume_secs as i64)
                }
                None => false,
            },
        };
        if expired {
            self.halted.remove(symbol);
            info!(symbol, "▶️ trading resumed after halt interval");
            return false;
        }
        true
    }

    /// Lifts a halt. Returns whether the symbol was halted.
    pub fn clear(&self, symbol: &str) -> bool {
        let was_halted = self.halted.remove(symbol).is_some();
        if was_halted {
            info!(symbol, "▶️ trading halt cleared");
        }
        was_halted
    }

    pub fn halted_symbols(&self) -> Vec<String> {
        self.halted.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn submit(&self, order: &ApprovedOrder) -> Result<Fill> {
        let symbol = order.spec.symbol.clone();
        if self.is_halted(&symbol) {
            return Err(EngineError::execution(
                &symbol,
                "trading is halted after a failed submission",
            ));
        }

        let timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let mut last_error: Option<EngineError> = None;

        for attempt in 1..=self.config.max_attempts {
            match tokio::time::timeout(timeout, self.provider.submit_order(&order.spec)).await {
                Ok(Ok(fill)) => {
                    info!(
                        symbol = %fill.symbol,
                        action = %order.action,
                        side = ?fill.side,
                        price = %fill.price,
                        quantity = %fill.quantity,
                        attempt,
                        "✅ order filled"
                    );
                    return Ok(fill);
                }
                Ok(Err(e)) => {
                    let retryable = e.is_retryable();
                    warn!(
                        symbol,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        retryable,
                        error = %e,
                        "order submission failed"
                    );
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
                Err(_) => {
                    warn!(
                        symbol,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        timeout_secs = self.config.submit_timeout_secs,
                        "order submission timed out"
                    );
                    last_error = Some(EngineError::execution(
                        &symbol,
                        format!(
                            "submission timed out after {}s",
                            self.config.submit_timeout_secs
                        ),
                    ));
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(Duration::from_millis(
                    self.config.backoff_ms * u64::from(attempt),
                ))
                .await;
            }
        }

        self.halted.insert(symbol.clone(), Utc::now());
        error!(symbol, "🛑 trading halted for symbol after failed submission");
        Err(last_error
            .unwrap_or_else(|| EngineError::execution(&symbol, "submission failed")))
    }
}
