use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use adlts_models::{
    AccountBalance, EngineError, Fill, MarketSnapshot, OrderSide, OrderSpec, Result,
};

use crate::provider::{timeframe_duration, ExchangeProvider};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub initial_price: Decimal,
    /// Per-bar shock magnitude of the random walk.
    pub volatility: f64,
    pub drift: f64,
    pub initial_balance: Decimal,
    pub currency: String,
    pub seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_price: Decimal::from(50_000),
            volatility: 0.01,
            drift: 0.0,
            initial_balance: Decimal::from(10_000),
            currency: "USDT".to_string(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PaperMarket {
    close: f64,
    next_open_time: DateTime<Utc>,
}

/// Fully simulated venue: candles follow a random walk, orders fill
/// instantly at the last close.
///
/// Paper time advances one bar per fetch, so polling faster than the
/// timeframe fast-forwards the market rather than repeating candles. Failure
/// injection knobs let tests exercise fallback, retry and halt paths.
pub struct PaperExchange {
    config: PaperConfig,
    initial_close: f64,
    markets: DashMap<String, PaperMarket>,
    cash: RwLock<Decimal>,
    rng: Mutex<SmallRng>,
    scripted_closes: Mutex<VecDeque<Decimal>>,
    failing_fetches: AtomicU32,
    failing_orders: AtomicU32,
    rejecting_orders: AtomicBool,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Result<Self> {
        if config.initial_price <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "paper initial price must be positive, got {}",
                config.initial_price
            )));
        }
        if config.initial_balance < Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "paper initial balance must not be negative, got {}",
                config.initial_balance
            )));
        }
        if !(config.volatility.is_finite() && config.volatility >= 0.0 && config.volatility < 1.0)
        {
            return Err(EngineError::Config(format!(
                "paper volatility must be in [0, 1), got {}",
                config.volatility
            )));
        }
        let initial_close = config.initial_price.to_f64().ok_or_else(|| {
            EngineError::Config(format!("initial price {} not representable", config.initial_price))
        })?;
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self {
            initial_close,
            cash: RwLock::new(config.initial_balance),
            config,
            markets: DashMap::new(),
            rng: Mutex::new(rng),
            scripted_closes: Mutex::new(VecDeque::new()),
            failing_fetches: AtomicU32::new(0),
            failing_orders: AtomicU32::new(0),
            rejecting_orders: AtomicBool::new(false),
        })
    }

    /// Next `count` fetches fail with a connectivity error, then recover.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::Release);
    }

    /// Next `count` order submissions fail with a retryable error.
    pub fn fail_next_orders(&self, count: u32) {
        self.failing_orders.store(count, Ordering::Release);
    }

    /// Hard-reject every order until switched off again.
    pub fn reject_orders(&self, rejecting: bool) {
        self.rejecting_orders.store(rejecting, Ordering::Release);
    }

    /// Queues closing prices the next fetches will replay in order instead
    /// of the random walk.
    pub fn script_closes<I: IntoIterator<Item = Decimal>>(&self, closes: I) {
        self.scripted_closes.lock().extend(closes);
    }

    pub fn last_close(&self, symbol: &str) -> Option<Decimal> {
        self.markets
            .get(symbol)
            .and_then(|market| Decimal::from_f64(market.close))
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn to_decimal(value: f64) -> Result<Decimal> {
        Decimal::from_f64(value)
            .map(|d| d.round_dp(8))
            .ok_or_else(|| EngineError::InvalidPrice(format!("{value} not representable")))
    }
}

#[async_trait]
impl ExchangeProvider for PaperExchange {
    fn source_id(&self) -> &str {
        "paper"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        _limit: usize,
    ) -> Result<MarketSnapshot> {
        if Self::take_failure(&self.failing_fetches) {
            return Err(EngineError::connectivity("paper", "injected fetch failure"));
        }
        let step = timeframe_duration(timeframe)?;
        let started = Instant::now();

        let mut market = self.markets.entry(symbol.to_string()).or_insert_with(|| {
            let aligned = Utc::now().duration_trunc(step).unwrap_or_else(|_| Utc::now());
            PaperMarket {
                close: self.initial_close,
                next_open_time: aligned,
            }
        });

        let open = market.close;
        let close = match self.scripted_closes.lock().pop_front() {
            Some(scripted) => scripted.to_f64().ok_or_else(|| {
                EngineError::InvalidPrice(format!("scripted close {scripted} not representable"))
            })?,
            None => {
                let mut rng = self.rng.lock();
                let shock = rng.gen_range(-1.0..1.0) * self.config.volatility;
                (open * (1.0 + self.config.drift + shock)).max(f64::EPSILON)
            }
        };
        let (wick, volume) = {
            let mut rng = self.rng.lock();
            (
                rng.gen_range(0.0..=self.config.volatility * 0.5),
                rng.gen_range(10.0..1000.0),
            )
        };
        let high = open.max(close) * (1.0 + wick);
        let low = (open.min(close) * (1.0 - wick)).max(f64::EPSILON);

        let timestamp = market.next_open_time;
        market.close = close;
        market.next_open_time = timestamp + step;
        drop(market);

        let snapshot = MarketSnapshot::new(
            symbol.to_string(),
            timestamp,
            Self::to_decimal(open)?,
            Self::to_decimal(high)?,
            Self::to_decimal(low)?,
            Self::to_decimal(close)?,
            Self::to_decimal(volume)?,
            self.source_id().to_string(),
        )?;
        debug!(symbol, %timestamp, close, "🧪 paper candle emitted");
        Ok(snapshot.with_latency(started.elapsed().as_millis() as u64))
    }

    async fn submit_order(&self, spec: &OrderSpec) -> Result<Fill> {
        if self.rejecting_orders.load(Ordering::Acquire) {
            return Err(EngineError::execution(&spec.symbol, "injected order rejection"));
        }
        if Self::take_failure(&self.failing_orders) {
            return Err(EngineError::connectivity("paper", "injected order failure"));
        }

        let price_value = self
            .markets
            .get(&spec.symbol)
            .map(|market| market.close)
            .unwrap_or(self.initial_close);
        let price = Self::to_decimal(price_value)?;
        let notional = price * spec.quantity;

        // Simplified cash model: no margin accounting, never below zero. The
        // engine's own portfolio ledger is authoritative for risk.
        {
            let mut cash = self.cash.write();
            *cash = match spec.side {
                OrderSide::Buy => (*cash - notional).max(Decimal::ZERO),
                OrderSide::Sell => *cash + notional,
            };
        }

        Ok(Fill {
            order_id: Uuid::new_v4(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            price,
            quantity: spec.quantity,
            filled_at: Utc::now(),
        })
    }

    async fn query_balance(&self) -> Result<AccountBalance> {
        let cash = *self.cash.read();
        AccountBalance::new(self.config.currency.clone(), cash, cash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        PaperExchange::new(PaperConfig {
            seed: Some(42),
            ..PaperConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_candles_advance_one_bar_per_fetch() {
        let venue = exchange();
        let first = venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.unwrap();
        let second = venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.unwrap();

        assert_eq!(second.timestamp - first.timestamp, chrono::Duration::hours(1));
        assert_eq!(second.open, first.close);
        assert!(second.high >= second.low);
        assert_eq!(second.source, "paper");
    }

    #[tokio::test]
    async fn test_scripted_closes_replay_in_order() {
        let venue = exchange();
        venue.script_closes([dec!(100), dec!(98), dec!(96)]);

        for expected in [dec!(100), dec!(98), dec!(96)] {
            let candle = venue.fetch_ohlcv("BTC/USDT", "1m", 2).await.unwrap();
            assert_eq!(candle.close, expected);
        }
    }

    #[tokio::test]
    async fn test_injected_fetch_failures_then_recovery() {
        let venue = exchange();
        venue.fail_next_fetches(2);

        assert!(venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.is_err());
        assert!(venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.is_err());
        assert!(venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_orders_fill_and_move_cash() {
        let venue = exchange();
        venue.fetch_ohlcv("BTC/USDT", "1h", 2).await.unwrap();

        let spec = OrderSpec::new("BTC/USDT".to_string(), OrderSide::Buy, dec!(0.01)).unwrap();
        let fill = venue.submit_order(&spec).await.unwrap();
        assert_eq!(fill.quantity, dec!(0.01));
        assert!(fill.price > Decimal::ZERO);

        let balance = venue.query_balance().await.unwrap();
        assert!(balance.total < dec!(10000));
    }

    #[tokio::test]
    async fn test_order_rejection_is_not_retryable() {
        let venue = exchange();
        venue.reject_orders(true);
        let spec = OrderSpec::new("BTC/USDT".to_string(), OrderSide::Buy, dec!(0.01)).unwrap();

        let err = venue.submit_order(&spec).await.unwrap_err();
        assert!(!err.is_retryable());

        venue.reject_orders(false);
        venue.fail_next_orders(1);
        let err = venue.submit_order(&spec).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
