use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{EngineError, Result};

/// One OHLCV interval as delivered by a market-data source. Construction
/// validates the candle geometry; there are no mutators beyond the two
/// builders, so a snapshot never changes after it enters the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub source: String,
    pub fetch_latency_ms: u64,
    pub is_stale: bool,
}

impl MarketSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        source: String,
    ) -> Result<Self> {
        if open <= Decimal::ZERO || high <= Decimal::ZERO || low <= Decimal::ZERO || close <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice(format!(
                "non-positive price in candle for {symbol}: o={open} h={high} l={low} c={close}"
            )));
        }
        if high < low {
            return Err(EngineError::InvalidPrice(format!(
                "high {high} below low {low} for {symbol}"
            )));
        }
        if open > high || open < low || close > high || close < low {
            return Err(EngineError::InvalidPrice(format!(
                "open/close outside high-low range for {symbol}: o={open} h={high} l={low} c={close}"
            )));
        }
        if volume < Decimal::ZERO {
            return Err(EngineError::InvalidQuantity {
                amount: volume.to_string(),
            });
        }

        Ok(Self {
            symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            source,
            fetch_latency_ms: 0,
            is_stale: false,
        })
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.fetch_latency_ms = latency_ms;
        self
    }

    pub fn mark_stale(mut self) -> Self {
        self.is_stale = true;
        self
    }

    /// Bar range as a fraction of the low, e.g. 0.02 for a 2% high-low spread.
    pub fn range_fraction(&self) -> f64 {
        let spread = (self.high - self.low) / self.low;
        spread.to_f64().unwrap_or(0.0)
    }

    /// Close-over-open change as a signed fraction.
    pub fn change_fraction(&self) -> f64 {
        let change = (self.close - self.open) / self.open;
        change.to_f64().unwrap_or(0.0)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Whether this candle lags the expected tick boundary by more than the
    /// allowed tolerance. Used by the feed to decide staleness.
    pub fn lags_behind(&self, expected: DateTime<Utc>, tolerance: Duration) -> bool {
        expected - self.timestamp > tolerance
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Minimal market-order request handed to an exchange provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

impl OrderSpec {
    pub fn new(symbol: String, side: OrderSide, quantity: Decimal) -> Result<Self> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity {
                amount: quantity.to_string(),
            });
        }
        Ok(Self { symbol, side, quantity })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountBalance {
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
}

impl AccountBalance {
    pub fn new(currency: String, total: Decimal, available: Decimal) -> Result<Self> {
        if total < Decimal::ZERO || available < Decimal::ZERO {
            return Err(EngineError::InvalidQuantity {
                amount: format!("negative balance: total={total} available={available}"),
            });
        }
        if available > total {
            return Err(EngineError::InvalidQuantity {
                amount: format!("available {available} exceeds total {total}"),
            });
        }
        Ok(Self { currency, total, available })
    }
}
