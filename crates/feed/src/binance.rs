use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use adlts_models::{
    AccountBalance, EngineError, Fill, MarketSnapshot, OrderSpec, Result,
};

use crate::provider::ExchangeProvider;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Market-data integration for Binance spot REST klines. Data-only: order
/// submission and balance queries are deliberately unsupported, so wiring
/// this provider as a trading venue fails loudly instead of silently.
pub struct BinanceProvider {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceProvider {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::connectivity("binance", format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// "BTC/USDT" → "BTCUSDT".
    fn venue_symbol(symbol: &str) -> String {
        symbol.replace(['/', '-'], "")
    }

    fn parse_candle_row(row: &[serde_json::Value]) -> Option<(DateTime<Utc>, [Decimal; 5])> {
        if row.len() < 7 {
            return None;
        }
        let open_time = DateTime::from_timestamp_millis(row[0].as_i64()?)?;
        let mut values = [Decimal::ZERO; 5];
        for (slot, cell) in values.iter_mut().zip(&row[1..6]) {
            *slot = cell.as_str()?.parse().ok()?;
        }
        Some((open_time, values))
    }
}

#[async_trait]
impl ExchangeProvider for BinanceProvider {
    fn source_id(&self) -> &str {
        "binance"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<MarketSnapshot> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            Self::venue_symbol(symbol),
            timeframe,
            limit.clamp(2, 1000)
        );
        debug!(%url, "fetching klines");
        let started = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::connectivity("binance", format!("klines request: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::connectivity(
                "binance",
                format!("klines API status {}", response.status()),
            ));
        }
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| EngineError::DataIntegrity(format!("klines payload: {e}")))?;

        // The final row is the still-forming candle; report the newest
        // closed one.
        let row = if rows.len() >= 2 {
            &rows[rows.len() - 2]
        } else {
            rows.last().ok_or_else(|| {
                EngineError::DataIntegrity(format!("empty klines response for {symbol}"))
            })?
        };
        let (open_time, [open, high, low, close, volume]) = Self::parse_candle_row(row)
            .ok_or_else(|| {
                EngineError::DataIntegrity(format!("malformed kline row for {symbol}"))
            })?;

        let snapshot = MarketSnapshot::new(
            symbol.to_string(),
            open_time,
            open,
            high,
            low,
            close,
            volume,
            self.source_id().to_string(),
        )?;
        Ok(snapshot.with_latency(started.elapsed().as_millis() as u64))
    }

    async fn submit_order(&self, spec: &OrderSpec) -> Result<Fill> {
        Err(EngineError::execution(
            &spec.symbol,
            "binance integration is data-only; configure a trading venue for orders",
        ))
    }

    async fn query_balance(&self) -> Result<AccountBalance> {
        Err(EngineError::Config(
            "binance integration is data-only; no trading account configured".to_string(),
        ))
    }
}
