use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use adlts_models::{EngineError, FeatureVector, MarketSnapshot, Result};

/// Feature columns per bar: z-scored close, z-scored volume, one-step log
/// return, high-low range fraction, close-open change fraction.
pub const FEATURE_DIMS: usize = 5;

/// What a pushed snapshot produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    /// Window not full yet; trading stays suppressed.
    WarmingUp { have: usize, need: usize },
    /// Snapshot repeats the newest timestamp; nothing new to act on.
    Duplicate,
    Ready(FeatureVector),
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    timestamp: DateTime<Utc>,
    close: f64,
    volume: f64,
    range_fraction: f64,
    change_fraction: f64,
}

impl Bar {
    fn from_snapshot(snapshot: &MarketSnapshot) -> Result<Self> {
        let close = snapshot.close.to_f64().ok_or_else(|| {
            EngineError::DataIntegrity(format!("close {} not representable", snapshot.close))
        })?;
        let volume = snapshot.volume.to_f64().ok_or_else(|| {
            EngineError::DataIntegrity(format!("volume {} not representable", snapshot.volume))
        })?;
        Ok(Self {
            timestamp: snapshot.timestamp,
            close,
            volume,
            range_fraction: snapshot.range_fraction(),
            change_fraction: snapshot.change_fraction(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowStats {
    mean: f64,
    std: f64,
}

impl WindowStats {
    fn compute<F: Fn(&Bar) -> f64>(bars: &VecDeque<Bar>, select: F) -> Self {
        let n = bars.len() as f64;
        let mean = bars.iter().map(&select).sum::<f64>() / n;
        let variance = bars.iter().map(|b| (select(b) - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: variance.sqrt(),
        }
    }

    /// Zero-variance windows normalize to zero instead of dividing by zero.
    fn zscore(&self, value: f64) -> f64 {
        if self.std > f64::EPSILON {
            (value - self.mean) / self.std
        } else {
            0.0
        }
    }
}

/// Maintains one sliding window of accepted snapshots per symbol and turns a
/// full window into a normalized [`FeatureVector`]. Normalization statistics
/// come from the current window only, so no bar ever sees data newer than
/// itself summarized into its features.
#[derive(Debug)]
pub struct FeatureBuilder {
    window: usize,
    windows: HashMap<String, VecDeque<Bar>>,
}

impl FeatureBuilder {
    pub fn new(window: usize) -> Result<Self> {
        if window < 2 {
            return Err(EngineError::Config(format!(
                "feature window must cover at least 2 bars, got {window}"
            )));
        }
        Ok(Self {
            window,
            windows: HashMap::new(),
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Flattened length of the vectors this builder emits.
    pub fn output_len(&self) -> usize {
        self.window * FEATURE_DIMS
    }

    pub fn bars_seen(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn is_warm(&self, symbol: &str) -> bool {
        self.bars_seen(symbol) >= self.window
    }

    /// Accepts one snapshot. Snapshots that move time backwards are rejected
    /// as integrity failures; repeats of the newest timestamp are skipped
    /// idempotently.
    pub fn push(&mut self, snapshot: &MarketSnapshot) -> Result<FeatureOutcome> {
        let bars = self.windows.entry(snapshot.symbol.clone()).or_default();
        if let Some(last) = bars.back() {
            if snapshot.timestamp < last.timestamp {
                return Err(EngineError::DataIntegrity(format!(
                    "out-of-order snapshot for {}: {} arrived after {}",
                    snapshot.symbol, snapshot.timestamp, last.timestamp
                )));
            }
            if snapshot.timestamp == last.timestamp {
                debug!(symbol = %snapshot.symbol, timestamp = %snapshot.timestamp, "duplicate bar skipped");
                return Ok(FeatureOutcome::Duplicate);
            }
        }

        bars.push_back(Bar::from_snapshot(snapshot)?);
        if bars.len() > self.window {
            bars.pop_front();
        }
        if bars.len() < self.window {
            return Ok(FeatureOutcome::WarmingUp {
                have: bars.len(),
                need: self.window,
            });
        }

        let vector = Self::build_vector(&snapshot.symbol, bars)?;
        Ok(FeatureOutcome::Ready(vector))
    }

    fn build_vector(symbol: &str, bars: &VecDeque<Bar>) -> Result<FeatureVector> {
        let close_stats = WindowStats::compute(bars, |b| b.close);
        let volume_stats = WindowStats::compute(bars, |b| b.volume);

        let mut values = Vec::with_capacity(bars.len() * FEATURE_DIMS);
        let mut prev_close: Option<f64> = None;
        for bar in bars {
            let log_return = match prev_close {
                Some(prev) if prev > 0.0 && bar.close > 0.0 => (bar.close / prev).ln(),
                _ => 0.0,
            };
            values.push(close_stats.zscore(bar.close));
            values.push(volume_stats.zscore(bar.volume));
            values.push(log_return);
            values.push(bar.range_fraction);
            values.push(bar.change_fraction);
            prev_close = Some(bar.close);
        }

        let as_of = bars
            .back()
            .map(|b| b.timestamp)
            .ok_or_else(|| EngineError::InvalidFeatures("empty window".to_string()))?;
        FeatureVector::new(symbol.to_string(), values, bars.len(), FEATURE_DIMS, as_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn snapshot_at(minute: i64, close: Decimal, volume: Decimal) -> MarketSnapshot {
        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let high = close + dec!(1);
        let low = close - dec!(1);
        MarketSnapshot::new(
            "BTC/USDT".to_string(),
            base + Duration::minutes(minute),
            close,
            high,
            low,
            close,
            volume,
            "paper".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_warm_up_until_window_fills() {
        let mut builder = FeatureBuilder::new(4).unwrap();
        for i in 0..3 {
            let outcome = builder
                .push(&snapshot_at(i, dec!(100) + Decimal::from(i), dec!(10)))
                .unwrap();
            assert_eq!(
                outcome,
                FeatureOutcome::WarmingUp {
                    have: (i + 1) as usize,
                    need: 4
                }
            );
        }
        assert!(!builder.is_warm("BTC/USDT"));

        let outcome = builder.push(&snapshot_at(3, dec!(103), dec!(10))).unwrap();
        match outcome {
            FeatureOutcome::Ready(vector) => {
                assert_eq!(vector.window, 4);
                assert_eq!(vector.dims, FEATURE_DIMS);
                assert_eq!(vector.len(), builder.output_len());
            }
            other => panic!("expected vector, got {other:?}"),
        }
        assert!(builder.is_warm("BTC/USDT"));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut builder = FeatureBuilder::new(3).unwrap();
        for i in 0..5 {
            let _ = builder
                .push(&snapshot_at(i, dec!(100) + Decimal::from(i), dec!(10)))
                .unwrap();
        }
        assert_eq!(builder.bars_seen("BTC/USDT"), 3);

        let outcome = builder.push(&snapshot_at(5, dec!(105), dec!(10))).unwrap();
        match outcome {
            FeatureOutcome::Ready(vector) => {
                // Newest bar carries the log return from bar 4 to bar 5.
                let latest = vector.latest_bar();
                assert!((latest[2] - (105.0f64 / 104.0).ln()).abs() < 1e-9);
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_variance_normalizes_to_zero() {
        let mut builder = FeatureBuilder::new(3).unwrap();
        let mut last = FeatureOutcome::Duplicate;
        for i in 0..3 {
            last = builder.push(&snapshot_at(i, dec!(100), dec!(10))).unwrap();
        }
        match last {
            FeatureOutcome::Ready(vector) => {
                for bar in 0..3 {
                    let row = vector.bar(bar).unwrap();
                    assert_eq!(row[0], 0.0);
                    assert_eq!(row[1], 0.0);
                }
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_rejected_duplicate_skipped() {
        let mut builder = FeatureBuilder::new(3).unwrap();
        builder.push(&snapshot_at(5, dec!(100), dec!(10))).unwrap();

        let stale = builder.push(&snapshot_at(4, dec!(101), dec!(10)));
        assert!(matches!(stale, Err(EngineError::DataIntegrity(_))));

        let duplicate = builder.push(&snapshot_at(5, dec!(102), dec!(10))).unwrap();
        assert_eq!(duplicate, FeatureOutcome::Duplicate);
        assert_eq!(builder.bars_seen("BTC/USDT"), 1);
    }

    #[test]
    fn test_symbols_are_isolated() {
        let mut builder = FeatureBuilder::new(2).unwrap();
        builder.push(&snapshot_at(0, dec!(100), dec!(10))).unwrap();

        let mut other = snapshot_at(0, dec!(2000), dec!(5));
        other.symbol = "ETH/USDT".to_string();
        let outcome = builder.push(&other).unwrap();

        assert_eq!(outcome, FeatureOutcome::WarmingUp { have: 1, need: 2 });
        assert_eq!(builder.bars_seen("BTC/USDT"), 1);
        assert_eq!(builder.bars_seen("ETH/USDT"), 1);
    }

    #[test]
    fn test_rejects_degenerate_window() {
        assert!(FeatureBuilder::new(1).is_err());
    }
}
