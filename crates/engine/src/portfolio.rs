use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use adlts_models::{EngineError, ExitReason, Position, Result, TradeOutcome};

/// Cash and positions for one trading session. Margin-style accounting:
/// balance moves only when a trade closes, by its realized P&L. At most one
/// open position per symbol.
pub struct Portfolio {
    initial_balance: Decimal,
    balance: RwLock<Decimal>,
    positions: DashMap<String, Position>,
    closed: Mutex<Vec<TradeOutcome>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub balance: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
    pub closed_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
}

impl Portfolio {
    pub fn new(initial_balance: Decimal) -> Result<Self> {
        if initial_balance <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "initial balance must be positive, got {initial_balance}"
            )));
        }
        Ok(Self {
            initial_balance,
            balance: RwLock::new(initial_balance),
            positions: DashMap::new(),
            closed: Mutex::new(Vec::new()),
        })
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.read()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|entry| entry.clone())
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn open_position(&self, position: Position) -> Result<()> {
        if self.positions.contains_key(&position.symbol) {
            return Err(EngineError::Position(format!(
                "position already open for {}",
                position.symbol
            )));
        }
        info!(
            symbol = %position.symbol,
            side = ?position.side,
            entry = %position.entry_price,
            quantity = %position.quantity,
            stop = %position.stop_loss,
            target = %position.take_profit,
            "📈 position opened"
        );
        self.positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    /// Closes the open position for `symbol` at `exit_price` and applies the
    /// realized P&L to the balance. The returned outcome is the policy's
    /// reward signal.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<TradeOutcome> {
        let (_, mut position) = self.positions.remove(symbol).ok_or_else(|| {
            EngineError::Position(format!("no open position for {symbol}"))
        })?;
        // Close validates before it mutates, so on failure the position goes
        // back untouched.
        let outcome = match position.close(exit_price, closed_at, reason) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.positions.insert(symbol.to_string(), position);
                return Err(e);
            }
        };

        {
            let mut balance = self.balance.write();
            *balance += outcome.realized_pnl;
        }
        info!(
            symbol = %outcome.symbol,
            pnl = %outcome.realized_pnl,
            return_pct = format!("{:.3}%", outcome.return_fraction * 100.0),
            reason = %outcome.exit_reason,
            balance = %self.balance(),
            "📉 position closed"
        );
        self.closed.lock().push(outcome.clone());
        Ok(outcome)
    }

    pub fn closed_outcomes(&self) -> Vec<TradeOutcome> {
        self.closed.lock().clone()
    }

    pub fn summary(&self) -> PortfolioSummary {
        let balance = self.balance();
        let closed = self.closed.lock();
        let wins = closed.iter().filter(|outcome| outcome.is_win()).count();
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            wins as f64 / closed.len() as f64
        };
        PortfolioSummary {
            balance,
            realized_pnl: balance - self.initial_balance,
            open_positions: self.positions.len(),
            closed_trades: closed.len(),
            wins,
            win_rate,
        }
    }

    /// Return on initial balance, used as a state feature and in summaries.
    pub fn session_return(&self) -> f64 {
        ((self.balance() - self.initial_balance) / self.initial_balance)
            .to_f64()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adlts_models::PositionSide;
    use rust_decimal_macros::dec;

    fn portfolio() -> Portfolio {
        Portfolio::new(dec!(10000)).unwrap()
    }

    fn long(symbol: &str) -> Position {
        Position::open(
            symbol.to_string(),
            PositionSide::Long,
            dec!(100),
            dec!(2),
            dec!(98),
            dec!(105),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_one_position_per_symbol() {
        let portfolio = portfolio();
        portfolio.open_position(long("BTC/USDT")).unwrap();

        assert!(portfolio.has_open_position("BTC/USDT"));
        assert!(portfolio.open_position(long("BTC/USDT")).is_err());
        // A different symbol is unaffected.
        portfolio.open_position(long("ETH/USDT")).unwrap();
    }

    #[test]
    fn test_close_applies_realized_pnl() {
        let portfolio = portfolio();
        portfolio.open_position(long("BTC/USDT")).unwrap();

        let outcome = portfolio
            .close_position("BTC/USDT", dec!(104), Utc::now(), ExitReason::Manual)
            .unwrap();

        assert_eq!(outcome.realized_pnl, dec!(8));
        assert_eq!(portfolio.balance(), dec!(10008));
        assert!(!portfolio.has_open_position("BTC/USDT"));
        assert_eq!(portfolio.closed_outcomes().len(), 1);
    }

    #[test]
    fn test_losing_close_reduces_balance() {
        let portfolio = portfolio();
        portfolio.open_position(long("BTC/USDT")).unwrap();

        let outcome = portfolio
            .close_position("BTC/USDT", dec!(98), Utc::now(), ExitReason::Stop)
            .unwrap();

        assert_eq!(outcome.realized_pnl, dec!(-4));
        assert_eq!(portfolio.balance(), dec!(9996));
        assert!(portfolio.session_return() < 0.0);
    }

    #[test]
    fn test_close_without_position_errors() {
        let portfolio = portfolio();
        assert!(portfolio
            .close_position("BTC/USDT", dec!(100), Utc::now(), ExitReason::Manual)
            .is_err());
    }

    #[test]
    fn test_summary_counts_wins() {
        let portfolio = portfolio();

        portfolio.open_position(long("BTC/USDT")).unwrap();
        portfolio
            .close_position("BTC/USDT", dec!(104), Utc::now(), ExitReason::Target)
            .unwrap();

        portfolio.open_position(long("BTC/USDT")).unwrap();
        portfolio
            .close_position("BTC/USDT", dec!(99), Utc::now(), ExitReason::Manual)
            .unwrap();

        let summary = portfolio.summary();
        assert_eq!(summary.closed_trades, 2);
        assert_eq!(summary.wins, 1);
        assert!((summary.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(summary.realized_pnl, dec!(6));
    }

    #[test]
    fn test_zero_initial_balance_rejected() {
        assert!(Portfolio::new(Decimal::ZERO).is_err());
    }
}
