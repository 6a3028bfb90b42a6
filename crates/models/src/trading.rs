use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{EngineError, Result};
use crate::market::{OrderSide, OrderSpec};

pub const ACTION_COUNT: usize = 4;

/// Discrete actions the policy can take. The index mapping is the output
/// ordering of the value estimator and must stay stable across checkpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeAction {
    Hold,
    OpenLong,
    OpenShort,
    Close,
}

impl TradeAction {
    pub const fn index(self) -> usize {
        match self {
            TradeAction::Hold => 0,
            TradeAction::OpenLong => 1,
            TradeAction::OpenShort => 2,
            TradeAction::Close => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(TradeAction::Hold),
            1 => Some(TradeAction::OpenLong),
            2 => Some(TradeAction::OpenShort),
            3 => Some(TradeAction::Close),
            _ => None,
        }
    }

    /// Actions that are legal given whether a position is currently open.
    /// Illegal actions are filtered out before selection, never penalized
    /// after the fact.
    pub fn legal_when(position_open: bool) -> &'static [TradeAction] {
        if position_open {
            &[TradeAction::Hold, TradeAction::Close]
        } else {
            &[TradeAction::Hold, TradeAction::OpenLong, TradeAction::OpenShort]
        }
    }

    pub fn is_legal(self, position_open: bool) -> bool {
        Self::legal_when(position_open).contains(&self)
    }

    pub fn opens(self) -> Option<PositionSide> {
        match self {
            TradeAction::OpenLong => Some(PositionSide::Long),
            TradeAction::OpenShort => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Hold => write!(f, "hold"),
            TradeAction::OpenLong => write!(f, "open-long"),
            TradeAction::OpenShort => write!(f, "open-short"),
            TradeAction::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short; used for signed P&L and state features.
    pub fn direction(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    Stop,
    Target,
    /// Policy-chosen close.
    Manual,
    /// System-initiated close-out, e.g. the shutdown drain.
    Forced,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Stop => write!(f, "stop"),
            ExitReason::Target => write!(f, "target"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::Forced => write!(f, "forced"),
        }
    }
}

/// An open or historical position. At most one open position may exist per
/// symbol; the portfolio enforces that invariant. Once `close` succeeds the
/// position is terminal and every further mutation attempt errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: String,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<Self> {
        if entry_price <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice(format!(
                "entry price must be positive, got {entry_price}"
            )));
        }
        if quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity {
                amount: quantity.to_string(),
            });
        }
        let levels_valid = match side {
            PositionSide::Long => stop_loss < entry_price && take_profit > entry_price,
            PositionSide::Short => stop_loss > entry_price && take_profit < entry_price,
        };
        if !levels_valid {
            return Err(EngineError::InvalidPrice(format!(
                "stop {stop_loss} / target {take_profit} on wrong side of entry {entry_price} for {side:?}"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            status: PositionStatus::Open,
            opened_at,
            closed_at: None,
            exit_price: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn entry_notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    pub fn unrealized_return(&self, price: Decimal) -> f64 {
        let notional = self.entry_notional();
        if notional.is_zero() {
            return 0.0;
        }
        (self.unrealized_pnl(price) / notional).to_f64().unwrap_or(0.0)
    }

    pub fn close(
        &mut self,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<TradeOutcome> {
        if !self.is_open() {
            return Err(EngineError::Position(format!(
                "position {} for {} is already closed",
                self.id, self.symbol
            )));
        }
        if exit_price <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice(format!(
                "exit price must be positive, got {exit_price}"
            )));
        }

        self.status = PositionStatus::Closed;
        self.closed_at = Some(closed_at);
        self.exit_price = Some(exit_price);

        let realized_pnl = self.unrealized_pnl(exit_price);
        let notional = self.entry_notional();
        let return_fraction = if notional.is_zero() {
            0.0
        } else {
            (realized_pnl / notional).to_f64().unwrap_or(0.0)
        };

        Ok(TradeOutcome {
            position_id: self.id,
            symbol: self.symbol.clone(),
            side: self.side,
            realized_pnl,
            return_fraction,
            holding_secs: (closed_at - self.opened_at).num_seconds(),
            exit_reason: reason,
            closed_at,
        })
    }
}

/// The realized result of one closed trade. This is the only reward signal
/// the policy receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeOutcome {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub realized_pnl: Decimal,
    pub return_fraction: f64,
    pub holding_secs: i64,
    pub exit_reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// An order the risk manager has cleared for submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovedOrder {
    pub action: TradeAction,
    pub spec: OrderSpec,
    pub side: Option<PositionSide>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RiskRejection {
    PositionAlreadyOpen { symbol: String },
    SizeExceedsLimit { requested: Decimal, limit: Decimal },
    InsufficientBalance { balance: Decimal },
    NothingToClose { symbol: String },
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskRejection::PositionAlreadyOpen { symbol } => {
                write!(f, "position already open for {symbol}")
            }
            RiskRejection::SizeExceedsLimit { requested, limit } => {
                write!(f, "requested size {requested} exceeds limit {limit}")
            }
            RiskRejection::InsufficientBalance { balance } => {
                write!(f, "insufficient balance {balance}")
            }
            RiskRejection::NothingToClose { symbol } => {
                write!(f, "no open position to close for {symbol}")
            }
        }
    }
}

/// Risk review outcome. Rejections are ordinary control flow (the loop
/// degrades the tick to a hold), never errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RiskVerdict {
    Approved(ApprovedOrder),
    Rejected(RiskRejection),
    NoAction,
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position::open(
            "BTC/USDT".to_string(),
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
    fn test_action_legality() {
        assert!(TradeAction::Hold.is_legal(true));
        assert!(TradeAction::Close.is_legal(true));
        assert!(!TradeAction::OpenLong.is_legal(true));
        assert!(!TradeAction::OpenShort.is_legal(true));

        assert!(TradeAction::Hold.is_legal(false));
        assert!(TradeAction::OpenLong.is_legal(false));
        assert!(TradeAction::OpenShort.is_legal(false));
        assert!(!TradeAction::Close.is_legal(false));
    }

    #[test]
    fn test_action_index_round_trip() {
        for index in 0..ACTION_COUNT {
            let action = TradeAction::from_index(index).unwrap();
            assert_eq!(action.index(), index);
        }
        assert!(TradeAction::from_index(ACTION_COUNT).is_none());
    }

    #[test]
    fn test_position_levels_validated() {
        // Stop above entry is invalid for a long.
        let result = Position::open(
            "BTC/USDT".to_string(),
            PositionSide::Long,
            dec!(100),
            dec!(1),
            dec!(102),
            dec!(105),
            Utc::now(),
        );
        assert!(result.is_err());

        // Mirrored levels are required for a short.
        let result = Position::open(
            "BTC/USDT".to_string(),
            PositionSide::Short,
            dec!(100),
            dec!(1),
            dec!(102),
            dec!(95),
            Utc::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_unrealized_pnl_by_side() {
        let long = long_position();
        assert_eq!(long.unrealized_pnl(dec!(103)), dec!(6));
        assert_eq!(long.unrealized_pnl(dec!(99)), dec!(-2));

        let short = Position::open(
            "BTC/USDT".to_string(),
            PositionSide::Short,
            dec!(100),
            dec!(2),
            dec!(102),
            dec!(95),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(short.unrealized_pnl(dec!(97)), dec!(6));
        assert_eq!(short.unrealized_pnl(dec!(101)), dec!(-2));
    }

    #[test]
    fn test_close_produces_outcome_and_seals_position() {
        let mut position = long_position();
        let outcome = position
            .close(dec!(104), Utc::now(), ExitReason::Manual)
            .unwrap();

        assert_eq!(outcome.realized_pnl, dec!(8));
        assert!((outcome.return_fraction - 0.04).abs() < 1e-9);
        assert!(outcome.is_win());
        assert!(!position.is_open());

        // Closed positions are immutable history.
        assert!(position.close(dec!(105), Utc::now(), ExitReason::Manual).is_err());
    }

    #[test]
    fn test_losing_close_has_negative_outcome() {
        let mut position = long_position();
        let outcome = position
            .close(dec!(98), Utc::now(), ExitReason::Stop)
            .unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::Stop);
        assert_eq!(outcome.realized_pnl, dec!(-4));
        assert!(!outcome.is_win());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // A long and a short with identical entry and size are exact
            // mirrors at every price.
            #[test]
            fn prop_long_short_pnl_antisymmetric(price in 1u32..200_000u32) {
                let price = Decimal::from(price);
                let long = long_position();
                let short = Position::open(
                    "BTC/USDT".to_string(),
                    PositionSide::Short,
                    dec!(100),
                    dec!(2),
                    dec!(102),
                    dec!(95),
                    Utc::now(),
                )
                .unwrap();

                prop_assert_eq!(long.unrealized_pnl(price), -short.unrealized_pnl(price));
            }
        }
    }
}
