use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::warn;

use adlts_models::{
    ApprovedOrder, EngineError, ExitReason, OrderSpec, Position, PositionSide, Result,
    RiskRejection, RiskVerdict, TradeAction,
};

/// Hard limits every order must pass. These are the backstop, not the
/// strategy: the policy can propose anything, only orders inside these
/// bounds reach the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Largest allowed entry notional as a fraction of current balance.
    pub max_position_fraction: f64,
    /// Stop-loss distance from entry, as a fraction of entry price.
    pub stop_loss_fraction: f64,
    /// Take-profit distance from entry, as a fraction of entry price.
    pub take_profit_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.10,
            stop_loss_fraction: 0.02,
            take_profit_fraction: 0.05,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_position_fraction > 0.0 && self.max_position_fraction <= 1.0) {
            return Err(EngineError::Config(format!(
                "max_position_fraction must be in (0, 1], got {}",
                self.max_position_fraction
            )));
        }
        for (name, value) in [
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("take_profit_fraction", self.take_profit_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(EngineError::Config(format!(
                    "{name} must be in (0, 1), got {value}"
                )));
            }
        }
        Ok(())
    }
}

pub struct RiskManager {
    max_fraction: Decimal,
    stop_fraction: Decimal,
    take_fraction: Decimal,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        let as_decimal = |name: &str, value: f64| {
            Decimal::from_f64(value)
                .ok_or_else(|| EngineError::Config(format!("{name} is not representable: {value}")))
        };
        Ok(Self {
            max_fraction: as_decimal("max_position_fraction", config.max_position_fraction)?,
            stop_fraction: as_decimal("stop_loss_fraction", config.stop_loss_fraction)?,
            take_fraction: as_decimal("take_profit_fraction", config.take_profit_fraction)?,
        })
    }

    /// Stop and take levels for an entry at `price`, mirrored for shorts.
    pub fn exit_levels(&self, side: PositionSide, price: Decimal) -> (Decimal, Decimal) {
        match side {
            PositionSide::Long => (
                price * (Decimal::ONE - self.stop_fraction),
                price * (Decimal::ONE + self.take_fraction),
            ),
            PositionSide::Short => (
                price * (Decimal::ONE + self.stop_fraction),
                price * (Decimal::ONE - self.take_fraction),
            ),
        }
    }

    /// Checks an open position against its stop and take levels. Runs on
    /// every tick before the policy's choice is considered; a breach forces
    /// a Close no matter what the policy wanted. Stop wins when one bar
    /// gaps through both levels.
    pub fn enforce_exits(&self, position: &Position, price: Decimal) -> Option<ApprovedOrder> {
        let reason = match position.side {
            PositionSide::Long if price <= position.stop_loss => ExitReason::Stop,
            PositionSide::Long if price >= position.take_profit => ExitReason::Target,
            PositionSide::Short if price >= position.stop_loss => ExitReason::Stop,
            PositionSide::Short if price <= position.take_profit => ExitReason::Target,
            _ => return None,
        };
        warn!(
            symbol = %position.symbol,
            side = ?position.side,
            price = %price,
            stop = %position.stop_loss,
            target = %position.take_profit,
            reason = %reason,
            "🛑 protective exit triggered"
        );
        let spec = OrderSpec::new(
            position.symbol.clone(),
            position.side.exit_order_side(),
            position.quantity,
        )
        .ok()?;
        Some(ApprovedOrder {
            action: TradeAction::Close,
            spec,
            side: Some(position.side),
            stop_loss: None,
            take_profit: None,
            exit_reason: Some(reason),
        })
    }

    /// Reviews the policy's chosen action. `stake_fraction` is the fraction
    /// of balance the engine wants to commit; anything above the configured
    /// maximum is rejected, so a misconfigured stake can never oversize an
    /// order. Rejections are verdicts, not errors.
    pub fn authorize(
        &self,
        symbol: &str,
        action: TradeAction,
        position: Option<&Position>,
        balance: Decimal,
        price: Decimal,
        stake_fraction: Decimal,
    ) -> Result<RiskVerdict> {
        if price <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice(format!(
                "cannot size orders at price {price}"
            )));
        }

        match action {
            TradeAction::Hold => Ok(RiskVerdict::NoAction),
            TradeAction::OpenLong | TradeAction::OpenShort => {
                // One position per symbol, regardless of what selection
                // produced.
                if position.is_some() {
                    return Ok(RiskVerdict::Rejected(RiskRejection::PositionAlreadyOpen {
                        symbol: symbol.to_string(),
                    }));
                }
                if balance <= Decimal::ZERO {
                    return Ok(RiskVerdict::Rejected(RiskRejection::InsufficientBalance {
                        balance,
                    }));
                }
                if stake_fraction > self.max_fraction {
                    return Ok(RiskVerdict::Rejected(RiskRejection::SizeExceedsLimit {
                        requested: balance * stake_fraction,
                        limit: balance * self.max_fraction,
                    }));
                }

                let notional = balance * stake_fraction;
                let quantity =
                    (notional / price).round_dp_with_strategy(8, RoundingStrategy::ToZero);
                if quantity <= Decimal::ZERO {
                    return Ok(RiskVerdict::Rejected(RiskRejection::InsufficientBalance {
                        balance,
                    }));
                }

                let side = match action.opens() {
                    Some(side) => side,
                    None => return Ok(RiskVerdict::NoAction),
                };
                let (stop_loss, take_profit) = self.exit_levels(side, price);
                let spec =
                    OrderSpec::new(symbol.to_string(), side.entry_order_side(), quantity)?;
                Ok(RiskVerdict::Approved(ApprovedOrder {
                    action,
                    spec,
                    side: Some(side),
                    stop_loss: Some(stop_loss),
                    take_profit: Some(take_profit),
                    exit_reason: None,
                }))
            }
            TradeAction::Close => match position {
                Some(open) => {
                    let spec = OrderSpec::new(
                        open.symbol.clone(),
                        open.side.exit_order_side(),
                        open.quantity,
                    )?;
                    Ok(RiskVerdict::Approved(ApprovedOrder {
                        action,
                        spec,
                        side: Some(open.side),
                        stop_loss: None,
                        take_profit: None,
                        exit_reason: Some(ExitReason::Manual),
                    }))
                }
                None => Ok(RiskVerdict::Rejected(RiskRejection::NothingToClose {
                    symbol: symbol.to_string(),
                })),
            },
        }
    }
}
