use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use adlts_feed::DataFeed;
use adlts_ml::{FeatureBuilder, FeatureOutcome, Forecaster, FEATURE_DIMS};
use adlts_models::{
    ApprovedOrder, EngineError, ExitReason, FeatureVector, Fill, ForecastEstimate, OrderSpec,
    Position, Result, RiskVerdict, TradeAction, TradeOutcome,
};
use adlts_rl::{LearnOutcome, PolicyAgent, Transition};

use crate::gateway::ExecutionGateway;
use crate::metrics::MetricsCollector;
use crate::portfolio::Portfolio;
use crate::risk::RiskManager;

/// State-vector entries appended after the flattened feature window:
/// forecast point, confidence flag, position-open flag, position side,
/// unrealized return.
pub const STATE_EXTRAS: usize = 5;

/// Length of the state vector produced for a given feature window.
pub fn state_dim_for(window: usize) -> usize {
    window * FEATURE_DIMS + STATE_EXTRAS
}

/// Stages of one tick, in order. Any failure short-circuits the rest of the
/// pipeline straight to Recording, which then records nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    Fetching,
    Featurizing,
    Forecasting,
    Deciding,
    RiskChecking,
    Executing,
    Recording,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Fetching => "fetching",
            Stage::Featurizing => "featurizing",
            Stage::Forecasting => "forecasting",
            Stage::Deciding => "deciding",
            Stage::RiskChecking => "risk-checking",
            Stage::Executing => "executing",
            Stage::Recording => "recording",
        };
        write!(f, "{name}")
    }
}

/// What one tick did, for metrics and tests.
#[derive(Debug)]
pub struct TickReport {
    pub symbol: String,
    /// Deepest stage reached; on failure, the stage that failed.
    pub stage_reached: Stage,
    pub failure: Option<String>,
    pub warming_up: bool,
    pub action: Option<TradeAction>,
    pub forced_exit: Option<ExitReason>,
    pub outcome: Option<TradeOutcome>,
    pub transition_recorded: bool,
    pub learning: Option<LearnOutcome>,
    pub latency_ms: f64,
}

impl TickReport {
    fn begin(symbol: String) -> Self {
        Self {
            symbol,
            stage_reached: Stage::Idle,
            failure: None,
            warming_up: false,
            action: None,
            forced_exit: None,
            outcome: None,
            transition_recorded: false,
            learning: None,
            latency_ms: 0.0,
        }
    }

    pub fn skipped(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub symbol: String,
    pub timeframe: String,
    pub feature_window: usize,
    /// Wall-clock seconds between ticks. Paper sessions run this much
    /// faster than the timeframe; live sessions should match it.
    pub tick_interval_secs: u64,
    /// Fraction of balance committed per entry, reviewed by the risk
    /// manager against its own maximum.
    pub stake_fraction: f64,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(EngineError::Config("pipeline symbol is empty".to_string()));
        }
        if !(self.stake_fraction > 0.0 && self.stake_fraction <= 1.0) {
            return Err(EngineError::Config(format!(
                "stake_fraction must be in (0, 1], got {}",
                self.stake_fraction
            )));
        }
        Ok(())
    }
}

/// A decision waiting for its successor state. Reward and terminal flag are
/// known at execution time; the next state arrives one bar later.
struct PendingDecision {
    state: Vec<f64>,
    action: TradeAction,
    reward: f64,
    terminal: bool,
}

/// One symbol's tick loop: fetch, featurize, forecast, decide, risk-check,
/// execute, record. Owns the symbol-scoped state (feature window, pending
/// transition); everything cross-symbol is shared through `Arc`s.
pub struct SymbolPipeline {
    config: PipelineConfig,
    stake_fraction: Decimal,
    feed: Arc<DataFeed>,
    features: FeatureBuilder,
    forecaster: Arc<Mutex<Forecaster>>,
    agent: Arc<PolicyAgent>,
    risk: Arc<RiskManager>,
    portfolio: Arc<Portfolio>,
    gateway: Arc<ExecutionGateway>,
    metrics: Arc<MetricsCollector>,
    pending_decision: Option<PendingDecision>,
    pending_sample: Option<(FeatureVector, Decimal)>,
}

impl SymbolPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        feed: Arc<DataFeed>,
        forecaster: Arc<Mutex<Forecaster>>,
        agent: Arc<PolicyAgent>,
        risk: Arc<RiskManager>,
        portfolio: Arc<Portfolio>,
        gateway: Arc<ExecutionGateway>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        let stake_fraction = Decimal::from_f64(config.stake_fraction).ok_or_else(|| {
            EngineError::Config(format!(
                "stake_fraction is not representable: {}",
                config.stake_fraction
            ))
        })?;
        let features = FeatureBuilder::new(config.feature_window)?;

        let expected = state_dim_for(config.feature_window);
        if agent.config().state_dim != expected {
            return Err(EngineError::Config(format!(
                "policy expects state dim {}, window {} produces {}",
                agent.config().state_dim,
                config.feature_window,
                expected
            )));
        }

        Ok(Self {
            config,
            stake_fraction,
            feed,
            features,
            forecaster,
            agent,
            risk,
            portfolio,
            gateway,
            metrics,
            pending_decision: None,
            pending_sample: None,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Runs one full tick and reports what happened. Never returns an
    /// error: failures degrade to a skipped tick so the loop stays alive.
    pub async fn run_once(&mut self) -> TickReport {
        let timer = self.metrics.start_latency("tick");
        let started = std::time::Instant::now();

        let mut report = TickReport::begin(self.config.symbol.clone());
        self.tick(&mut report).await;

        report.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        timer.finish(&self.metrics);
        // Skips are counted at the failure site, with their kind.
        if !report.skipped() {
            self.metrics.record_tick_processed();
        }
        report
    }

    async fn tick(&mut self, report: &mut TickReport) {
        // Fetching
        report.stage_reached = Stage::Fetching;
        let fetch_timer = self.metrics.start_latency("fetch");
        let snapshot = match self
            .feed
            .fetch(&self.config.symbol, &self.config.timeframe)
            .await
        {
            Ok(snapshot) => {
                fetch_timer.finish(&self.metrics);
                snapshot
            }
            Err(e) => return self.fail(report, e),
        };
        let close = snapshot.close;

        // Featurizing
        report.stage_reached = Stage::Featurizing;
        let features = match self.features.push(&snapshot) {
            Ok(FeatureOutcome::Ready(features)) => features,
            Ok(FeatureOutcome::WarmingUp { have, need }) => {
                report.warming_up = true;
                debug!(
                    symbol = %self.config.symbol,
                    have,
                    need,
                    "feature window warming up"
                );
                return;
            }
            Ok(FeatureOutcome::Duplicate) => {
                debug!(symbol = %self.config.symbol, "bar unchanged, nothing to do");
                return;
            }
            Err(e) => return self.fail(report, e),
        };

        // Forecasting. The previous bar's prediction sample settles first,
        // now that its realized return is known.
        report.stage_reached = Stage::Forecasting;
        if let Some((prev_features, prev_close)) = self.pending_sample.take() {
            if prev_close > Decimal::ZERO {
                let realized = ((close - prev_close) / prev_close).to_f64().unwrap_or(0.0);
                let mut forecaster = self.forecaster.lock();
                match forecaster.push_sample(&prev_features, realized) {
                    Ok(Some(loss)) => {
                        debug!(symbol = %self.config.symbol, loss, "forecaster batch trained");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(symbol = %self.config.symbol, error = %e, "forecast sample dropped");
                    }
                }
            }
        }
        let estimate = {
            let forecaster = self.forecaster.lock();
            match forecaster.predict(&features) {
                Ok(estimate) => estimate,
                Err(e) => return self.fail(report, e),
            }
        };
        self.pending_sample = Some((features.clone(), close));

        let position = self.portfolio.position(&self.config.symbol);
        let state = build_state(&features, &estimate, position.as_ref(), close);

        // Deciding
        report.stage_reached = Stage::Deciding;
        let action = match self.agent.select_action(&state, position.is_some()) {
            Ok(action) => action,
            Err(e) => return self.fail(report, e),
        };
        report.action = Some(action);
        debug!(
            symbol = %self.config.symbol,
            %action,
            epsilon = self.agent.current_epsilon(),
            forecast = estimate.informative_point(),
            "action selected"
        );

        // RiskChecking. Protective exits outrank whatever the policy chose.
        report.stage_reached = Stage::RiskChecking;
        let balance = self.portfolio.balance();
        let forced = position
            .as_ref()
            .and_then(|open| self.risk.enforce_exits(open, close));
        let order: Option<ApprovedOrder> = match forced {
            Some(forced_order) => {
                report.forced_exit = forced_order.exit_reason;
                self.metrics.record_forced_exit();
                Some(forced_order)
            }
            None => {
                let verdict = self.risk.authorize(
                    &self.config.symbol,
                    action,
                    position.as_ref(),
                    balance,
                    close,
                    self.stake_fraction,
                );
                match verdict {
                    Ok(RiskVerdict::Approved(order)) => Some(order),
                    Ok(RiskVerdict::Rejected(rejection)) => {
                        self.metrics.record_risk_rejection();
                        debug!(
                            symbol = %self.config.symbol,
                            %rejection,
                            "action rejected, holding instead"
                        );
                        None
                    }
                    Ok(RiskVerdict::NoAction) => None,
                    Err(e) => return self.fail(report, e),
                }
            }
        };

        // Executing
        report.stage_reached = Stage::Executing;
        let mut closed: Option<TradeOutcome> = None;
        if let Some(ref approved) = order {
            match self.gateway.submit(approved).await {
                Ok(fill) => {
                    self.metrics.record_order(true);
                    if let Err(e) = self.apply_fill(approved, &fill, &mut closed) {
                        return self.fail(report, e);
                    }
                }
                Err(e) => {
                    self.metrics.record_order(false);
                    return self.fail(report, e);
                }
            }
        }
        report.outcome = closed.clone();

        // Recording. The previous decision gains its successor state; this
        // tick's decision starts waiting for the next bar.
        report.stage_reached = Stage::Recording;
        if let Some(pending) = self.pending_decision.take() {
            self.agent.record_transition(Transition::new(
                pending.state,
                pending.action,
                pending.reward,
                state.clone(),
                pending.terminal,
            ));
            report.transition_recorded = true;
            self.metrics.record_transition();
        }
        let reward = closed.as_ref().map(|o| o.return_fraction).unwrap_or(0.0);
        self.pending_decision = Some(PendingDecision {
            state,
            action,
            reward,
            terminal: closed.is_some(),
        });

        match self.agent.maybe_learn() {
            Ok(outcome) => {
                match outcome {
                    LearnOutcome::Updated { loss, synced_target } => {
                        self.metrics.record_learn_update();
                        debug!(
                            symbol = %self.config.symbol,
                            loss,
                            synced_target,
                            "policy updated"
                        );
                    }
                    LearnOutcome::Diverged { consecutive } => {
                        self.metrics.record_divergence();
                        warn!(
                            symbol = %self.config.symbol,
                            consecutive,
                            "policy update diverged, weights rolled back"
                        );
                    }
                    _ => {}
                }
                report.learning = Some(outcome);
            }
            Err(e) => {
                // Fatal training halt. The tick itself succeeded; whether
                // trading continues is the policy's configuration.
                self.metrics.record_divergence();
                error!(symbol = %self.config.symbol, error = %e, "training halted");
                report.learning = Some(LearnOutcome::Halted);
            }
        }
    }

    fn apply_fill(
        &self,
        order: &ApprovedOrder,
        fill: &Fill,
        closed: &mut Option<TradeOutcome>,
    ) -> Result<()> {
        match order.action {
            TradeAction::OpenLong | TradeAction::OpenShort => {
                let side = order.side.ok_or_else(|| {
                    EngineError::Position("approved entry carries no side".to_string())
                })?;
                let stop_loss = order.stop_loss.ok_or_else(|| {
                    EngineError::Position("approved entry carries no stop".to_string())
                })?;
                let take_profit = order.take_profit.ok_or_else(|| {
                    EngineError::Position("approved entry carries no target".to_string())
                })?;
                let position = Position::open(
                    self.config.symbol.clone(),
                    side,
                    fill.price,
                    fill.quantity,
                    stop_loss,
                    take_profit,
                    fill.filled_at,
                )?;
                self.portfolio.open_position(position)
            }
            TradeAction::Close => {
                let reason = order.exit_reason.unwrap_or(ExitReason::Manual);
                let outcome = self.portfolio.close_position(
                    &self.config.symbol,
                    fill.price,
                    fill.filled_at,
                    reason,
                )?;
                self.metrics.record_trade(outcome.realized_pnl > Decimal::ZERO);
                *closed = Some(outcome);
                Ok(())
            }
            TradeAction::Hold => Ok(()),
        }
    }

    fn fail(&mut self, report: &mut TickReport, error: EngineError) {
        warn!(
            symbol = %self.config.symbol,
            stage = %report.stage_reached,
            kind = error.kind(),
            error = %error,
            "tick skipped"
        );
        self.metrics.record_tick_skipped(error.kind());
        report.failure = Some(error.to_string());
    }

    /// Ticks until shutdown. Stops early only when training has fatally
    /// halted and the policy is configured to refuse service.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            symbol = %self.config.symbol,
            timeframe = %self.config.timeframe,
            interval_secs = self.config.tick_interval_secs,
            "▶️ pipeline started"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.tick_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                    if self.agent.is_halted() && !self.agent.config().continue_after_halt {
                        error!(
                            symbol = %self.config.symbol,
                            "⛔ training halted and continue_after_halt disabled, stopping"
                        );
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(symbol = %self.config.symbol, "⏹ pipeline stopped");
    }
}

/// Assembles the policy's state vector: the flattened feature window plus
/// forecast and position context.
pub fn build_state(
    features: &FeatureVector,
    estimate: &ForecastEstimate,
    position: Option<&Position>,
    price: Decimal,
) -> Vec<f64> {
    let mut state = Vec::with_capacity(features.len() + STATE_EXTRAS);
    state.extend_from_slice(&features.values);
    state.push(estimate.informative_point());
    state.push(if estimate.low_confidence { 0.0 } else { 1.0 });
    match position {
        Some(open) => {
            state.push(1.0);
            state.push(open.side.direction());
            state.push(open.unrealized_return(price));
        }
        None => {
            state.push(0.0);
            state.push(0.0);
            state.push(0.0);
        }
    }
    state
}

/// Closes every open position at the venue's current price. Runs once at
/// session shutdown so the final summary reports realized P&L instead of
/// open exposure. A position whose submission fails (or whose symbol is
/// halted at the gateway) stays open and is logged.
pub async fn close_out_open_positions(
    portfolio: &Portfolio,
    gateway: &ExecutionGateway,
    metrics: &MetricsCollector,
) -> usize {
    let mut closed = 0;
    for position in portfolio.open_positions() {
        let spec = match OrderSpec::new(
            position.symbol.clone(),
            position.side.exit_order_side(),
            position.quantity,
        ) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "close-out order invalid, position left open");
                continue;
            }
        };
        let order = ApprovedOrder {
            action: TradeAction::Close,
            spec,
            side: Some(position.side),
            stop_loss: None,
            take_profit: None,
            exit_reason: Some(ExitReason::Forced),
        };
        match gateway.submit(&order).await {
            Ok(fill) => {
                metrics.record_order(true);
                match portfolio.close_position(
                    &position.symbol,
                    fill.price,
                    fill.filled_at,
                    ExitReason::Forced,
                ) {
                    Ok(outcome) => {
                        metrics.record_trade(outcome.realized_pnl > Decimal::ZERO);
                        metrics.record_forced_exit();
                        closed += 1;
                    }
                    Err(e) => {
                        warn!(symbol = %position.symbol, error = %e, "close-out fill could not be applied");
                    }
                }
            }
            Err(e) => {
                metrics.record_order(false);
                warn!(symbol = %position.symbol, error = %e, "close-out submission failed, position left open");
            }
        }
    }
    closed
}
