//! Session orchestration: per-symbol tick pipelines wiring the data feed,
//! feature builder, forecaster, policy, risk manager and execution gateway
//! together, plus the session-level services (portfolio, metrics,
//! checkpointing).

pub mod checkpointer;
pub mod gateway;
pub mod metrics;
pub mod pipeline;
pub mod portfolio;
pub mod risk;

pub use checkpointer::CheckpointService;
pub use gateway::{ExecutionConfig, ExecutionGateway};
pub use metrics::{LatencyTracker, MetricsCollector, MonitoringConfig, SessionMetrics};
pub use pipeline::{
    build_state, close_out_open_positions, state_dim_for, PipelineConfig, Stage, SymbolPipeline,
    TickReport, STATE_EXTRAS,
};
pub use portfolio::{Portfolio, PortfolioSummary};
pub use risk::{RiskConfig, RiskManager};
