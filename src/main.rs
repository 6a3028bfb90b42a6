mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adlts_engine::{
    close_out_open_positions, CheckpointService, ExecutionGateway, MetricsCollector, Portfolio,
    RiskManager, SymbolPipeline,
};
use adlts_feed::{BinanceProvider, DataFeed, PaperConfig, PaperExchange, ProviderRegistry};
use adlts_ml::Forecaster;
use adlts_rl::PolicyAgent;
use adlts_store::JsonFileConfigStore;

use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "adlts_rs=info,adlts_engine=info,adlts_feed=info,adlts_ml=info,adlts_rl=info,adlts_store=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting adaptive learning trading session");

    let mut app_config = AppConfig::new().context("failed to load configuration")?;

    if let Some(path) = app_config.trading.config_store_path.clone() {
        let store = JsonFileConfigStore::new(path);
        app_config
            .overlay_tunables(&store)
            .await
            .context("failed to apply config store tunables")?;
        info!("⚙️ Tunables overlaid from config store");
    }

    info!(
        "🎯 Session: {} on '{}' ({}), tick every {}s",
        app_config.trading.symbols.join(", "),
        app_config.trading.venue,
        app_config.trading.timeframe,
        app_config.trading.tick_interval_secs
    );

    // Providers: paper is always available, binance serves live candles.
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(PaperExchange::new(PaperConfig {
        initial_balance: app_config.trading.initial_balance,
        ..PaperConfig::default()
    })?));
    registry.register(Arc::new(BinanceProvider::new()?));

    let feed = Arc::new(DataFeed::new(app_config.feed_config(), &registry)?);

    let venue = registry
        .get(&app_config.trading.venue)
        .with_context(|| format!("unknown execution venue: {}", app_config.trading.venue))?;
    let gateway = Arc::new(ExecutionGateway::new(app_config.execution.clone(), venue)?);

    let risk = Arc::new(RiskManager::new(app_config.risk.clone())?);
    let portfolio = Arc::new(Portfolio::new(app_config.trading.initial_balance)?);
    let metrics = Arc::new(MetricsCollector::new());
    let agent = Arc::new(PolicyAgent::new(app_config.agent_config())?);

    let mut forecasters = BTreeMap::new();
    for symbol in &app_config.trading.symbols {
        forecasters.insert(
            symbol.clone(),
            Arc::new(Mutex::new(Forecaster::new(app_config.forecaster_config())?)),
        );
    }

    let checkpoints = Arc::new(CheckpointService::new(
        app_config.checkpoint.clone(),
        Arc::clone(&agent),
        forecasters.clone(),
        Arc::clone(&metrics),
    ));
    if checkpoints
        .restore_latest()
        .await
        .context("checkpoint restore failed")?
    {
        info!("🔄 Resumed policy and forecasters from previous session");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut pipelines = Vec::new();
    for symbol in &app_config.trading.symbols {
        let forecaster = forecasters
            .get(symbol)
            .cloned()
            .context("forecaster missing for configured symbol")?;
        let pipeline = SymbolPipeline::new(
            app_config.pipeline_config(symbol),
            Arc::clone(&feed),
            forecaster,
            Arc::clone(&agent),
            Arc::clone(&risk),
            Arc::clone(&portfolio),
            Arc::clone(&gateway),
            Arc::clone(&metrics),
        )?;
        pipelines.push(tokio::spawn(pipeline.run(shutdown_rx.clone())));
    }
    info!("▶️ {} symbol pipeline(s) running", pipelines.len());
    info!("⌨️  Press Ctrl+C to stop");

    let reporter =
        Arc::clone(&metrics).start_periodic_reporting(app_config.monitoring.report_interval_secs);
    let checkpoint_task = tokio::spawn(Arc::clone(&checkpoints).run(shutdown_rx.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("⏹ Shutdown signal received, draining pipelines");
    shutdown_tx.send(true).ok();

    for handle in pipelines {
        if let Err(e) = handle.await {
            error!("❌ Pipeline task failed: {e}");
        }
    }
    if let Err(e) = checkpoint_task.await {
        error!("❌ Checkpoint task failed: {e}");
    }
    reporter.abort();

    let closed_out = close_out_open_positions(&portfolio, &gateway, &metrics).await;
    if closed_out > 0 {
        info!("⛔ Closed out {closed_out} open position(s) at shutdown");
    }

    match checkpoints.save_now().await {
        Ok(()) => info!("💾 Final checkpoint written"),
        Err(e) => warn!(error = %e, "final checkpoint failed"),
    }

    metrics.log_session_summary();
    let summary = portfolio.summary();
    info!(
        "✅ Session closed: balance {:.2}, {} trades ({} wins, {:.1}% win rate), return {:+.2}%",
        summary.balance,
        summary.closed_trades,
        summary.wins,
        summary.win_rate * 100.0,
        portfolio.session_return() * 100.0
    );

    Ok(())
}
