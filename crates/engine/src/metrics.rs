use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Most recent samples kept per operation for latency averaging.
const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub report_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

/// Point-in-time view of the session counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub ticks_processed: u64,
    pub ticks_skipped: u64,
    pub skips_by_kind: HashMap<String, u64>,
    pub transitions_recorded: u64,
    pub learn_updates: u64,
    pub divergences: u64,
    pub orders_submitted: u64,
    pub orders_failed: u64,
    pub trades_won: u64,
    pub trades_lost: u64,
    pub forced_exits: u64,
    pub risk_rejections: u64,
    pub checkpoints_saved: u64,
    pub error_count: u64,
    pub avg_tick_ms: f64,
    pub avg_fetch_ms: f64,
}

pub struct LatencyTracker {
    started: Instant,
    operation: &'static str,
}

impl LatencyTracker {
    pub fn finish(self, collector: &MetricsCollector) {
        collector.observe_latency(self.operation, self.started.elapsed());
    }
}

/// Session counters shared by every pipeline. Counters are atomics so the
/// happy path never takes a lock; the latency window and the per-kind skip
/// breakdown are mutexed and touched only off it.
pub struct MetricsCollector {
    started: Instant,
    ticks_processed: AtomicU64,
    ticks_skipped: AtomicU64,
    skip_kinds: Mutex<HashMap<&'static str, u64>>,
    transitions_recorded: AtomicU64,
    learn_updates: AtomicU64,
    divergences: AtomicU64,
    orders_submitted: AtomicU64,
    orders_failed: AtomicU64,
    trades_won: AtomicU64,
    trades_lost: AtomicU64,
    forced_exits: AtomicU64,
    risk_rejections: AtomicU64,
    checkpoints_saved: AtomicU64,
    error_count: AtomicU64,
    latencies: Mutex<HashMap<&'static str, Vec<f64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ticks_processed: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            skip_kinds: Mutex::new(HashMap::new()),
            transitions_recorded: AtomicU64::new(0),
            learn_updates: AtomicU64::new(0),
            divergences: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            orders_failed: AtomicU64::new(0),
            trades_won: AtomicU64::new(0),
            trades_lost: AtomicU64::new(0),
            forced_exits: AtomicU64::new(0),
            risk_rejections: AtomicU64::new(0),
            checkpoints_saved: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_tick_processed(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_skipped(&self, kind: &'static str) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.skip_kinds.lock().entry(kind).or_insert(0) += 1;
    }

    pub fn record_transition(&self) {
        self.transitions_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_learn_update(&self) {
        self.learn_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_divergence(&self) {
        self.divergences.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order(&self, filled: bool) {
        if filled {
            self.orders_submitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.orders_failed.fetch_add(1, Ordering::Relaxed);
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_trade(&self, won: bool) {
        if won {
            self.trades_won.fetch_add(1, Ordering::Relaxed);
        } else {
            self.trades_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_forced_exit(&self) {
        self.forced_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_risk_rejection(&self) {
        self.risk_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_latency(&self, operation: &'static str) -> LatencyTracker {
        LatencyTracker {
            started: Instant::now(),
            operation,
        }
    }

    pub fn observe_latency(&self, operation: &'static str, duration: Duration) {
        let mut latencies = self.latencies.lock();
        let window = latencies.entry(operation).or_default();
        window.push(duration.as_secs_f64() * 1000.0);
        if window.len() > LATENCY_WINDOW {
            window.remove(0);
        }
    }

    fn average_latency_ms(&self, operation: &str) -> f64 {
        let latencies = self.latencies.lock();
        match latencies.get(operation) {
            Some(window) if !window.is_empty() => {
                window.iter().sum::<f64>() / window.len() as f64
            }
            _ => 0.0,
        }
    }

    pub fn snapshot(&self) -> SessionMetrics {
        let skips_by_kind = self
            .skip_kinds
            .lock()
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        SessionMetrics {
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            skips_by_kind,
            transitions_recorded: self.transitions_recorded.load(Ordering::Relaxed),
            learn_updates: self.learn_updates.load(Ordering::Relaxed),
            divergences: self.divergences.load(Ordering::Relaxed),
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            orders_failed: self.orders_failed.load(Ordering::Relaxed),
            trades_won: self.trades_won.load(Ordering::Relaxed),
            trades_lost: self.trades_lost.load(Ordering::Relaxed),
            forced_exits: self.forced_exits.load(Ordering::Relaxed),
            risk_rejections: self.risk_rejections.load(Ordering::Relaxed),
            checkpoints_saved: self.checkpoints_saved.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_tick_ms: self.average_latency_ms("tick"),
            avg_fetch_ms: self.average_latency_ms("fetch"),
        }
    }

    /// Logs a one-line summary every `interval_secs`, and warns when more
    /// than a tenth of ticks are being skipped.
    pub fn start_periodic_reporting(
        self: Arc<Self>,
        interval_secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let snap = self.snapshot();
                info!(
                    "📊 Session: {} ticks ({} skipped), {} transitions, {} updates, {} orders, {} trades ({} won), {:.1}ms avg tick",
                    snap.ticks_processed,
                    snap.ticks_skipped,
                    snap.transitions_recorded,
                    snap.learn_updates,
                    snap.orders_submitted,
                    snap.trades_won + snap.trades_lost,
                    snap.trades_won,
                    snap.avg_tick_ms
                );
                let total = snap.ticks_processed + snap.ticks_skipped;
                if total >= 10 && snap.ticks_skipped * 10 > total {
                    warn!(
                        "⚠️ {} of {} ticks skipped, check source connectivity",
                        snap.ticks_skipped, total
                    );
                }
            }
        })
    }

    pub fn log_session_summary(&self) {
        let snap = self.snapshot();
        info!("📈 Session summary:");
        info!("   Ticks processed: {}", snap.ticks_processed);
        info!("   Ticks skipped: {}", snap.ticks_skipped);
        let mut kinds: Vec<_> = snap.skips_by_kind.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            info!("      {kind}: {count}");
        }
        info!("   Transitions recorded: {}", snap.transitions_recorded);
        info!("   Learning updates: {}", snap.learn_updates);
        info!("   Divergences: {}", snap.divergences);
        info!("   Orders filled: {}", snap.orders_submitted);
        info!("   Orders failed: {}", snap.orders_failed);
        info!(
            "   Trades closed: {} ({} won, {} lost)",
            snap.trades_won + snap.trades_lost,
            snap.trades_won,
            snap.trades_lost
        );
        info!("   Forced exits: {}", snap.forced_exits);
        info!("   Risk rejections: {}", snap.risk_rejections);
        info!("   Checkpoints saved: {}", snap.checkpoints_saved);
        info!("   Average tick latency: {:.2}ms", snap.avg_tick_ms);
        info!("   Uptime: {}s", snap.uptime_seconds);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
