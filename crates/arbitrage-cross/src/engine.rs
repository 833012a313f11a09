//! Composition root: wires books, detector, risk and executors together and
//! runs the fixed-interval scan loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use xarb_core::{BookEvent, EngineConfig, EventTable, ExecutionMode};

use crate::alerts::{Alert, AlertChannel};
use crate::detector::{ArbDetector, ArbOpportunity};
use crate::executor::{
    executor_for, ArbExecutor, AttemptOutcome, ExecutionAttempt, ExecutionContext, InFlightSet,
};
use crate::fees::FeeSchedule;
use crate::fill_log::{BucketLayout, FillLogger};
use crate::inventory::{InventoryTracker, Position};
use crate::orderbook::{ApplyOutcome, BookSummary, OrderbookManager};
use crate::race::{CalibrationReport, RaceModel};
use crate::risk::{RejectionRecord, RiskDecision, RiskManager, RiskSnapshot};
use crate::venue::{FillRouter, VenueGateway};

// =============================================================================
// Reports
// =============================================================================

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub scans_performed: u64,
    pub book_updates: u64,
    pub book_errors: u64,
    pub opportunities_detected: u64,
    pub attempts_started: u64,
    pub attempts_resolved: u64,
    pub both_filled: u64,
    pub one_sided: u64,
    pub both_failed: u64,
    pub risk_rejections: u64,
    pub skipped_in_flight: u64,
    pub skipped_at_capacity: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl EngineStats {
    fn record_outcome(&mut self, outcome: Option<AttemptOutcome>) {
        self.attempts_resolved += 1;
        match outcome {
            Some(AttemptOutcome::BothFilled) => self.both_filled += 1,
            Some(AttemptOutcome::OneSided) => self.one_sided += 1,
            Some(AttemptOutcome::BothFailed) | None => self.both_failed += 1,
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub evaluated: usize,
    pub opportunities: usize,
    pub unusable_books: usize,
    pub below_threshold: usize,
    pub started: usize,
    pub rejected: usize,
    pub skipped_in_flight: usize,
    pub skipped_at_capacity: usize,
}

/// Health summary for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotHealth {
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub books_tracked: usize,
    pub books_usable: usize,
    pub in_flight_attempts: usize,
    pub open_positions: usize,
    pub realized_pnl: Decimal,
    pub risk: RiskSnapshot,
    pub stats: EngineStats,
    pub fill_log_entries: usize,
}

// =============================================================================
// Engine
// =============================================================================

/// One running arbitrage engine.
///
/// Every shared component is constructed here once and handed to its users
/// explicitly; [`ArbEngine::reset`] returns them all to a clean state.
pub struct ArbEngine {
    config: EngineConfig,
    books: Arc<OrderbookManager>,
    race: Arc<RaceModel>,
    detector: ArbDetector,
    inventory: Arc<InventoryTracker>,
    risk: Arc<RiskManager>,
    alerts: Arc<AlertChannel>,
    fill_log: Arc<FillLogger>,
    fills: Arc<FillRouter>,
    in_flight: Arc<InFlightSet>,
    executor: Arc<dyn ArbExecutor>,
    tasks: Mutex<JoinSet<ExecutionAttempt>>,
    stats: Arc<RwLock<EngineStats>>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for ArbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbEngine")
            .field("mode", &self.config.mode)
            .field("events", &self.detector.events().len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl ArbEngine {
    /// Builds an engine over `gateway`, whose fills arrive through `fills`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the fill log
    /// sink cannot be opened.
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn VenueGateway>,
        fills: Arc<FillRouter>,
    ) -> Result<Self> {
        config.validate().context("Invalid engine configuration")?;

        let books = Arc::new(OrderbookManager::new());
        let race = Arc::new(RaceModel::new(config.race.clone()));
        let fees = FeeSchedule::from_models(&config.fees);
        let events = EventTable::new(config.events.clone());
        let detector = ArbDetector::new(
            Arc::clone(&books),
            Arc::clone(&race),
            fees.clone(),
            events,
            config.detector.clone(),
        );

        let inventory = Arc::new(InventoryTracker::new());
        let alerts = Arc::new(AlertChannel::default());
        let risk = Arc::new(
            RiskManager::new(config.risk.clone(), Arc::clone(&inventory))
                .with_alerts(Arc::clone(&alerts)),
        );
        let fill_log = Arc::new(match &config.fill_log_path {
            Some(path) => FillLogger::with_sink(path)
                .with_context(|| format!("Failed to open fill log {}", path.display()))?,
            None => FillLogger::new(),
        });

        let ctx = Arc::new(ExecutionContext {
            gateway,
            fills: Arc::clone(&fills),
            inventory: Arc::clone(&inventory),
            risk: Arc::clone(&risk),
            race: Arc::clone(&race),
            fees,
            fill_log: Arc::clone(&fill_log),
            alerts: Arc::clone(&alerts),
            config: config.execution.clone(),
        });
        // Fills for orders whose attempt already resolved are booked by the context
        let handler: std::sync::Weak<dyn crate::LateFillHandler> = Arc::<ExecutionContext>::downgrade(&ctx);
        ctx.fills.set_late_fill_handler(handler);
        let executor = executor_for(config.mode, ctx);

        info!(
            mode = %config.mode,
            events = config.events.len(),
            scan_interval_ms = config.scan_interval.as_millis(),
            min_edge_bps = %config.detector.min_edge_bps,
            max_daily_loss = %config.risk.max_daily_loss,
            "Arbitrage engine initialized"
        );

        Ok(Self {
            config,
            books,
            race,
            detector,
            inventory,
            risk,
            alerts,
            fill_log,
            fills,
            in_flight: Arc::new(InFlightSet::new()),
            executor,
            tasks: Mutex::new(JoinSet::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            started_at: Utc::now(),
        })
    }

    // =========================================================================
    // Market Data
    // =========================================================================

    /// Applies one normalized book message.
    pub fn ingest(&self, event: &BookEvent) {
        match self.books.apply_event(event) {
            Ok(ApplyOutcome::Applied) => self.stats.write().book_updates += 1,
            Ok(ApplyOutcome::ResyncRequested) => {
                debug!(
                    venue = %event.venue,
                    instrument = %event.instrument_id,
                    "Delta without base, resync requested"
                );
            }
            Err(e) => {
                self.stats.write().book_errors += 1;
                warn!(error = %e, "Book update rejected");
            }
        }
    }

    /// Feeds book messages from `rx` until the sender closes.
    pub fn spawn_feed(self: &Arc<Self>, mut rx: mpsc::Receiver<BookEvent>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                engine.ingest(&event);
            }
            debug!("Book feed closed");
        })
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Runs detection once and starts an attempt for every approved
    /// opportunity.
    pub fn scan_once(&self, now: DateTime<Utc>) -> ScanReport {
        self.reap_finished();

        let summary = self.detector.scan_all(now);
        let mut report = ScanReport {
            evaluated: summary.evaluated,
            opportunities: summary.opportunities.len(),
            unusable_books: summary.unusable_books,
            below_threshold: summary.below_threshold,
            ..ScanReport::default()
        };

        for opportunity in summary.opportunities {
            self.consider(opportunity, now, &mut report);
        }

        {
            let mut stats = self.stats.write();
            stats.scans_performed += 1;
            stats.last_scan_at = Some(now);
            stats.opportunities_detected += report.opportunities as u64;
            stats.attempts_started += report.started as u64;
            stats.risk_rejections += report.rejected as u64;
            stats.skipped_in_flight += report.skipped_in_flight as u64;
            stats.skipped_at_capacity += report.skipped_at_capacity as u64;
        }

        trace!(
            evaluated = report.evaluated,
            opportunities = report.opportunities,
            started = report.started,
            "Scan complete"
        );
        report
    }

    fn consider(&self, opportunity: ArbOpportunity, now: DateTime<Utc>, report: &mut ScanReport) {
        let key = opportunity.key();
        let Some(guard) = self.in_flight.try_acquire(key) else {
            trace!(key = %opportunity.key(), "Attempt already in flight");
            report.skipped_in_flight += 1;
            return;
        };
        if self.in_flight.len() > self.config.execution.max_concurrent_attempts {
            debug!(key = %guard.key(), "Concurrent attempt limit reached");
            report.skipped_at_capacity += 1;
            return;
        }

        let size = match self.risk.evaluate_at(&opportunity, now) {
            RiskDecision::Approved { size } => size,
            RiskDecision::Rejected(_) => {
                report.rejected += 1;
                return;
            }
        };

        let attempt = ExecutionAttempt::new(opportunity, size, self.config.mode);
        let reserved = size * attempt.opportunity.capital_per_contract();
        self.inventory
            .begin_attempt(attempt.event_id(), attempt.attempt_id, reserved);

        info!(
            attempt_id = %attempt.attempt_id,
            key = %guard.key(),
            %size,
            edge_bps = %attempt.opportunity.edge_bps.round_dp(1),
            mode = %attempt.mode,
            "Starting execution attempt"
        );

        let executor = Arc::clone(&self.executor);
        let stats = Arc::clone(&self.stats);
        self.tasks.lock().spawn(async move {
            let _guard = guard;
            let resolved = executor.execute(attempt).await;
            stats.write().record_outcome(resolved.outcome);
            resolved
        });
        report.started += 1;
    }

    /// Drops the results of attempts that have already finished.
    fn reap_finished(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Execution task failed");
            }
        }
    }

    /// Scans on a fixed interval until `shutdown` flips to true, then waits
    /// for in-flight attempts to resolve.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis(),
            "Scan loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scan_once(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = self.in_flight.len(), "Scan loop stopping");
        let resolved = self.drain().await;
        info!(resolved = resolved.len(), "Engine stopped");
    }

    /// Applies race parameter updates from a config watcher until the
    /// sender is dropped.
    pub async fn watch_config(&self, mut rx: watch::Receiver<EngineConfig>) {
        while rx.changed().await.is_ok() {
            let race = rx.borrow_and_update().race.clone();
            self.race.update_params(race);
        }
    }

    /// Waits for every in-flight attempt and returns them resolved.
    pub async fn drain(&self) -> Vec<ExecutionAttempt> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut resolved = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(attempt) => resolved.push(attempt),
                Err(e) => warn!(error = %e, "Execution task failed"),
            }
        }
        resolved
    }

    /// Refits the race model from the fill log.
    pub fn calibrate(&self, min_samples: u32) -> CalibrationReport {
        let table = self.fill_log.calibration_table(&BucketLayout::default());
        self.race.calibrate(&table, min_samples)
    }

    // =========================================================================
    // Exports
    // =========================================================================

    #[must_use]
    pub fn export_orderbook_state(&self) -> Vec<BookSummary> {
        self.books.export_state()
    }

    #[must_use]
    pub fn export_open_positions(&self) -> Vec<Position> {
        self.inventory.open_positions()
    }

    #[must_use]
    pub fn export_recent_opportunities(&self, n: usize) -> Vec<ArbOpportunity> {
        self.detector.recent(n)
    }

    #[must_use]
    pub fn export_alerts(&self, n: usize) -> Vec<Alert> {
        self.alerts.recent(n)
    }

    #[must_use]
    pub fn export_rejections(&self, n: usize) -> Vec<RejectionRecord> {
        self.risk.rejections(n)
    }

    #[must_use]
    pub fn export_bot_health(&self) -> BotHealth {
        let now = Utc::now();
        let books = self.books.export_state_at(now);
        let max_staleness = self.config.detector.max_staleness_ms;
        BotHealth {
            mode: self.config.mode,
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            books_tracked: books.len(),
            books_usable: books
                .iter()
                .filter(|b| !b.invalidated && b.staleness_ms < max_staleness)
                .count(),
            in_flight_attempts: self.in_flight.len(),
            open_positions: self.inventory.open_positions().len(),
            realized_pnl: self.inventory.realized_pnl(),
            risk: self.risk.snapshot(),
            stats: self.stats.read().clone(),
            fill_log_entries: self.fill_log.len(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn books(&self) -> &Arc<OrderbookManager> {
        &self.books
    }

    #[must_use]
    pub fn detector(&self) -> &ArbDetector {
        &self.detector
    }

    #[must_use]
    pub fn race(&self) -> &Arc<RaceModel> {
        &self.race
    }

    #[must_use]
    pub fn inventory(&self) -> &Arc<InventoryTracker> {
        &self.inventory
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    #[must_use]
    pub fn alerts(&self) -> &Arc<AlertChannel> {
        &self.alerts
    }

    #[must_use]
    pub fn fill_log(&self) -> &Arc<FillLogger> {
        &self.fill_log
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Clears books, positions, risk state, alerts and opportunity history.
    /// The fill log is append-only and is kept.
    pub fn reset(&self) {
        self.books.reset();
        self.inventory.reset();
        self.risk.reset();
        self.alerts.reset();
        self.detector.reset();
        self.fills.reset();
        self.race.update_params(self.config.race.clone());
        *self.stats.write() = EngineStats::default();
        info!("Engine state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperFillPolicy, PaperVenue};
    use rust_decimal_macros::dec;
    use xarb_core::{CanonicalEvent, OrderLevel, RaceParams, Venue, VenuePair};

    fn engine(policy: PaperFillPolicy) -> ArbEngine {
        let mut config = EngineConfig::default()
            .with_mode(ExecutionMode::Taker)
            .with_events(vec![CanonicalEvent::new("evt", "K-EVT", "P-EVT")]);
        config.race = VenuePair::splat(RaceParams {
            base_probability: 1.0,
            queue_floor: 1.0,
            ..RaceParams::default()
        });
        config.fees = VenuePair::splat(xarb_core::FeeModel::Zero);
        let fills = Arc::new(FillRouter::new());
        let venue = PaperVenue::new(VenuePair::splat(policy), Arc::clone(&fills)).with_seed(7);
        ArbEngine::new(config, Arc::new(venue), fills).unwrap()
    }

    fn seed_books(engine: &ArbEngine, now: DateTime<Utc>) {
        engine.ingest(&BookEvent::snapshot(
            Venue::Kalshi,
            "K-EVT",
            vec![OrderLevel::new(dec!(0.44), dec!(100))],
            vec![OrderLevel::new(dec!(0.46), dec!(100))],
            now,
        ));
        engine.ingest(&BookEvent::snapshot(
            Venue::Polymarket,
            "P-EVT",
            vec![OrderLevel::new(dec!(0.51), dec!(100))],
            vec![OrderLevel::new(dec!(0.53), dec!(100))],
            now,
        ));
    }

    // ==================== Ingest Tests ====================

    #[tokio::test]
    async fn test_ingest_counts_updates_and_errors() {
        let engine = engine(PaperFillPolicy::always_fill());
        let now = Utc::now();
        seed_books(&engine, now);
        engine.ingest(&BookEvent::snapshot(
            Venue::Kalshi,
            "K-EVT",
            vec![OrderLevel::new(dec!(0.60), dec!(1))],
            vec![OrderLevel::new(dec!(0.50), dec!(1))],
            now,
        ));

        let stats = engine.stats();
        assert_eq!(stats.book_updates, 2);
        assert_eq!(stats.book_errors, 1);
        assert_eq!(engine.export_orderbook_state().len(), 2);
    }

    // ==================== Scan Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_scan_starts_one_attempt_per_key() {
        let engine = engine(PaperFillPolicy::always_fill());
        let now = Utc::now();
        seed_books(&engine, now);

        let first = engine.scan_once(now);
        assert_eq!(first.opportunities, 1);
        assert_eq!(first.started, 1);
        assert_eq!(engine.in_flight(), 1);

        let second = engine.scan_once(now);
        assert_eq!(second.started, 0);
        assert_eq!(second.skipped_in_flight, 1);

        let resolved = engine.drain().await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].outcome, Some(AttemptOutcome::BothFilled));
        assert_eq!(engine.in_flight(), 0);

        let stats = engine.stats();
        assert_eq!(stats.attempts_started, 1);
        assert_eq!(stats.both_filled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_respects_kill_switch() {
        let engine = engine(PaperFillPolicy::always_fill());
        let now = Utc::now();
        seed_books(&engine, now);
        engine.risk().trip_kill_switch("manual");

        let report = engine.scan_once(now);
        assert_eq!(report.opportunities, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.started, 0);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.export_rejections(10).len(), 1);
    }

    // ==================== Health Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_health_and_reset() {
        let engine = engine(PaperFillPolicy::always_fill());
        let now = Utc::now();
        seed_books(&engine, now);
        engine.scan_once(now);
        engine.drain().await;

        let health = engine.export_bot_health();
        assert_eq!(health.mode, ExecutionMode::Taker);
        assert_eq!(health.books_tracked, 2);
        assert_eq!(health.stats.attempts_resolved, 1);
        assert_eq!(health.fill_log_entries, 1);
        assert_eq!(engine.export_recent_opportunities(5).len(), 1);

        engine.reset();
        assert!(engine.export_orderbook_state().is_empty());
        assert!(engine.export_open_positions().is_empty());
        assert_eq!(engine.stats(), EngineStats::default());
        assert_eq!(engine.fill_log().len(), 1);
    }
}
