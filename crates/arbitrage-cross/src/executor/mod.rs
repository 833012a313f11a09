//! Execution state machines.
//!
//! Each approved opportunity becomes an [`ExecutionAttempt`] driven to
//! `RESOLVED` by an [`ArbExecutor`] on its own task:
//!
//! - [`TakerExecutor`] crosses the spread on both venues at once.
//! - [`MakerHedgeExecutor`] rests a passive order on one venue and hedges
//!   aggressively on the other once it fills.
//!
//! Every venue round trip and every wait for fills is bounded by
//! `tokio::time::timeout`, so an attempt always terminates.

mod attempt;
mod maker_hedge;
mod taker;

pub use attempt::{
    AttemptOutcome, AttemptState, ExecutionAttempt, LegRole, OrderRecord, StateTransition,
};
pub use maker_hedge::{choose_maker_leg, MakerHedgeExecutor};
pub use taker::TakerExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use xarb_core::{ExecutionConfig, ExecutionMode, Venue};

use crate::alerts::{Alert, AlertChannel, AlertKind, AlertSeverity, CancelOutcome, OneSidedDetails};
use crate::detector::OpportunityKey;
use crate::fees::FeeSchedule;
use crate::fill_log::FillLogger;
use crate::inventory::{FillRecord, InventoryTracker};
use crate::race::RaceModel;
use crate::risk::RiskManager;
use crate::venue::{
    ClosedOrder, FillReport, FillRouter, LateFillHandler, OrderRef, OrderRequest, VenueError,
    VenueGateway,
};

// =============================================================================
// Errors
// =============================================================================

/// Execution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The transition table does not allow this move.
    #[error("attempt {attempt_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Attempt being driven.
        attempt_id: Uuid,
        /// Current state.
        from: AttemptState,
        /// Requested state.
        to: AttemptState,
    },

    /// The venue refused, timed out or was unreachable.
    #[error(transparent)]
    Venue(#[from] VenueError),
}

// =============================================================================
// In-flight Dedup
// =============================================================================

/// Keys of opportunities with a running attempt.
#[derive(Debug, Default)]
pub struct InFlightSet {
    keys: Mutex<HashSet<OpportunityKey>>,
}

impl InFlightSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`, or returns `None` if it is already claimed. The key is
    /// released when the guard drops.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, key: OpportunityKey) -> Option<InFlightGuard> {
        if !self.keys.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            key,
        })
    }

    #[must_use]
    pub fn contains(&self, key: &OpportunityKey) -> bool {
        self.keys.lock().contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    key: OpportunityKey,
}

impl InFlightGuard {
    #[must_use]
    pub fn key(&self) -> &OpportunityKey {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.keys.lock().remove(&self.key);
    }
}

// =============================================================================
// Executor Trait
// =============================================================================

/// Drives an attempt from `PROPOSED` to `RESOLVED`.
#[async_trait]
pub trait ArbExecutor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Runs the attempt to completion. The returned attempt is always resolved.
    async fn execute(&self, attempt: ExecutionAttempt) -> ExecutionAttempt;
}

/// Builds the executor for `mode`.
#[must_use]
pub fn executor_for(mode: ExecutionMode, ctx: Arc<ExecutionContext>) -> Arc<dyn ArbExecutor> {
    match mode {
        ExecutionMode::Taker => Arc::new(TakerExecutor::new(ctx)),
        ExecutionMode::MakerHedge => Arc::new(MakerHedgeExecutor::new(ctx)),
    }
}

// =============================================================================
// Execution Context
// =============================================================================

/// Shared services an executor needs.
pub struct ExecutionContext {
    pub gateway: Arc<dyn VenueGateway>,
    pub fills: Arc<FillRouter>,
    pub inventory: Arc<InventoryTracker>,
    pub risk: Arc<RiskManager>,
    pub race: Arc<RaceModel>,
    pub fees: FeeSchedule,
    pub fill_log: Arc<FillLogger>,
    pub alerts: Arc<AlertChannel>,
    pub config: ExecutionConfig,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A placed order and its fill subscription.
pub(crate) type Placed = (OrderRef, mpsc::UnboundedReceiver<FillReport>);

/// Fills accumulated for one order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct FillProgress {
    pub filled: Decimal,
    pub notional: Decimal,
    pub first_fill_at: Option<DateTime<Utc>>,
}

impl FillProgress {
    fn add(&mut self, report: &FillReport) {
        if report.filled_size <= Decimal::ZERO {
            return;
        }
        self.filled += report.filled_size;
        self.notional += report.filled_size * report.filled_price;
        self.first_fill_at.get_or_insert(report.at);
    }

    pub fn avg_price(&self) -> Option<Decimal> {
        (self.filled > Decimal::ZERO).then(|| self.notional / self.filled)
    }
}

impl ExecutionContext {
    fn rpc_timeout_ms(&self) -> u64 {
        u64::try_from(self.config.rpc_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Places an order, bounded by the RPC timeout.
    pub(crate) async fn place(&self, request: &OrderRequest) -> Result<OrderRef, VenueError> {
        match tokio::time::timeout(self.config.rpc_timeout, self.gateway.place_order(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(VenueError::Timeout {
                venue: request.venue,
                operation: "place",
                after_ms: self.rpc_timeout_ms(),
            }),
        }
    }

    /// Cancels an order, bounded by the RPC timeout.
    pub(crate) async fn cancel(&self, venue: Venue, order_ref: &OrderRef) -> CancelOutcome {
        let result =
            tokio::time::timeout(self.config.rpc_timeout, self.gateway.cancel_order(venue, order_ref))
                .await;
        match result {
            Ok(Ok(true)) => CancelOutcome::Cancelled,
            Ok(Ok(false)) => CancelOutcome::NothingToCancel,
            Ok(Err(e)) => {
                warn!(%venue, %order_ref, error = %e, "Cancel failed");
                CancelOutcome::Failed(e.to_string())
            }
            Err(_) => {
                let e = VenueError::Timeout {
                    venue,
                    operation: "cancel",
                    after_ms: self.rpc_timeout_ms(),
                };
                warn!(%venue, %order_ref, error = %e, "Cancel timed out");
                CancelOutcome::Failed(e.to_string())
            }
        }
    }

    /// Collects fills until `target` is reached or `wait` elapses.
    pub(crate) async fn await_fills(
        &self,
        rx: &mut mpsc::UnboundedReceiver<FillReport>,
        progress: &mut FillProgress,
        target: Decimal,
        wait: Duration,
    ) {
        let deadline = Instant::now() + wait;
        while progress.filled < target {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(report)) => progress.add(&report),
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// [`Self::await_fills`] for an order that may not have been placed.
    pub(crate) async fn await_placed(
        &self,
        placed: Option<Placed>,
        progress: &mut FillProgress,
        target: Decimal,
        wait: Duration,
    ) -> Option<Placed> {
        let (order_ref, mut rx) = placed?;
        self.await_fills(&mut rx, progress, target, wait).await;
        Some((order_ref, rx))
    }

    /// Picks up fills that were already delivered, e.g. one racing a cancel.
    fn drain_fills(
        rx: &mut mpsc::UnboundedReceiver<FillReport>,
        progress: &mut FillProgress,
    ) {
        while let Ok(report) = rx.try_recv() {
            progress.add(&report);
        }
    }

    /// Closes the order's fill subscription and collects every fill that
    /// reached it. Fills reported afterwards go to the late-fill path.
    pub(crate) fn settle(
        &self,
        attempt_id: Uuid,
        event_id: &str,
        record: &OrderRecord,
        placed: Placed,
        progress: &mut FillProgress,
    ) {
        let (order_ref, mut rx) = placed;
        let unclaimed = self.fills.close(
            &order_ref,
            ClosedOrder {
                attempt_id,
                event_id: event_id.to_string(),
                venue: record.venue,
                side: record.side,
                late_fills: 0,
            },
        );
        Self::drain_fills(&mut rx, progress);
        for report in &unclaimed {
            progress.add(report);
        }
    }

    /// Places the order described by `record`, subscribing to its fills.
    ///
    /// On failure the error is stored on the record and a placement alert is
    /// published.
    pub(crate) async fn submit(
        &self,
        attempt_id: Uuid,
        event_id: &str,
        record: &mut OrderRecord,
    ) -> Option<Placed> {
        let request = OrderRequest {
            venue: record.venue,
            instrument_id: record.instrument_id.clone(),
            side: record.side,
            price: record.limit_price,
            size: record.requested_size,
            order_type: record.order_type,
        };
        record.placed_at = Some(Utc::now());
        match self.place(&request).await {
            Ok(order_ref) => {
                let rx = self.fills.subscribe(&order_ref);
                debug!(
                    %attempt_id,
                    venue = %record.venue,
                    side = %record.side,
                    role = ?record.role,
                    price = %record.limit_price,
                    size = %record.requested_size,
                    %order_ref,
                    "Order placed"
                );
                record.order_ref = Some(order_ref.clone());
                Some((order_ref, rx))
            }
            Err(e) => {
                record.error = Some(e.to_string());
                record.cancel = Some(CancelOutcome::NotPlaced);
                self.alerts.publish(
                    Alert::new(
                        AlertSeverity::Warning,
                        AlertKind::PlacementFailure,
                        format!("{} order on {} failed: {e}", record.side, record.venue),
                    )
                    .for_attempt(event_id, attempt_id),
                );
                None
            }
        }
    }

    /// Copies fill progress onto the order record.
    pub(crate) fn apply_progress(record: &mut OrderRecord, progress: &FillProgress) {
        record.filled_size = progress.filled;
        record.avg_fill_price = progress.avg_price();
        record.first_fill_at = progress.first_fill_at;
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Books fills, moves the attempt to its outcome and `RESOLVED`, releases
    /// its reservation, reports the outcome to risk, raises alerts and
    /// appends it to the fill log.
    pub(crate) fn finalize(&self, mut attempt: ExecutionAttempt) -> ExecutionAttempt {
        let event_id = attempt.opportunity.event_id.clone();

        for order in attempt.orders.iter().filter(|o| o.is_filled()) {
            self.inventory.record_fill(&FillRecord {
                attempt_id: attempt.attempt_id,
                event_id: event_id.clone(),
                venue: order.venue,
                signed_size: order.signed_fill(),
                price: order.avg_fill_price.unwrap_or(order.limit_price),
                fill_seq: 0,
            });
        }

        let first_filled = attempt.orders.first().is_some_and(OrderRecord::is_filled);
        let second_filled = attempt.orders.get(1).is_some_and(OrderRecord::is_filled);
        let outcome = AttemptOutcome::from_fills(first_filled, second_filled);

        attempt.locked_pnl = self.locked_pnl(&attempt);
        if outcome == AttemptOutcome::OneSided {
            attempt.locked_pnl -= self.unhedged_fees(&attempt);
        }

        self.advance(&mut attempt, outcome.state());
        self.advance(&mut attempt, AttemptState::Resolved);
        attempt.outcome = Some(outcome);

        match outcome {
            AttemptOutcome::OneSided => self.alert_one_sided(&mut attempt),
            AttemptOutcome::BothFilled => self.check_imbalance(&mut attempt),
            AttemptOutcome::BothFailed => {}
        }

        self.inventory.end_attempt(&event_id, attempt.attempt_id);
        self.risk.record_outcome(outcome, attempt.locked_pnl);
        self.fill_log.record(&attempt);

        info!(
            attempt_id = %attempt.attempt_id,
            %event_id,
            mode = %attempt.mode,
            outcome = %outcome,
            size = %attempt.size,
            locked_pnl = %attempt.locked_pnl,
            "Execution attempt resolved"
        );
        attempt
    }

    /// Transitions, forcing the state if the table disallows it so the
    /// attempt still terminates.
    pub(crate) fn advance(&self, attempt: &mut ExecutionAttempt, next: AttemptState) {
        if let Err(e) = attempt.transition(next) {
            error!(error = %e, "Forcing attempt state");
            attempt.force_state(next);
        }
    }

    /// Hedged size times the realized spread, less fees on that size.
    fn locked_pnl(&self, attempt: &ExecutionAttempt) -> Decimal {
        let opp = &attempt.opportunity;
        let buy = attempt.orders.iter().find(|o| o.venue == opp.buy_venue);
        let sell = attempt.orders.iter().find(|o| o.venue == opp.sell_venue);
        let (Some(buy), Some(sell)) = (buy, sell) else {
            return Decimal::ZERO;
        };
        let (Some(buy_price), Some(sell_price)) = (buy.avg_fill_price, sell.avg_fill_price) else {
            return Decimal::ZERO;
        };

        let hedged = buy.filled_size.min(sell.filled_size);
        let fees = self.fees.fee(buy.venue, buy_price, hedged) + self.fees.fee(sell.venue, sell_price, hedged);
        hedged * (sell_price - buy_price) - fees
    }

    /// Fees paid on the filled leg of a one-sided attempt.
    fn unhedged_fees(&self, attempt: &ExecutionAttempt) -> Decimal {
        attempt
            .orders
            .iter()
            .filter(|o| o.is_filled())
            .map(|o| {
                self.fees.fee(
                    o.venue,
                    o.avg_fill_price.unwrap_or(o.limit_price),
                    o.filled_size,
                )
            })
            .sum()
    }

    fn alert_one_sided(&self, attempt: &mut ExecutionAttempt) {
        let Some(filled) = attempt.orders.iter().find(|o| o.is_filled()) else {
            return;
        };
        let Some(unfilled) = attempt.orders.iter().find(|o| !o.is_filled()) else {
            return;
        };

        let details = residual_details(filled, unfilled, filled.filled_size);
        let alert = Alert::new(
            AlertSeverity::Critical,
            AlertKind::OneSidedFill,
            format!(
                "One-sided fill: {} {} filled on {}, {} leg unfilled",
                filled.side, filled.filled_size, filled.venue, unfilled.venue
            ),
        )
        .for_attempt(attempt.event_id(), attempt.attempt_id)
        .with_one_sided(details);

        self.alerts.publish(alert.clone());
        attempt.alerts.push(alert);
    }

    fn check_imbalance(&self, attempt: &mut ExecutionAttempt) {
        let (Some(first), Some(second)) = (attempt.orders.first(), attempt.orders.get(1)) else {
            return;
        };
        if first.filled_size == second.filled_size {
            return;
        }

        let (over, under) = if first.filled_size > second.filled_size {
            (first, second)
        } else {
            (second, first)
        };
        let excess = over.filled_size - under.filled_size;
        let details = residual_details(over, under, excess);
        error!(
            attempt_id = %attempt.attempt_id,
            event_id = %attempt.opportunity.event_id,
            residual = %details.residual_size,
            action = %details.recommended_action,
            "Partially hedged attempt left a directional residual"
        );

        let alert = Alert::new(
            AlertSeverity::Critical,
            AlertKind::Imbalance,
            format!(
                "Leg sizes differ: {} on {} vs {} on {}, residual {}",
                first.filled_size,
                first.venue,
                second.filled_size,
                second.venue,
                details.residual_size
            ),
        )
        .for_attempt(attempt.event_id(), attempt.attempt_id)
        .with_one_sided(details);

        self.alerts.publish(alert.clone());
        attempt.alerts.push(alert);
    }
}

/// Residual left by `over` filling `excess` more than `under`, with the
/// order that flattens or completes it.
fn residual_details(over: &OrderRecord, under: &OrderRecord, excess: Decimal) -> OneSidedDetails {
    OneSidedDetails {
        filled_venue: over.venue,
        filled_instrument: over.instrument_id.clone(),
        filled_side: over.side,
        filled_size: over.filled_size,
        filled_price: over.avg_fill_price.unwrap_or(over.limit_price),
        unfilled_venue: under.venue,
        unfilled_instrument: under.instrument_id.clone(),
        unfilled_cancel: under.cancel.clone().unwrap_or(CancelOutcome::NotPlaced),
        residual_size: excess * over.side.sign(),
        recommended_action: format!(
            "{} {} {} on {} to flatten, or {} {} on {} to complete the hedge",
            over.side.opposite(),
            excess,
            over.instrument_id,
            over.venue,
            under.side,
            excess,
            under.venue,
        ),
    }
}

// =============================================================================
// Late Fills
// =============================================================================

impl LateFillHandler for ExecutionContext {
    /// Books a fill that arrived after its attempt resolved. The attempt's
    /// recorded outcome no longer matches the venue, so this is critical.
    fn on_late_fill(&self, order: &ClosedOrder, report: &FillReport) {
        if report.filled_size <= Decimal::ZERO {
            return;
        }
        let booked = self.inventory.record_fill(&FillRecord {
            attempt_id: order.attempt_id,
            event_id: order.event_id.clone(),
            venue: order.venue,
            signed_size: report.filled_size * order.side.sign(),
            price: report.filled_price,
            fill_seq: order.late_fills,
        });
        let net = self.inventory.get_exposure(&order.event_id);

        error!(
            attempt_id = %order.attempt_id,
            event_id = %order.event_id,
            venue = %order.venue,
            side = %order.side,
            size = %report.filled_size,
            price = %report.filled_price,
            order_ref = %report.order_ref,
            ?booked,
            net_position = %net.net_position,
            "Fill arrived after attempt resolved"
        );

        let alert = Alert::new(
            AlertSeverity::Critical,
            AlertKind::LateFill,
            format!(
                "Late fill: {} {} @ {} on {} after the attempt resolved; net position now {}, \
                 recorded outcome is stale",
                order.side, report.filled_size, report.filled_price, order.venue, net.net_position
            ),
        )
        .for_attempt(order.event_id.clone(), order.attempt_id);
        self.alerts.publish(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key(event: &str) -> OpportunityKey {
        OpportunityKey {
            event_id: event.to_string(),
            buy_venue: Venue::Kalshi,
            sell_venue: Venue::Polymarket,
        }
    }

    // ==================== In-flight Tests ====================

    #[test]
    fn test_in_flight_dedup_and_release() {
        let set = Arc::new(InFlightSet::new());
        let guard = set.try_acquire(key("evt")).unwrap();
        assert!(set.try_acquire(key("evt")).is_none());
        assert!(set.try_acquire(key("other")).is_some());
        assert!(set.contains(&key("evt")));

        drop(guard);
        assert!(!set.contains(&key("evt")));
        assert!(set.try_acquire(key("evt")).is_some());
    }

    #[test]
    fn test_reverse_direction_is_distinct() {
        let set = Arc::new(InFlightSet::new());
        let _guard = set.try_acquire(key("evt")).unwrap();
        let reverse = OpportunityKey {
            event_id: "evt".to_string(),
            buy_venue: Venue::Polymarket,
            sell_venue: Venue::Kalshi,
        };
        assert!(set.try_acquire(reverse).is_some());
    }

    // ==================== Fill Progress Tests ====================

    #[test]
    fn test_fill_progress_vwap() {
        let mut progress = FillProgress::default();
        let order_ref = OrderRef::new("o");
        for (size, price) in [(dec!(6), dec!(0.40)), (dec!(4), dec!(0.45))] {
            progress.add(&FillReport {
                order_ref: order_ref.clone(),
                filled_size: size,
                filled_price: price,
                at: Utc::now(),
            });
        }
        assert_eq!(progress.filled, dec!(10));
        assert_eq!(progress.avg_price(), Some(dec!(0.42)));
        assert!(progress.first_fill_at.is_some());
    }
}
