//! Pre-trade risk checks.
//!
//! [`RiskManager::evaluate`] is the gate every opportunity passes before an
//! execution attempt is spawned. It resizes to the trade and exposure caps,
//! rejects on the kill switch, loss pause, confidence and minimum size, and
//! records every rejection.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use xarb_core::RiskLimits;

use crate::alerts::{Alert, AlertChannel, AlertKind, AlertSeverity};
use crate::detector::{ArbOpportunity, Confidence};
use crate::executor::AttemptOutcome;
use crate::inventory::InventoryTracker;

// =============================================================================
// Decisions
// =============================================================================

/// Why an opportunity was not approved.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    /// Daily loss limit reached; stays active until manually reset.
    #[error("kill switch active")]
    KillSwitchActive,

    /// Trading paused after consecutive losing attempts.
    #[error("paused after {losses} consecutive losses, {remaining_ms}ms remaining")]
    ConsecutiveLosses {
        /// Losses in a row.
        losses: u32,
        /// Time left in the pause.
        remaining_ms: i64,
    },

    /// Edge does not cover anything after fees.
    #[error("non-positive edge {edge_bps}bps")]
    NonPositiveEdge {
        /// Net edge at detection.
        edge_bps: Decimal,
    },

    /// A leg's fill probability is below the configured floor.
    #[error("low confidence opportunity")]
    LowConfidence,

    /// No room left under the per-event cap.
    #[error("event {event_id} exposure {committed} at cap {limit}")]
    EventExposureCap {
        /// Event at its cap.
        event_id: String,
        /// Committed capital including in-flight attempts.
        committed: Decimal,
        /// Configured cap.
        limit: Decimal,
    },

    /// No room left under the portfolio cap.
    #[error("portfolio exposure {committed} at cap {limit}")]
    PortfolioExposureCap {
        /// Committed capital across all events.
        committed: Decimal,
        /// Configured cap.
        limit: Decimal,
    },

    /// Size after every resize is below the configured minimum.
    #[error("size {size} below minimum {minimum}")]
    BelowMinimumSize {
        /// Size after resizing.
        size: Decimal,
        /// Configured minimum.
        minimum: Decimal,
    },
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskDecision {
    Approved { size: Decimal },
    Rejected(RejectReason),
}

impl RiskDecision {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// Approved size, if any.
    #[must_use]
    pub fn size(&self) -> Option<Decimal> {
        match self {
            Self::Approved { size } => Some(*size),
            Self::Rejected(_) => None,
        }
    }
}

/// A logged rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub event_id: String,
    pub opportunity_id: uuid::Uuid,
    pub edge_bps: Decimal,
    pub recommended_size: Decimal,
    pub reason: RejectReason,
    pub at: DateTime<Utc>,
}

/// Point-in-time risk state for health export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub daily_pnl: Decimal,
    pub consecutive_losses: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub portfolio_exposure: Decimal,
    pub rejections: usize,
}

// =============================================================================
// Risk Manager
// =============================================================================

/// Pre-trade gate with a latching kill switch and a loss-streak pause.
#[derive(Debug)]
pub struct RiskManager {
    limits: RiskLimits,
    inventory: Arc<InventoryTracker>,
    alerts: Option<Arc<AlertChannel>>,
    kill_switch: AtomicBool,
    kill_reason: RwLock<Option<String>>,
    consecutive_losses: AtomicU32,
    daily_pnl: RwLock<Decimal>,
    pnl_day: Mutex<Option<NaiveDate>>,
    paused_until: Mutex<Option<DateTime<Utc>>>,
    rejections: Mutex<VecDeque<RejectionRecord>>,
}

impl RiskManager {
    /// Creates a risk manager reading exposure from `inventory`.
    #[must_use]
    pub fn new(limits: RiskLimits, inventory: Arc<InventoryTracker>) -> Self {
        Self {
            limits,
            inventory,
            alerts: None,
            kill_switch: AtomicBool::new(false),
            kill_reason: RwLock::new(None),
            consecutive_losses: AtomicU32::new(0),
            daily_pnl: RwLock::new(Decimal::ZERO),
            pnl_day: Mutex::new(None),
            paused_until: Mutex::new(None),
            rejections: Mutex::new(VecDeque::new()),
        }
    }

    /// Publishes kill-switch alerts on `alerts`.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertChannel>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    #[must_use]
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Evaluates an opportunity against the wall clock.
    pub fn evaluate(&self, opportunity: &ArbOpportunity) -> RiskDecision {
        self.evaluate_at(opportunity, Utc::now())
    }

    /// Evaluates an opportunity at `now`.
    pub fn evaluate_at(&self, opportunity: &ArbOpportunity, now: DateTime<Utc>) -> RiskDecision {
        match self.check(opportunity, now) {
            Ok(size) => {
                info!(
                    event_id = %opportunity.event_id,
                    buy_venue = %opportunity.buy_venue,
                    recommended_size = %opportunity.recommended_size,
                    approved_size = %size,
                    "Opportunity approved"
                );
                RiskDecision::Approved { size }
            }
            Err(reason) => {
                self.record_rejection(opportunity, reason.clone(), now);
                RiskDecision::Rejected(reason)
            }
        }
    }

    fn check(&self, opportunity: &ArbOpportunity, now: DateTime<Utc>) -> Result<Decimal, RejectReason> {
        self.roll_day(now);

        if self.is_kill_switch_active() {
            return Err(RejectReason::KillSwitchActive);
        }
        let daily_pnl = self.daily_pnl();
        if daily_pnl <= -self.limits.max_daily_loss {
            self.trip_kill_switch(format!(
                "daily loss {} reached limit {}",
                -daily_pnl, self.limits.max_daily_loss
            ));
            return Err(RejectReason::KillSwitchActive);
        }

        self.check_pause(now)?;

        if opportunity.edge_bps <= Decimal::ZERO {
            return Err(RejectReason::NonPositiveEdge {
                edge_bps: opportunity.edge_bps,
            });
        }
        if opportunity.confidence == Confidence::Low && !self.limits.allow_low_confidence {
            return Err(RejectReason::LowConfidence);
        }

        let mut size = opportunity.recommended_size.min(self.limits.max_trade_size);
        let per_contract = opportunity.capital_per_contract();

        let committed = self
            .inventory
            .get_exposure(&opportunity.event_id)
            .committed_exposure();
        let event_room = self.limits.max_event_exposure - committed;
        if event_room <= Decimal::ZERO {
            return Err(RejectReason::EventExposureCap {
                event_id: opportunity.event_id.clone(),
                committed,
                limit: self.limits.max_event_exposure,
            });
        }
        size = size.min(contracts_within(event_room, per_contract));

        let portfolio = self.inventory.portfolio_exposure();
        let portfolio_room = self.limits.max_portfolio_exposure - portfolio;
        if portfolio_room <= Decimal::ZERO {
            return Err(RejectReason::PortfolioExposureCap {
                committed: portfolio,
                limit: self.limits.max_portfolio_exposure,
            });
        }
        size = size.min(contracts_within(portfolio_room, per_contract));

        if size < self.limits.min_trade_size {
            return Err(RejectReason::BelowMinimumSize {
                size,
                minimum: self.limits.min_trade_size,
            });
        }
        Ok(size)
    }

    fn check_pause(&self, now: DateTime<Utc>) -> Result<(), RejectReason> {
        let mut paused_until = self.paused_until.lock();
        let Some(until) = *paused_until else {
            return Ok(());
        };
        if now >= until {
            *paused_until = None;
            self.consecutive_losses.store(0, Ordering::SeqCst);
            info!("Consecutive-loss pause elapsed, trading resumed");
            return Ok(());
        }
        Err(RejectReason::ConsecutiveLosses {
            losses: self.consecutive_losses.load(Ordering::SeqCst),
            remaining_ms: (until - now).num_milliseconds(),
        })
    }

    fn record_rejection(&self, opportunity: &ArbOpportunity, reason: RejectReason, now: DateTime<Utc>) {
        warn!(
            event_id = %opportunity.event_id,
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            edge_bps = %opportunity.edge_bps.round_dp(1),
            recommended_size = %opportunity.recommended_size,
            reason = %reason,
            "Opportunity rejected by risk"
        );
        let capacity = self.limits.rejection_history.max(1);
        let mut rejections = self.rejections.lock();
        while rejections.len() >= capacity {
            rejections.pop_front();
        }
        rejections.push_back(RejectionRecord {
            event_id: opportunity.event_id.clone(),
            opportunity_id: opportunity.id,
            edge_bps: opportunity.edge_bps,
            recommended_size: opportunity.recommended_size,
            reason,
            at: now,
        });
    }

    // =========================================================================
    // Outcome Tracking
    // =========================================================================

    /// Records a resolved attempt's outcome and locked-in P&L.
    ///
    /// One-sided fills and non-positive hedged results count as losses.
    /// Attempts where nothing filled are neutral.
    pub fn record_outcome(&self, outcome: AttemptOutcome, pnl: Decimal) {
        self.record_outcome_at(outcome, pnl, Utc::now());
    }

    /// [`Self::record_outcome`] at an explicit time.
    pub fn record_outcome_at(&self, outcome: AttemptOutcome, pnl: Decimal, now: DateTime<Utc>) {
        self.record_pnl_at(pnl, now);

        let loss = match outcome {
            AttemptOutcome::BothFilled => pnl <= Decimal::ZERO,
            AttemptOutcome::OneSided => true,
            AttemptOutcome::BothFailed => return,
        };
        if !loss {
            self.consecutive_losses.store(0, Ordering::SeqCst);
            return;
        }

        let losses = self.consecutive_losses.fetch_add(1, Ordering::SeqCst) + 1;
        if losses >= self.limits.max_consecutive_losses {
            let pause = chrono::Duration::from_std(self.limits.loss_pause)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let until = now + pause;
            *self.paused_until.lock() = Some(until);
            warn!(
                losses,
                max_consecutive_losses = self.limits.max_consecutive_losses,
                %until,
                "Trading paused after consecutive losses"
            );
        }
    }

    /// Adds realized P&L to the daily total.
    pub fn record_pnl(&self, pnl: Decimal) {
        self.record_pnl_at(pnl, Utc::now());
    }

    fn record_pnl_at(&self, pnl: Decimal, now: DateTime<Utc>) {
        self.roll_day(now);
        let daily = {
            let mut daily = self.daily_pnl.write();
            *daily += pnl;
            *daily
        };
        if daily <= -self.limits.max_daily_loss && !self.is_kill_switch_active() {
            self.trip_kill_switch(format!(
                "daily loss {} reached limit {}",
                -daily, self.limits.max_daily_loss
            ));
        }
    }

    fn roll_day(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut day = self.pnl_day.lock();
        match *day {
            Some(d) if d == today => {}
            Some(_) => {
                *day = Some(today);
                let previous = std::mem::replace(&mut *self.daily_pnl.write(), Decimal::ZERO);
                info!(%today, previous_daily_pnl = %previous, "Daily P&L rolled over");
            }
            None => *day = Some(today),
        }
    }

    // =========================================================================
    // Kill Switch
    // =========================================================================

    /// Halts all new attempts until [`Self::reset_kill_switch`].
    pub fn trip_kill_switch(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.kill_switch.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.kill_reason.write() = Some(reason.clone());
        if let Some(alerts) = &self.alerts {
            alerts.publish(Alert::new(
                AlertSeverity::Critical,
                AlertKind::KillSwitchTripped,
                format!("Kill switch tripped: {reason}"),
            ));
        } else {
            warn!(%reason, "Kill switch tripped");
        }
    }

    /// Re-enables trading after a manual review.
    pub fn reset_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
        *self.kill_reason.write() = None;
        info!("Kill switch reset");
    }

    #[must_use]
    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    /// Zeroes the daily P&L. The kill switch is unaffected.
    pub fn reset_daily(&self) {
        *self.daily_pnl.write() = Decimal::ZERO;
    }

    #[must_use]
    pub fn daily_pnl(&self) -> Decimal {
        *self.daily_pnl.read()
    }

    #[must_use]
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::SeqCst)
    }

    /// Most recent rejections, newest last.
    #[must_use]
    pub fn rejections(&self, n: usize) -> Vec<RejectionRecord> {
        let rejections = self.rejections.lock();
        let skip = rejections.len().saturating_sub(n);
        rejections.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            kill_switch_active: self.is_kill_switch_active(),
            kill_switch_reason: self.kill_reason.read().clone(),
            daily_pnl: self.daily_pnl(),
            consecutive_losses: self.consecutive_losses(),
            paused_until: *self.paused_until.lock(),
            portfolio_exposure: self.inventory.portfolio_exposure(),
            rejections: self.rejections.lock().len(),
        }
    }

    /// Clears every counter, the pause, the history and the kill switch.
    pub fn reset(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
        *self.kill_reason.write() = None;
        self.consecutive_losses.store(0, Ordering::SeqCst);
        *self.daily_pnl.write() = Decimal::ZERO;
        *self.pnl_day.lock() = None;
        *self.paused_until.lock() = None;
        self.rejections.lock().clear();
    }
}

/// Whole contracts affordable with `room` at `per_contract` capital each.
fn contracts_within(room: Decimal, per_contract: Decimal) -> Decimal {
    if per_contract <= Decimal::ZERO {
        return room.max(Decimal::ZERO).floor();
    }
    (room / per_contract).floor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::ExecutableQuote;
    use crate::detector::LegQuote;
    use crate::inventory::FillRecord;
    use rust_decimal_macros::dec;
    use uuid::Uuid;
    use xarb_core::{Side, Venue};

    // ==================== Helper Functions ====================

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn leg(venue: Venue, side: Side, price: Decimal) -> LegQuote {
        let mut quote = ExecutableQuote::empty(side, dec!(100));
        quote.max_size = dec!(100);
        quote.vwap_price = price;
        quote.best_price = price;
        quote.worst_price = price;
        quote.levels_consumed = 1;
        quote.sufficient_depth = true;
        LegQuote {
            venue,
            instrument_id: format!("{venue}-inst"),
            side,
            quote,
            book_age_ms: 0,
            passive_price: None,
            passive_queue_ahead: Decimal::ZERO,
            passive_fill_probability: 1.0,
        }
    }

    fn opportunity(recommended: Decimal) -> ArbOpportunity {
        ArbOpportunity {
            id: Uuid::new_v4(),
            event_id: "evt".to_string(),
            buy_venue: Venue::Kalshi,
            sell_venue: Venue::Polymarket,
            buy_leg: leg(Venue::Kalshi, Side::Buy, dec!(0.46)),
            sell_leg: leg(Venue::Polymarket, Side::Sell, dec!(0.51)),
            executable_size: recommended,
            recommended_size: recommended,
            gross_edge_bps: dec!(500),
            fee_per_contract: Decimal::ZERO,
            edge_bps: dec!(500),
            confidence: Confidence::High,
            detected_at: now(),
        }
    }

    fn manager(limits: RiskLimits) -> (RiskManager, Arc<InventoryTracker>) {
        let inventory = Arc::new(InventoryTracker::new());
        (RiskManager::new(limits, Arc::clone(&inventory)), inventory)
    }

    // ==================== Kill Switch Tests ====================

    #[test]
    fn test_daily_loss_at_limit_trips_kill_switch() {
        let alerts = Arc::new(AlertChannel::default());
        let (risk, _) = manager(RiskLimits::default().with_max_daily_loss(dec!(200)));
        let risk = risk.with_alerts(Arc::clone(&alerts));

        risk.record_outcome_at(AttemptOutcome::OneSided, dec!(-200), now());
        let decision = risk.evaluate_at(&opportunity(dec!(50)), now());

        assert_eq!(decision, RiskDecision::Rejected(RejectReason::KillSwitchActive));
        assert!(risk.is_kill_switch_active());
        assert_eq!(alerts.recent(1)[0].kind, AlertKind::KillSwitchTripped);
    }

    #[test]
    fn test_kill_switch_survives_day_rollover_until_reset() {
        let (risk, _) = manager(RiskLimits::default().with_max_daily_loss(dec!(100)));
        risk.record_pnl_at(dec!(-150), now());
        assert!(risk.is_kill_switch_active());

        let tomorrow = now() + chrono::Duration::days(1);
        assert_eq!(
            risk.evaluate_at(&opportunity(dec!(50)), tomorrow),
            RiskDecision::Rejected(RejectReason::KillSwitchActive)
        );
        assert_eq!(risk.daily_pnl(), Decimal::ZERO);

        risk.reset_kill_switch();
        assert!(risk.evaluate_at(&opportunity(dec!(50)), tomorrow).is_approved());
    }

    // ==================== Sizing Tests ====================

    #[test]
    fn test_resizes_to_trade_cap() {
        let (risk, _) = manager(RiskLimits::default().with_max_trade_size(dec!(40)));
        assert_eq!(
            risk.evaluate_at(&opportunity(dec!(100)), now()),
            RiskDecision::Approved { size: dec!(40) }
        );
    }

    #[test]
    fn test_resizes_to_event_room() {
        let (risk, inventory) = manager(RiskLimits::default().with_max_event_exposure(dec!(100)));
        // 100 * 0.5 = 50 committed, 50 room / 0.95 per contract = 52
        inventory.record_fill(&FillRecord {
            attempt_id: Uuid::new_v4(),
            event_id: "evt".to_string(),
            venue: Venue::Kalshi,
            signed_size: dec!(100),
            price: dec!(0.5),
            fill_seq: 0,
        });
        assert_eq!(
            risk.evaluate_at(&opportunity(dec!(200)), now()),
            RiskDecision::Approved { size: dec!(52) }
        );
    }

    #[test]
    fn test_in_flight_reservation_counts_against_cap() {
        let (risk, inventory) = manager(RiskLimits::default().with_max_event_exposure(dec!(100)));
        inventory.begin_attempt("evt", Uuid::new_v4(), dec!(100));
        let decision = risk.evaluate_at(&opportunity(dec!(50)), now());
        assert!(matches!(
            decision,
            RiskDecision::Rejected(RejectReason::EventExposureCap { .. })
        ));
        assert_eq!(risk.rejections(10).len(), 1);
    }

    #[test]
    fn test_portfolio_cap() {
        let limits = RiskLimits::default()
            .with_max_event_exposure(dec!(1000))
            .with_max_portfolio_exposure(dec!(1000));
        let (risk, inventory) = manager(limits);
        inventory.begin_attempt("other", Uuid::new_v4(), dec!(1000));
        assert!(matches!(
            risk.evaluate_at(&opportunity(dec!(50)), now()),
            RiskDecision::Rejected(RejectReason::PortfolioExposureCap { .. })
        ));
    }

    #[test]
    fn test_below_minimum_size() {
        let (risk, _) = manager(RiskLimits::default());
        assert_eq!(
            risk.evaluate_at(&opportunity(dec!(3)), now()),
            RiskDecision::Rejected(RejectReason::BelowMinimumSize {
                size: dec!(3),
                minimum: dec!(5),
            })
        );
    }

    // ==================== Confidence Tests ====================

    #[test]
    fn test_low_confidence_rejected_by_default() {
        let (risk, _) = manager(RiskLimits::default());
        let mut opp = opportunity(dec!(50));
        opp.confidence = Confidence::Low;
        assert_eq!(
            risk.evaluate_at(&opp, now()),
            RiskDecision::Rejected(RejectReason::LowConfidence)
        );

        let (permissive, _) = manager(RiskLimits {
            allow_low_confidence: true,
            ..RiskLimits::default()
        });
        assert!(permissive.evaluate_at(&opp, now()).is_approved());
    }

    #[test]
    fn test_non_positive_edge_rejected() {
        let (risk, _) = manager(RiskLimits::default());
        let mut opp = opportunity(dec!(50));
        opp.edge_bps = Decimal::ZERO;
        assert!(matches!(
            risk.evaluate_at(&opp, now()),
            RiskDecision::Rejected(RejectReason::NonPositiveEdge { .. })
        ));
    }

    // ==================== Loss Streak Tests ====================

    #[test]
    fn test_consecutive_losses_pause_then_resume() {
        let (risk, _) = manager(RiskLimits::default());
        for _ in 0..3 {
            risk.record_outcome_at(AttemptOutcome::OneSided, dec!(-1), now());
        }
        assert!(matches!(
            risk.evaluate_at(&opportunity(dec!(50)), now()),
            RiskDecision::Rejected(RejectReason::ConsecutiveLosses { losses: 3, .. })
        ));

        let later = now() + chrono::Duration::seconds(301);
        assert!(risk.evaluate_at(&opportunity(dec!(50)), later).is_approved());
        assert_eq!(risk.consecutive_losses(), 0);
    }

    #[test]
    fn test_win_resets_streak_and_failures_are_neutral() {
        let (risk, _) = manager(RiskLimits::default());
        risk.record_outcome_at(AttemptOutcome::OneSided, dec!(-1), now());
        risk.record_outcome_at(AttemptOutcome::BothFailed, Decimal::ZERO, now());
        assert_eq!(risk.consecutive_losses(), 1);
        risk.record_outcome_at(AttemptOutcome::BothFilled, dec!(2), now());
        assert_eq!(risk.consecutive_losses(), 0);
        assert_eq!(risk.daily_pnl(), dec!(1));
    }

    #[test]
    fn test_reset_clears_state() {
        let (risk, _) = manager(RiskLimits::default());
        risk.trip_kill_switch("manual");
        risk.evaluate_at(&opportunity(dec!(50)), now());
        risk.reset();
        let snapshot = risk.snapshot();
        assert!(!snapshot.kill_switch_active);
        assert_eq!(snapshot.rejections, 0);
    }
}
