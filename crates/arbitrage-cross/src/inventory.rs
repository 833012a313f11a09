//! Position ledger per event and venue.
//!
//! [`InventoryTracker`] is the only writer of position state. Fills for one
//! event are serialized by a per-event mutex, and each
//! `(attempt_id, venue, fill_seq)` triple is applied at most once so duplicate
//! fill notifications are harmless.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use xarb_core::Venue;

// =============================================================================
// Records
// =============================================================================

/// A confirmed fill for one leg of an execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub attempt_id: Uuid,
    pub event_id: String,
    pub venue: Venue,
    /// Positive for bought YES contracts, negative for sold.
    pub signed_size: Decimal,
    pub price: Decimal,
    /// 0 for the fills booked when the attempt resolves; fills reported
    /// after resolution count up from 1.
    #[serde(default)]
    pub fill_seq: u32,
}

/// Open position on one venue for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub event_id: String,
    pub venue: Venue,
    pub signed_size: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Capital at risk: `size * price` long, `size * (1 - price)` short.
    #[must_use]
    pub fn capital_at_risk(&self) -> Decimal {
        if self.signed_size >= Decimal::ZERO {
            self.signed_size * self.avg_price
        } else {
            self.signed_size.abs() * (Decimal::ONE - self.avg_price)
        }
    }
}

/// Aggregate exposure of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetPosition {
    pub event_id: String,
    /// Algebraic sum of signed sizes across both venues.
    pub net_position: Decimal,
    pub positions: Vec<Position>,
    /// Capital at risk across open positions.
    pub gross_exposure: Decimal,
    /// Capital reserved by attempts that have not resolved.
    pub in_flight_notional: Decimal,
    pub open_attempts: usize,
    pub realized_pnl: Decimal,
}

impl NetPosition {
    fn empty(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            net_position: Decimal::ZERO,
            positions: Vec::new(),
            gross_exposure: Decimal::ZERO,
            in_flight_notional: Decimal::ZERO,
            open_attempts: 0,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Size held on one venue.
    #[must_use]
    pub fn venue_size(&self, venue: Venue) -> Decimal {
        self.positions
            .iter()
            .find(|p| p.venue == venue)
            .map_or(Decimal::ZERO, |p| p.signed_size)
    }

    /// Gross exposure plus in-flight reservations.
    #[must_use]
    pub fn committed_exposure(&self) -> Decimal {
        self.gross_exposure + self.in_flight_notional
    }
}

/// What happened to a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Booked; carries P&L realized by any reduction.
    Applied { realized_pnl: Decimal },
    /// Already booked for this attempt, venue and sequence.
    Duplicate,
}

// =============================================================================
// Event Ledger
// =============================================================================

#[derive(Debug, Default)]
struct EventLedger {
    positions: HashMap<Venue, Position>,
    applied: HashSet<(Uuid, Venue, u32)>,
    in_flight: HashMap<Uuid, Decimal>,
    realized_pnl: Decimal,
}

impl EventLedger {
    fn apply(&mut self, fill: &FillRecord, at: DateTime<Utc>) -> Decimal {
        let position = self.positions.entry(fill.venue).or_insert_with(|| Position {
            event_id: fill.event_id.clone(),
            venue: fill.venue,
            signed_size: Decimal::ZERO,
            avg_price: fill.price,
            realized_pnl: Decimal::ZERO,
            updated_at: at,
        });
        position.updated_at = at;

        let current = position.signed_size;
        let incoming = fill.signed_size;
        let mut realized = Decimal::ZERO;

        if current.is_zero() {
            // Opening
            position.signed_size = incoming;
            position.avg_price = fill.price;
        } else if current.is_sign_positive() == incoming.is_sign_positive() {
            // Adding on the same side
            let total_cost = position.avg_price * current.abs() + fill.price * incoming.abs();
            position.signed_size += incoming;
            position.avg_price = total_cost / position.signed_size.abs();
        } else {
            // Reducing, possibly flipping
            let closed = incoming.abs().min(current.abs());
            realized = if current > Decimal::ZERO {
                (fill.price - position.avg_price) * closed
            } else {
                (position.avg_price - fill.price) * closed
            };
            position.signed_size += incoming;
            if incoming.abs() > closed {
                position.avg_price = fill.price;
            }
        }

        position.realized_pnl += realized;
        self.realized_pnl += realized;
        realized
    }

    fn prune(&mut self) {
        if self.in_flight.is_empty() {
            self.positions.retain(|_, p| !p.signed_size.is_zero());
        }
    }

    fn net(&self, event_id: &str) -> NetPosition {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.venue);
        NetPosition {
            event_id: event_id.to_string(),
            net_position: positions.iter().map(|p| p.signed_size).sum(),
            gross_exposure: positions.iter().map(Position::capital_at_risk).sum(),
            in_flight_notional: self.in_flight.values().copied().sum(),
            open_attempts: self.in_flight.len(),
            realized_pnl: self.realized_pnl,
            positions,
        }
    }
}

// =============================================================================
// Inventory Tracker
// =============================================================================

/// Single writer of position state.
#[derive(Debug, Default)]
pub struct InventoryTracker {
    ledgers: RwLock<HashMap<String, Arc<Mutex<EventLedger>>>>,
}

impl InventoryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, event_id: &str) -> Arc<Mutex<EventLedger>> {
        if let Some(ledger) = self.ledgers.read().get(event_id) {
            return Arc::clone(ledger);
        }
        Arc::clone(self.ledgers.write().entry(event_id.to_string()).or_default())
    }

    /// Books a fill. Idempotent per `(attempt_id, venue, fill_seq)`.
    pub fn record_fill(&self, fill: &FillRecord) -> FillOutcome {
        if fill.signed_size.is_zero() {
            return FillOutcome::Applied {
                realized_pnl: Decimal::ZERO,
            };
        }

        let ledger = self.ledger(&fill.event_id);
        let mut ledger = ledger.lock();
        if !ledger
            .applied
            .insert((fill.attempt_id, fill.venue, fill.fill_seq))
        {
            debug!(
                attempt_id = %fill.attempt_id,
                venue = %fill.venue,
                fill_seq = fill.fill_seq,
                "Duplicate fill ignored"
            );
            return FillOutcome::Duplicate;
        }

        let realized_pnl = ledger.apply(fill, Utc::now());
        ledger.prune();
        let net = ledger.net(&fill.event_id).net_position;
        drop(ledger);

        info!(
            event_id = %fill.event_id,
            venue = %fill.venue,
            signed_size = %fill.signed_size,
            price = %fill.price,
            net_position = %net,
            "Fill recorded"
        );
        FillOutcome::Applied { realized_pnl }
    }

    /// Reserves capital for an attempt that has not resolved yet.
    pub fn begin_attempt(&self, event_id: &str, attempt_id: Uuid, notional: Decimal) {
        self.ledger(event_id)
            .lock()
            .in_flight
            .insert(attempt_id, notional);
    }

    /// Releases an attempt's reservation.
    pub fn end_attempt(&self, event_id: &str, attempt_id: Uuid) {
        let ledger = self.ledger(event_id);
        let mut ledger = ledger.lock();
        ledger.in_flight.remove(&attempt_id);
        ledger.prune();
    }

    /// Current exposure for one event. Unknown events report zero.
    #[must_use]
    pub fn get_exposure(&self, event_id: &str) -> NetPosition {
        let ledger = self.ledgers.read().get(event_id).map(Arc::clone);
        match ledger {
            Some(ledger) => ledger.lock().net(event_id),
            None => NetPosition::empty(event_id),
        }
    }

    /// Exposure of every event that has positions or open attempts.
    #[must_use]
    pub fn all_exposures(&self) -> Vec<NetPosition> {
        let ledgers: Vec<(String, Arc<Mutex<EventLedger>>)> = self
            .ledgers
            .read()
            .iter()
            .map(|(id, l)| (id.clone(), Arc::clone(l)))
            .collect();
        let mut out: Vec<NetPosition> = ledgers
            .into_iter()
            .map(|(id, ledger)| ledger.lock().net(&id))
            .filter(|n| !n.positions.is_empty() || n.open_attempts > 0)
            .collect();
        out.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        out
    }

    /// Every non-zero position.
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        self.all_exposures()
            .into_iter()
            .flat_map(|n| n.positions)
            .filter(|p| !p.signed_size.is_zero())
            .collect()
    }

    /// Capital committed across all events, including in-flight reservations.
    #[must_use]
    pub fn portfolio_exposure(&self) -> Decimal {
        self.all_exposures()
            .iter()
            .map(NetPosition::committed_exposure)
            .sum()
    }

    /// Realized P&L across all events.
    #[must_use]
    pub fn realized_pnl(&self) -> Decimal {
        let ledgers: Vec<Arc<Mutex<EventLedger>>> =
            self.ledgers.read().values().map(Arc::clone).collect();
        ledgers.iter().map(|l| l.lock().realized_pnl).sum()
    }

    /// Drops all state.
    pub fn reset(&self) {
        self.ledgers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(attempt: Uuid, venue: Venue, size: Decimal, price: Decimal) -> FillRecord {
        FillRecord {
            attempt_id: attempt,
            event_id: "evt".to_string(),
            venue,
            signed_size: size,
            price,
            fill_seq: 0,
        }
    }

    // ==================== Net Position Tests ====================

    #[test]
    fn test_hedged_attempt_nets_to_zero() {
        let tracker = InventoryTracker::new();
        let attempt = Uuid::new_v4();
        tracker.record_fill(&fill(attempt, Venue::Kalshi, dec!(50), dec!(0.46)));
        tracker.record_fill(&fill(attempt, Venue::Polymarket, dec!(-50), dec!(0.51)));

        let net = tracker.get_exposure("evt");
        assert_eq!(net.net_position, Decimal::ZERO);
        assert_eq!(net.venue_size(Venue::Kalshi), dec!(50));
        assert_eq!(net.venue_size(Venue::Polymarket), dec!(-50));
        // 50 * 0.46 + 50 * 0.49
        assert_eq!(net.gross_exposure, dec!(47.5));
    }

    #[test]
    fn test_net_position_is_order_independent() {
        let fills: Vec<FillRecord> = (0..6)
            .map(|i| {
                let venue = if i % 2 == 0 { Venue::Kalshi } else { Venue::Polymarket };
                let size = Decimal::from(i * 7 - 15);
                fill(Uuid::new_v4(), venue, size, dec!(0.40) + Decimal::new(i, 2))
            })
            .collect();
        let expected: Decimal = fills.iter().map(|f| f.signed_size).sum();

        let forward = InventoryTracker::new();
        for f in &fills {
            forward.record_fill(f);
        }
        let backward = InventoryTracker::new();
        for f in fills.iter().rev() {
            backward.record_fill(f);
            // Duplicate delivery
            backward.record_fill(f);
        }

        assert_eq!(forward.get_exposure("evt").net_position, expected);
        assert_eq!(backward.get_exposure("evt").net_position, expected);
    }

    #[test]
    fn test_duplicate_fill_is_ignored() {
        let tracker = InventoryTracker::new();
        let attempt = Uuid::new_v4();
        let f = fill(attempt, Venue::Kalshi, dec!(10), dec!(0.30));
        assert!(matches!(tracker.record_fill(&f), FillOutcome::Applied { .. }));
        assert_eq!(tracker.record_fill(&f), FillOutcome::Duplicate);
        assert_eq!(tracker.get_exposure("evt").net_position, dec!(10));
    }

    #[test]
    fn test_later_fill_sequence_on_same_leg_is_booked() {
        let tracker = InventoryTracker::new();
        let attempt = Uuid::new_v4();
        tracker.record_fill(&fill(attempt, Venue::Kalshi, dec!(30), dec!(0.44)));

        let late = FillRecord {
            fill_seq: 1,
            ..fill(attempt, Venue::Kalshi, dec!(20), dec!(0.44))
        };
        assert!(matches!(tracker.record_fill(&late), FillOutcome::Applied { .. }));
        assert_eq!(tracker.record_fill(&late), FillOutcome::Duplicate);
        assert_eq!(tracker.get_exposure("evt").venue_size(Venue::Kalshi), dec!(50));
    }

    // ==================== P&L Tests ====================

    #[test]
    fn test_reducing_fill_realizes_pnl() {
        let tracker = InventoryTracker::new();
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Kalshi, dec!(20), dec!(0.40)));
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Kalshi, dec!(20), dec!(0.50)));
        let net = tracker.get_exposure("evt");
        assert_eq!(net.positions[0].avg_price, dec!(0.45));

        let outcome =
            tracker.record_fill(&fill(Uuid::new_v4(), Venue::Kalshi, dec!(-10), dec!(0.55)));
        assert_eq!(
            outcome,
            FillOutcome::Applied {
                realized_pnl: dec!(1.0)
            }
        );
        assert_eq!(tracker.realized_pnl(), dec!(1.0));
    }

    #[test]
    fn test_flip_resets_average_price() {
        let tracker = InventoryTracker::new();
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Polymarket, dec!(-10), dec!(0.60)));
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Polymarket, dec!(15), dec!(0.50)));

        let net = tracker.get_exposure("evt");
        assert_eq!(net.net_position, dec!(5));
        assert_eq!(net.positions[0].avg_price, dec!(0.50));
        assert_eq!(net.realized_pnl, dec!(1.0));
    }

    // ==================== In-flight Tests ====================

    #[test]
    fn test_in_flight_reservation_and_pruning() {
        let tracker = InventoryTracker::new();
        let attempt = Uuid::new_v4();
        tracker.begin_attempt("evt", attempt, dec!(25));
        assert_eq!(tracker.get_exposure("evt").in_flight_notional, dec!(25));
        assert_eq!(tracker.portfolio_exposure(), dec!(25));

        tracker.record_fill(&fill(attempt, Venue::Kalshi, dec!(10), dec!(0.5)));
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Kalshi, dec!(-10), dec!(0.5)));
        // Flat but still held while the attempt is open
        assert_eq!(tracker.get_exposure("evt").positions.len(), 1);

        tracker.end_attempt("evt", attempt);
        let net = tracker.get_exposure("evt");
        assert!(net.positions.is_empty());
        assert_eq!(net.open_attempts, 0);
        assert!(tracker.open_positions().is_empty());
    }

    #[test]
    fn test_concurrent_fills_on_one_event() {
        let tracker = Arc::new(InventoryTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let venue = if i % 2 == 0 { Venue::Kalshi } else { Venue::Polymarket };
                        tracker.record_fill(&fill(Uuid::new_v4(), venue, dec!(1), dec!(0.5)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.get_exposure("evt").net_position, dec!(400));
    }

    #[test]
    fn test_reset() {
        let tracker = InventoryTracker::new();
        tracker.record_fill(&fill(Uuid::new_v4(), Venue::Kalshi, dec!(3), dec!(0.2)));
        tracker.reset();
        assert_eq!(tracker.get_exposure("evt").net_position, Decimal::ZERO);
        assert!(tracker.all_exposures().is_empty());
    }
}
