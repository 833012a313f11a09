//! Outbound order interface and inbound fill routing.
//!
//! Transports implement [`VenueGateway`] for placing and cancelling orders and
//! push fill notifications into a shared [`FillRouter`] via
//! [`FillRouter::on_fill`]. Executors subscribe to the fills of the orders they
//! placed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Weak;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use xarb_core::{Side, Venue};

// =============================================================================
// Orders
// =============================================================================

/// Venue-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef(pub String);

impl OrderRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill-and-kill: take what is available at the limit, cancel the rest.
    Fak,
    /// Good-till-cancelled: rest in the book.
    Gtc,
}

/// An order to send to a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub venue: Venue,
    pub instrument_id: String,
    pub side: Side,
    /// Limit price.
    pub price: Decimal,
    /// Contracts.
    pub size: Decimal,
    pub order_type: OrderType,
}

impl OrderRequest {
    /// An aggressive fill-and-kill order.
    pub fn taker(
        venue: Venue,
        instrument_id: impl Into<String>,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            venue,
            instrument_id: instrument_id.into(),
            side,
            price,
            size,
            order_type: OrderType::Fak,
        }
    }

    /// A passive resting order.
    pub fn maker(
        venue: Venue,
        instrument_id: impl Into<String>,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            venue,
            instrument_id: instrument_id.into(),
            side,
            price,
            size,
            order_type: OrderType::Gtc,
        }
    }
}

/// Order placement and cancellation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    /// The venue refused the order.
    #[error("{venue} rejected order: {reason}")]
    Rejected {
        /// Venue that rejected.
        venue: Venue,
        /// Venue-supplied reason.
        reason: String,
    },

    /// No acknowledgment within the RPC timeout.
    #[error("{venue} {operation} timed out after {after_ms}ms")]
    Timeout {
        /// Venue that timed out.
        venue: Venue,
        /// `"place"` or `"cancel"`.
        operation: &'static str,
        /// Timeout applied.
        after_ms: u64,
    },

    /// Transport is down.
    #[error("{venue} unavailable: {message}")]
    Unavailable {
        /// Venue that is down.
        venue: Venue,
        /// Detail.
        message: String,
    },
}

/// Order placement and cancellation on the trading venues.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Submits an order and returns the venue's reference once acknowledged.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef, VenueError>;

    /// Cancels an order. `Ok(false)` means there was nothing left to cancel.
    async fn cancel_order(&self, venue: Venue, order_ref: &OrderRef) -> Result<bool, VenueError>;
}

// =============================================================================
// Fill Routing
// =============================================================================

/// One (possibly partial) execution reported by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub order_ref: OrderRef,
    pub filled_size: Decimal,
    pub filled_price: Decimal,
    pub at: DateTime<Utc>,
}

/// Buffered fills older than this are dropped.
const PENDING_FILL_TTL_SECS: i64 = 60;

/// Resolved orders remembered for late-fill routing.
const CLOSED_ORDER_CAPACITY: usize = 4_096;

/// Ownership of an order whose attempt has resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedOrder {
    pub attempt_id: Uuid,
    pub event_id: String,
    pub venue: Venue,
    pub side: Side,
    /// Fills received after the order was closed, including the current one.
    pub late_fills: u32,
}

/// Receives fills for orders that were already closed.
pub trait LateFillHandler: Send + Sync {
    fn on_late_fill(&self, order: &ClosedOrder, report: &FillReport);
}

#[derive(Debug, Default)]
struct ClosedOrders {
    orders: HashMap<OrderRef, ClosedOrder>,
    arrival: VecDeque<OrderRef>,
}

impl ClosedOrders {
    fn insert(&mut self, order_ref: OrderRef, order: ClosedOrder) {
        if self.orders.insert(order_ref.clone(), order).is_none() {
            self.arrival.push_back(order_ref);
        }
        while self.arrival.len() > CLOSED_ORDER_CAPACITY {
            if let Some(oldest) = self.arrival.pop_front() {
                self.orders.remove(&oldest);
            }
        }
    }
}

/// Routes inbound fill notifications to the task waiting on each order.
///
/// Fills for orders nobody has subscribed to yet are buffered for a short
/// while and delivered on subscription, which covers a fill racing the
/// placement acknowledgment. Fills for orders that have been closed with
/// [`FillRouter::close`] go to the registered [`LateFillHandler`].
#[derive(Debug, Default)]
pub struct FillRouter {
    subscribers: Mutex<HashMap<OrderRef, mpsc::UnboundedSender<FillReport>>>,
    closed: Mutex<ClosedOrders>,
    pending: Mutex<HashMap<OrderRef, Vec<FillReport>>>,
    late_handler: RwLock<Option<Weak<dyn LateFillHandler>>>,
}

impl FillRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the receiver of late fills. Only a weak reference is kept.
    pub fn set_late_fill_handler(&self, handler: Weak<dyn LateFillHandler>) {
        *self.late_handler.write() = Some(handler);
    }

    /// Inbound callback for venue fill notifications.
    pub fn on_fill(&self, order_ref: OrderRef, filled_size: Decimal, filled_price: Decimal) {
        let report = FillReport {
            order_ref: order_ref.clone(),
            filled_size,
            filled_price,
            at: Utc::now(),
        };

        // Lock order: subscribers, closed, pending (same as `close`).
        let late = {
            let subscribers = self.subscribers.lock();
            if let Some(tx) = subscribers.get(&order_ref) {
                if tx.send(report.clone()).is_ok() {
                    return;
                }
            }
            let mut closed = self.closed.lock();
            let late = match closed.orders.get_mut(&order_ref) {
                Some(order) => {
                    order.late_fills += 1;
                    order.clone()
                }
                None => {
                    trace!(%order_ref, "Buffering fill for unsubscribed order");
                    self.buffer(report);
                    return;
                }
            };
            late
        };

        let handler = self.late_handler.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_late_fill(&late, &report),
            None => {
                warn!(%order_ref, "Late fill with no handler registered, buffering");
                self.buffer(report);
            }
        }
    }

    fn buffer(&self, report: FillReport) {
        let mut pending = self.pending.lock();
        let cutoff = report.at - chrono::Duration::seconds(PENDING_FILL_TTL_SECS);
        pending.retain(|_, reports| {
            reports.retain(|r| r.at > cutoff);
            !reports.is_empty()
        });
        pending
            .entry(report.order_ref.clone())
            .or_default()
            .push(report);
    }

    /// Starts receiving fills for `order_ref`, including any already buffered.
    pub fn subscribe(&self, order_ref: &OrderRef) -> mpsc::UnboundedReceiver<FillReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        if let Some(buffered) = self.pending.lock().remove(order_ref) {
            for report in buffered {
                let _ = tx.send(report);
            }
        }
        subscribers.insert(order_ref.clone(), tx);
        rx
    }

    /// Stops routing fills for `order_ref`. Later fills are buffered again.
    pub fn unsubscribe(&self, order_ref: &OrderRef) {
        self.subscribers.lock().remove(order_ref);
    }

    /// Ends the subscription and hands later fills for `order_ref` to the
    /// late-fill handler.
    ///
    /// Returns fills buffered for the order that no subscriber received.
    /// Once this returns, every fill sent to the old subscription is already
    /// in its channel.
    pub fn close(&self, order_ref: &OrderRef, order: ClosedOrder) -> Vec<FillReport> {
        let mut subscribers = self.subscribers.lock();
        subscribers.remove(order_ref);
        self.closed.lock().insert(order_ref.clone(), order);
        self.pending.lock().remove(order_ref).unwrap_or_default()
    }

    /// Number of fills waiting for a subscriber.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Drops all buffered fills, subscriptions and closed orders.
    pub fn reset(&self) {
        self.subscribers.lock().clear();
        *self.closed.lock() = ClosedOrders::default();
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fill_before_subscribe_is_buffered() {
        let router = FillRouter::new();
        let order = OrderRef::new("o-1");
        router.on_fill(order.clone(), dec!(5), dec!(0.40));
        assert_eq!(router.pending_len(), 1);

        let mut rx = router.subscribe(&order);
        let report = rx.recv().await.unwrap();
        assert_eq!(report.filled_size, dec!(5));
        assert_eq!(router.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fills_route_to_subscriber() {
        let router = FillRouter::new();
        let order = OrderRef::new("o-2");
        let mut rx = router.subscribe(&order);

        router.on_fill(order.clone(), dec!(3), dec!(0.41));
        router.on_fill(order.clone(), dec!(2), dec!(0.42));
        router.on_fill(OrderRef::new("other"), dec!(1), dec!(0.5));

        assert_eq!(rx.recv().await.unwrap().filled_size, dec!(3));
        assert_eq!(rx.recv().await.unwrap().filled_price, dec!(0.42));
        assert_eq!(router.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_buffers_again() {
        let router = FillRouter::new();
        let order = OrderRef::new("o-3");
        let rx = router.subscribe(&order);
        router.unsubscribe(&order);
        drop(rx);

        router.on_fill(order, dec!(1), dec!(0.5));
        assert_eq!(router.pending_len(), 1);
        router.reset();
        assert_eq!(router.pending_len(), 0);
    }

    // ==================== Late Fill Tests ====================

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(ClosedOrder, FillReport)>>,
    }

    impl LateFillHandler for RecordingHandler {
        fn on_late_fill(&self, order: &ClosedOrder, report: &FillReport) {
            self.seen.lock().push((order.clone(), report.clone()));
        }
    }

    fn closed(venue: Venue) -> ClosedOrder {
        ClosedOrder {
            attempt_id: Uuid::new_v4(),
            event_id: "evt".to_string(),
            venue,
            side: Side::Buy,
            late_fills: 0,
        }
    }

    #[tokio::test]
    async fn test_fills_after_close_reach_late_handler() {
        let router = FillRouter::new();
        let handler = std::sync::Arc::new(RecordingHandler::default());
        let weak = std::sync::Arc::downgrade(&handler);
        router.set_late_fill_handler(weak);

        let order = OrderRef::new("o-4");
        let mut rx = router.subscribe(&order);
        router.on_fill(order.clone(), dec!(2), dec!(0.40));
        assert!(router.close(&order, closed(Venue::Kalshi)).is_empty());
        // Delivered before the close, still in the channel
        assert_eq!(rx.recv().await.unwrap().filled_size, dec!(2));

        router.on_fill(order.clone(), dec!(3), dec!(0.41));
        router.on_fill(order.clone(), dec!(1), dec!(0.42));

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.late_fills, 1);
        assert_eq!(seen[0].1.filled_size, dec!(3));
        assert_eq!(seen[1].0.late_fills, 2);
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn test_close_returns_unclaimed_buffered_fills() {
        let router = FillRouter::new();
        let order = OrderRef::new("o-5");
        router.on_fill(order.clone(), dec!(4), dec!(0.30));
        let buffered = router.close(&order, closed(Venue::Polymarket));
        assert_eq!(buffered.len(), 1);
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn test_buffered_fills_expire() {
        let router = FillRouter::new();
        router.buffer(FillReport {
            order_ref: OrderRef::new("stale"),
            filled_size: dec!(1),
            filled_price: dec!(0.5),
            at: Utc::now() - chrono::Duration::seconds(PENDING_FILL_TTL_SECS + 1),
        });
        assert_eq!(router.pending_len(), 1);

        router.on_fill(OrderRef::new("fresh"), dec!(1), dec!(0.5));
        assert_eq!(router.pending_len(), 1);
    }

    #[test]
    fn test_closed_orders_are_bounded() {
        let mut orders = ClosedOrders::default();
        for i in 0..CLOSED_ORDER_CAPACITY + 10 {
            orders.insert(OrderRef::new(format!("o-{i}")), closed(Venue::Kalshi));
        }
        assert_eq!(orders.orders.len(), CLOSED_ORDER_CAPACITY);
        assert!(!orders.orders.contains_key(&OrderRef::new("o-0")));
    }
}
