//! Simulated venues for paper trading and tests.
//!
//! [`PaperVenue`] implements [`VenueGateway`] for both venues with a
//! configurable fill policy per venue. Fills are delivered asynchronously
//! through the shared [`FillRouter`], the same path live transports use.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use xarb_core::{Venue, VenuePair};

use crate::venue::{FillRouter, OrderRef, OrderRequest, OrderType, VenueError, VenueGateway};

// =============================================================================
// Configuration
// =============================================================================

/// Fill simulation for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperFillPolicy {
    /// Probability that an aggressive order fills at all.
    pub taker_fill_rate: f64,

    /// Probability that a filled aggressive order fills only partially.
    pub partial_fill_rate: f64,

    /// Fraction filled when a partial fill occurs.
    pub partial_fill_fraction: f64,

    /// Probability that a resting order is eventually hit.
    pub maker_fill_rate: f64,

    /// Probability that the venue rejects the order outright.
    pub reject_rate: f64,

    /// Delay before an aggressive fill is reported.
    pub taker_fill_delay_ms: u64,

    /// Delay before a resting order is hit.
    pub maker_fill_delay_ms: u64,

    /// Delay before placement is acknowledged.
    pub ack_latency_ms: u64,
}

impl Default for PaperFillPolicy {
    fn default() -> Self {
        Self {
            taker_fill_rate: 0.85,
            partial_fill_rate: 0.10,
            partial_fill_fraction: 0.5,
            maker_fill_rate: 0.5,
            reject_rate: 0.0,
            taker_fill_delay_ms: 50,
            maker_fill_delay_ms: 2_000,
            ack_latency_ms: 20,
        }
    }
}

impl PaperFillPolicy {
    /// Every order fills in full.
    #[must_use]
    pub fn always_fill() -> Self {
        Self {
            taker_fill_rate: 1.0,
            partial_fill_rate: 0.0,
            maker_fill_rate: 1.0,
            ..Default::default()
        }
    }

    /// Orders are acknowledged but never fill.
    #[must_use]
    pub fn never_fill() -> Self {
        Self {
            taker_fill_rate: 0.0,
            maker_fill_rate: 0.0,
            ..Default::default()
        }
    }

    /// Every order is rejected.
    #[must_use]
    pub fn always_reject() -> Self {
        Self {
            reject_rate: 1.0,
            ..Default::default()
        }
    }

    /// Sets the maker fill delay.
    #[must_use]
    pub fn maker_delay_ms(mut self, ms: u64) -> Self {
        self.maker_fill_delay_ms = ms;
        self
    }

    /// Sets the acknowledgment latency.
    #[must_use]
    pub fn ack_latency_ms(mut self, ms: u64) -> Self {
        self.ack_latency_ms = ms;
        self
    }

    /// Makes every aggressive fill partial at `fraction`.
    #[must_use]
    pub fn partial(mut self, fraction: f64) -> Self {
        self.partial_fill_rate = 1.0;
        self.partial_fill_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    filled: Decimal,
    open: bool,
}

#[derive(Debug, Default)]
struct PaperState {
    orders: HashMap<OrderRef, PaperOrder>,
    placed: u32,
    rejected: u32,
    cancelled: u32,
}

// =============================================================================
// Paper Venue
// =============================================================================

/// Simulated Kalshi and Polymarket order entry.
pub struct PaperVenue {
    policies: VenuePair<PaperFillPolicy>,
    router: Arc<FillRouter>,
    state: Arc<Mutex<PaperState>>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for PaperVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperVenue")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl PaperVenue {
    /// Creates a paper venue delivering fills into `router`.
    #[must_use]
    pub fn new(policies: VenuePair<PaperFillPolicy>, router: Arc<FillRouter>) -> Self {
        Self {
            policies,
            router,
            state: Arc::new(Mutex::new(PaperState::default())),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Uses a fixed seed for reproducible runs.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Orders acknowledged so far.
    #[must_use]
    pub fn orders_placed(&self) -> u32 {
        self.state.lock().placed
    }

    /// Orders rejected so far.
    #[must_use]
    pub fn orders_rejected(&self) -> u32 {
        self.state.lock().rejected
    }

    /// Successful cancels so far.
    #[must_use]
    pub fn orders_cancelled(&self) -> u32 {
        self.state.lock().cancelled
    }

    /// Requests submitted, in no particular order.
    #[must_use]
    pub fn order_history(&self) -> Vec<OrderRequest> {
        self.state
            .lock()
            .orders
            .values()
            .map(|o| o.request.clone())
            .collect()
    }

    fn roll(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().gen_bool(probability)
    }

    fn schedule_fill(&self, order_ref: OrderRef, size: Decimal, price: Decimal, delay: Duration) {
        let state = Arc::clone(&self.state);
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let deliver = {
                let mut state = state.lock();
                match state.orders.get_mut(&order_ref) {
                    Some(order) if order.open => {
                        let size = size.min(order.request.size - order.filled);
                        order.filled += size;
                        if order.request.order_type == OrderType::Fak
                            || order.filled >= order.request.size
                        {
                            order.open = false;
                        }
                        Some(size)
                    }
                    _ => None,
                }
            };
            if let Some(size) = deliver.filter(|s| *s > Decimal::ZERO) {
                router.on_fill(order_ref, size, price);
            }
        });
    }
}

#[async_trait]
impl VenueGateway for PaperVenue {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef, VenueError> {
        let policy = self.policies.get(request.venue).clone();
        if policy.ack_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(policy.ack_latency_ms)).await;
        }

        if self.roll(policy.reject_rate) {
            self.state.lock().rejected += 1;
            return Err(VenueError::Rejected {
                venue: request.venue,
                reason: "paper venue rejection".to_string(),
            });
        }

        let order_ref = OrderRef::new(format!("paper-{}-{}", request.venue, Uuid::new_v4()));
        {
            let mut state = self.state.lock();
            state.placed += 1;
            state.orders.insert(
                order_ref.clone(),
                PaperOrder {
                    request: request.clone(),
                    filled: Decimal::ZERO,
                    open: true,
                },
            );
        }

        match request.order_type {
            OrderType::Fak => {
                if self.roll(policy.taker_fill_rate) {
                    let size = if self.roll(policy.partial_fill_rate) {
                        let fraction = Decimal::from_f64(policy.partial_fill_fraction)
                            .unwrap_or(Decimal::ZERO);
                        (request.size * fraction).trunc()
                    } else {
                        request.size
                    };
                    self.schedule_fill(
                        order_ref.clone(),
                        size,
                        request.price,
                        Duration::from_millis(policy.taker_fill_delay_ms),
                    );
                } else {
                    // Killed with nothing filled
                    if let Some(order) = self.state.lock().orders.get_mut(&order_ref) {
                        order.open = false;
                    }
                }
            }
            OrderType::Gtc => {
                if self.roll(policy.maker_fill_rate) {
                    self.schedule_fill(
                        order_ref.clone(),
                        request.size,
                        request.price,
                        Duration::from_millis(policy.maker_fill_delay_ms),
                    );
                }
            }
        }

        debug!(
            venue = %request.venue,
            instrument = %request.instrument_id,
            side = %request.side,
            price = %request.price,
            size = %request.size,
            order_type = ?request.order_type,
            %order_ref,
            "Paper order placed"
        );
        Ok(order_ref)
    }

    async fn cancel_order(&self, venue: Venue, order_ref: &OrderRef) -> Result<bool, VenueError> {
        let latency = self.policies.get(venue).ack_latency_ms;
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let mut state = self.state.lock();
        match state.orders.get_mut(order_ref) {
            Some(order) if order.open => {
                order.open = false;
                state.cancelled += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(VenueError::Rejected {
                venue,
                reason: format!("unknown order {order_ref}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use xarb_core::Side;

    fn venue(policy: PaperFillPolicy) -> (PaperVenue, Arc<FillRouter>) {
        let router = Arc::new(FillRouter::new());
        (
            PaperVenue::new(VenuePair::splat(policy), Arc::clone(&router)).with_seed(7),
            router,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_taker_order_fills_in_full() {
        let (paper, router) = venue(PaperFillPolicy::always_fill());
        let request = OrderRequest::taker(Venue::Kalshi, "KX", Side::Buy, dec!(0.46), dec!(10));
        let order_ref = paper.place_order(&request).await.unwrap();
        let mut rx = router.subscribe(&order_ref);

        let fill = rx.recv().await.unwrap();
        assert_eq!(fill.filled_size, dec!(10));
        assert_eq!(fill.filled_price, dec!(0.46));
        assert!(!paper.cancel_order(Venue::Kalshi, &order_ref).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_taker_fill() {
        let (paper, router) = venue(PaperFillPolicy::always_fill().partial(0.5));
        let request = OrderRequest::taker(Venue::Polymarket, "0x", Side::Sell, dec!(0.51), dec!(9));
        let order_ref = paper.place_order(&request).await.unwrap();
        let mut rx = router.subscribe(&order_ref);
        assert_eq!(rx.recv().await.unwrap().filled_size, dec!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_maker_never_fills() {
        let (paper, router) = venue(PaperFillPolicy::always_fill().maker_delay_ms(5_000));
        let request = OrderRequest::maker(Venue::Kalshi, "KX", Side::Buy, dec!(0.45), dec!(10));
        let order_ref = paper.place_order(&request).await.unwrap();
        assert!(paper.cancel_order(Venue::Kalshi, &order_ref).await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(router.pending_len(), 0);
        assert_eq!(paper.orders_cancelled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_venue() {
        let (paper, _) = venue(PaperFillPolicy::always_reject());
        let request = OrderRequest::taker(Venue::Kalshi, "KX", Side::Buy, dec!(0.46), dec!(10));
        assert!(matches!(
            paper.place_order(&request).await,
            Err(VenueError::Rejected { .. })
        ));
        assert_eq!(paper.orders_rejected(), 1);
    }
}
