//! Cross-venue arbitrage opportunity detection.
//!
//! For each canonical event the detector reads both venues' books once,
//! walks the buy venue's asks and the sell venue's bids for the candidate
//! size, trims both legs to the common fillable size and scores the
//! direction by its edge after slippage and fees. Both directions are tried
//! and the better one is returned.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};
use uuid::Uuid;

use xarb_core::{CanonicalEvent, DetectorConfig, EventTable, Side, Venue, VenuePair};

use crate::depth::{walk_book, ExecutableQuote, BPS};
use crate::fees::FeeSchedule;
use crate::orderbook::{BookView, OrderbookManager};
use crate::race::RaceModel;

// =============================================================================
// Opportunity
// =============================================================================

/// How much to trust that both legs will fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// One leg of an opportunity, priced against the book seen at detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegQuote {
    pub venue: Venue,
    pub instrument_id: String,
    /// Direction of the aggressive order on this venue.
    pub side: Side,
    /// Walk-the-book quote at the opportunity size.
    pub quote: ExecutableQuote,
    /// Age of the book when the quote was taken.
    pub book_age_ms: i64,
    /// Top of the passive side, where a maker order on this leg would rest.
    pub passive_price: Option<Decimal>,
    /// Contracts already resting at `passive_price`.
    pub passive_queue_ahead: Decimal,
    /// Race probability for a maker order at the passive top level.
    pub passive_fill_probability: f64,
}

impl LegQuote {
    /// Race probability for the aggressive order.
    #[must_use]
    pub fn fill_probability(&self) -> f64 {
        self.quote.fill_probability
    }
}

/// In-flight dedup key: one attempt per event and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpportunityKey {
    pub event_id: String,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
}

impl std::fmt::Display for OpportunityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}->{}", self.event_id, self.buy_venue, self.sell_venue)
    }
}

/// A detected, executable cross-venue opportunity.
///
/// Buys YES on `buy_venue` and sells YES on `sell_venue`; selling YES is
/// economically the same as buying the complementary NO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbOpportunity {
    pub id: Uuid,
    pub event_id: String,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
    pub buy_leg: LegQuote,
    pub sell_leg: LegQuote,
    /// Common size both books can fill inside the slippage bound.
    pub executable_size: Decimal,
    /// Executable size scaled by both legs' fill probabilities, in whole contracts.
    pub recommended_size: Decimal,
    /// `(sell_vwap - buy_vwap)` in bps.
    pub gross_edge_bps: Decimal,
    /// Combined fees per contract, in dollars.
    pub fee_per_contract: Decimal,
    /// Gross edge less fees, in bps.
    pub edge_bps: Decimal,
    pub confidence: Confidence,
    pub detected_at: DateTime<Utc>,
}

impl ArbOpportunity {
    #[must_use]
    pub fn key(&self) -> OpportunityKey {
        OpportunityKey {
            event_id: self.event_id.clone(),
            buy_venue: self.buy_venue,
            sell_venue: self.sell_venue,
        }
    }

    /// Capital tied up per hedged contract: the YES cost on the buy venue
    /// plus the short's `1 - price` on the sell venue.
    #[must_use]
    pub fn capital_per_contract(&self) -> Decimal {
        self.buy_leg.quote.vwap_price + (Decimal::ONE - self.sell_leg.quote.vwap_price)
    }

    /// Expected profit in dollars for `size` contracts at the net edge.
    #[must_use]
    pub fn expected_profit(&self, size: Decimal) -> Decimal {
        size * self.edge_bps / BPS
    }

    /// The leg on `venue`.
    #[must_use]
    pub fn leg(&self, venue: Venue) -> &LegQuote {
        if venue == self.buy_venue {
            &self.buy_leg
        } else {
            &self.sell_leg
        }
    }
}

/// Why an event produced no opportunity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoOpportunity {
    #[error("event {0} is not in the event table")]
    UnknownEvent(String),

    #[error("no book for {venue}")]
    MissingBook {
        /// Venue without a published book.
        venue: Venue,
    },

    #[error("{venue} book is {staleness_ms}ms old")]
    StaleBook {
        /// Venue with the stale book.
        venue: Venue,
        /// Age at evaluation.
        staleness_ms: i64,
    },

    #[error("{venue} book invalidated by a crossed update")]
    InvalidatedBook {
        /// Venue awaiting resync.
        venue: Venue,
    },

    #[error("no executable depth in either direction")]
    NoDepth,

    #[error("best edge {best_edge_bps}bps below threshold")]
    BelowThreshold {
        /// Best net edge across both directions.
        best_edge_bps: Decimal,
    },

    #[error("recommended size rounds to zero")]
    InsufficientSize,
}

/// Result of one scan over the event table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub evaluated: usize,
    pub opportunities: Vec<ArbOpportunity>,
    /// Events skipped for missing, stale or invalidated books.
    pub unusable_books: usize,
    pub no_depth: usize,
    pub below_threshold: usize,
}

// =============================================================================
// Detector
// =============================================================================

/// Reconciles both venues' books for each event and scores opportunities.
#[derive(Debug)]
pub struct ArbDetector {
    books: Arc<OrderbookManager>,
    race: Arc<RaceModel>,
    fees: FeeSchedule,
    events: EventTable,
    config: DetectorConfig,
    recent: Mutex<VecDeque<ArbOpportunity>>,
}

impl ArbDetector {
    /// Creates a detector over shared books and race model.
    #[must_use]
    pub fn new(
        books: Arc<OrderbookManager>,
        race: Arc<RaceModel>,
        fees: FeeSchedule,
        events: EventTable,
        config: DetectorConfig,
    ) -> Self {
        Self {
            books,
            race,
            fees,
            events,
            config,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &EventTable {
        &self.events
    }

    /// Best opportunity for an event right now, if any.
    #[must_use]
    pub fn detect(&self, event_id: &str) -> Option<ArbOpportunity> {
        self.evaluate(event_id, Utc::now()).ok()
    }

    /// Evaluates an event at `now`, returning the opportunity or the reason
    /// there is none.
    ///
    /// # Errors
    ///
    /// Returns [`NoOpportunity`] describing the first blocking condition.
    pub fn evaluate(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ArbOpportunity, NoOpportunity> {
        let event = self
            .events
            .get(event_id)
            .ok_or_else(|| NoOpportunity::UnknownEvent(event_id.to_string()))?;

        let books = VenuePair::new(
            self.usable_book(event, Venue::Kalshi, now)?,
            self.usable_book(event, Venue::Polymarket, now)?,
        );

        let mut best: Option<ArbOpportunity> = None;
        for buy_venue in Venue::ALL {
            let Some(candidate) = self.price_direction(event, &books, buy_venue, now) else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |b| candidate.edge_bps > b.edge_bps)
            {
                best = Some(candidate);
            }
        }

        let opportunity = best.ok_or(NoOpportunity::NoDepth)?;
        if opportunity.edge_bps < self.config.min_edge_bps {
            debug!(
                event_id,
                buy_venue = %opportunity.buy_venue,
                edge_bps = %opportunity.edge_bps.round_dp(1),
                min_edge_bps = %self.config.min_edge_bps,
                "Edge below threshold"
            );
            return Err(NoOpportunity::BelowThreshold {
                best_edge_bps: opportunity.edge_bps,
            });
        }
        if opportunity.recommended_size.is_zero() {
            return Err(NoOpportunity::InsufficientSize);
        }

        info!(
            event_id,
            buy_venue = %opportunity.buy_venue,
            sell_venue = %opportunity.sell_venue,
            buy_vwap = %opportunity.buy_leg.quote.vwap_price,
            sell_vwap = %opportunity.sell_leg.quote.vwap_price,
            gross_edge_bps = %opportunity.gross_edge_bps.round_dp(1),
            edge_bps = %opportunity.edge_bps.round_dp(1),
            executable_size = %opportunity.executable_size,
            recommended_size = %opportunity.recommended_size,
            confidence = %opportunity.confidence,
            "Cross-venue arbitrage opportunity detected"
        );

        self.remember(&opportunity);
        Ok(opportunity)
    }

    /// Evaluates every event in the table.
    #[must_use]
    pub fn scan_all(&self, now: DateTime<Utc>) -> DetectionSummary {
        let mut summary = DetectionSummary::default();
        for event in self.events.iter() {
            summary.evaluated += 1;
            match self.evaluate(&event.event_id, now) {
                Ok(opportunity) => summary.opportunities.push(opportunity),
                Err(
                    NoOpportunity::MissingBook { .. }
                    | NoOpportunity::StaleBook { .. }
                    | NoOpportunity::InvalidatedBook { .. },
                ) => summary.unusable_books += 1,
                Err(NoOpportunity::NoDepth | NoOpportunity::InsufficientSize) => {
                    summary.no_depth += 1;
                }
                Err(NoOpportunity::BelowThreshold { .. }) => summary.below_threshold += 1,
                Err(NoOpportunity::UnknownEvent(_)) => {}
            }
        }
        summary
            .opportunities
            .sort_by(|a, b| b.edge_bps.cmp(&a.edge_bps));
        summary
    }

    /// Most recently detected opportunities, newest last.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ArbOpportunity> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Clears the opportunity history.
    pub fn reset(&self) {
        self.recent.lock().clear();
    }

    fn remember(&self, opportunity: &ArbOpportunity) {
        let capacity = self.config.opportunity_history.max(1);
        let mut recent = self.recent.lock();
        while recent.len() >= capacity {
            recent.pop_front();
        }
        recent.push_back(opportunity.clone());
    }

    fn usable_book(
        &self,
        event: &CanonicalEvent,
        venue: Venue,
        now: DateTime<Utc>,
    ) -> Result<BookView, NoOpportunity> {
        let instrument = event.instrument(venue);
        let view = self
            .books
            .get_book_at(venue, instrument, now)
            .ok_or(NoOpportunity::MissingBook { venue })?;
        if view.invalidated {
            trace!(event_id = %event.event_id, %venue, "Book invalidated, skipping");
            return Err(NoOpportunity::InvalidatedBook { venue });
        }
        if !view.is_usable(self.config.max_staleness_ms) {
            trace!(
                event_id = %event.event_id,
                %venue,
                staleness_ms = view.staleness_ms(),
                "Book stale, skipping"
            );
            return Err(NoOpportunity::StaleBook {
                venue,
                staleness_ms: view.staleness_ms(),
            });
        }
        Ok(view)
    }

    /// Prices buy-on-`buy_venue`, sell-on-the-other.
    fn price_direction(
        &self,
        event: &CanonicalEvent,
        books: &VenuePair<BookView>,
        buy_venue: Venue,
        now: DateTime<Utc>,
    ) -> Option<ArbOpportunity> {
        let sell_venue = buy_venue.other();
        let buy_book = books.get(buy_venue);
        let sell_book = books.get(sell_venue);
        let slippage = self.config.max_slippage_bps;

        let buy_levels = buy_book.snapshot.levels_for(Side::Buy);
        let sell_levels = sell_book.snapshot.levels_for(Side::Sell);

        let buy = walk_book(buy_levels, Side::Buy, self.config.candidate_size, slippage);
        let sell = walk_book(sell_levels, Side::Sell, self.config.candidate_size, slippage);
        if buy.is_empty() || sell.is_empty() {
            return None;
        }

        // Re-walk both legs at the size both can fill
        let size = buy.max_size.min(sell.max_size);
        let buy = walk_book(buy_levels, Side::Buy, size, slippage);
        let sell = walk_book(sell_levels, Side::Sell, size, slippage);

        let buy_leg = self.leg_quote(event, buy_venue, buy_book, buy);
        let sell_leg = self.leg_quote(event, sell_venue, sell_book, sell);

        let p_buy = buy_leg.fill_probability();
        let p_sell = sell_leg.fill_probability();
        let recommended_size = Decimal::from_f64(p_buy * p_sell)
            .map_or(Decimal::ZERO, |p| (size * p).trunc());

        let gross_edge_bps = (sell_leg.quote.vwap_price - buy_leg.quote.vwap_price) * BPS;
        let fee_per_contract = self.fees.per_contract(
            buy_venue,
            buy_leg.quote.vwap_price,
            sell_venue,
            sell_leg.quote.vwap_price,
            size,
        );
        let edge_bps = gross_edge_bps - fee_per_contract * BPS;

        Some(ArbOpportunity {
            id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            buy_venue,
            sell_venue,
            buy_leg,
            sell_leg,
            executable_size: size,
            recommended_size,
            gross_edge_bps,
            fee_per_contract,
            edge_bps,
            confidence: self.confidence(p_buy.min(p_sell)),
            detected_at: now,
        })
    }

    fn leg_quote(
        &self,
        event: &CanonicalEvent,
        venue: Venue,
        book: &BookView,
        quote: ExecutableQuote,
    ) -> LegQuote {
        let age = book.staleness_ms();
        let probability = self
            .race
            .fill_probability(venue, age, quote.queue_level_index());
        let passive_top = book.snapshot.passive_levels(quote.side).first();

        LegQuote {
            venue,
            instrument_id: event.instrument(venue).to_string(),
            side: quote.side,
            quote: quote.with_fill_probability(probability),
            book_age_ms: age,
            passive_price: passive_top.map(|l| l.price),
            passive_queue_ahead: passive_top.map_or(Decimal::ZERO, |l| l.size),
            passive_fill_probability: self.race.fill_probability(venue, age, 0),
        }
    }

    fn confidence(&self, weakest_leg: f64) -> Confidence {
        if weakest_leg < self.config.min_fill_probability {
            Confidence::Low
        } else if weakest_leg >= self.config.high_confidence_probability {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use xarb_core::{OrderLevel, RaceParams};

    // ==================== Helper Functions ====================

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn events() -> EventTable {
        EventTable::new(vec![CanonicalEvent::new("fed-cut", "KXFED-CUT", "0xfedcut")])
    }

    /// Race model that always predicts certain fills.
    fn certain_race() -> Arc<RaceModel> {
        let params = RaceParams {
            base_probability: 1.0,
            half_life_ms: 1e12,
            queue_floor: 1.0,
            queue_scale: 1.0,
            floor_probability: 0.05,
        };
        Arc::new(RaceModel::new(VenuePair::splat(params)))
    }

    fn detector(books: Arc<OrderbookManager>, race: Arc<RaceModel>) -> ArbDetector {
        ArbDetector::new(
            books,
            race,
            FeeSchedule::zero(),
            events(),
            DetectorConfig::default().with_candidate_size(dec!(100)),
        )
    }

    fn level(price: Decimal, size: Decimal) -> OrderLevel {
        OrderLevel::new(price, size)
    }

    /// Kalshi asks at 0.46, Polymarket bids at 0.51, both 100 deep.
    fn seed_books(books: &OrderbookManager, at: DateTime<Utc>) {
        books
            .apply_snapshot(
                Venue::Kalshi,
                "KXFED-CUT",
                &[level(dec!(0.44), dec!(100))],
                &[level(dec!(0.46), dec!(100))],
                at,
            )
            .unwrap();
        books
            .apply_snapshot(
                Venue::Polymarket,
                "0xfedcut",
                &[level(dec!(0.51), dec!(100))],
                &[level(dec!(0.53), dec!(100))],
                at,
            )
            .unwrap();
    }

    // ==================== Detection Tests ====================

    #[test]
    fn test_five_hundred_bps_opportunity() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        let detector = detector(Arc::clone(&books), certain_race());

        let opp = detector.evaluate("fed-cut", now()).unwrap();
        assert_eq!(opp.buy_venue, Venue::Kalshi);
        assert_eq!(opp.sell_venue, Venue::Polymarket);
        assert_eq!(opp.gross_edge_bps, dec!(500));
        assert_eq!(opp.edge_bps, dec!(500));
        assert_eq!(opp.executable_size, dec!(100));
        assert_eq!(opp.recommended_size, dec!(100));
        assert_eq!(opp.confidence, Confidence::High);
        assert_eq!(opp.capital_per_contract(), dec!(0.95));
        assert_eq!(opp.expected_profit(dec!(100)), dec!(5));
        assert_eq!(detector.recent(10).len(), 1);
    }

    #[test]
    fn test_trims_to_common_size() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        books
            .apply_snapshot(
                Venue::Polymarket,
                "0xfedcut",
                &[level(dec!(0.51), dec!(30))],
                &[level(dec!(0.53), dec!(100))],
                now(),
            )
            .unwrap();
        let detector = detector(books, certain_race());

        let opp = detector.evaluate("fed-cut", now()).unwrap();
        assert_eq!(opp.executable_size, dec!(30));
        assert_eq!(opp.buy_leg.quote.max_size, dec!(30));
        assert!(opp.buy_leg.quote.sufficient_depth);
    }

    #[test]
    fn test_fees_reduce_edge() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        let detector = ArbDetector::new(
            books,
            certain_race(),
            FeeSchedule::default(),
            events(),
            DetectorConfig::default(),
        );

        let opp = detector.evaluate("fed-cut", now()).unwrap();
        assert_eq!(opp.gross_edge_bps, dec!(500));
        assert!(opp.edge_bps < opp.gross_edge_bps);
        // Kalshi: ceil(0.07 * 100 * 0.46 * 0.54) = 1.74 -> 0.0174/contract
        assert!(opp.fee_per_contract > dec!(0.0174));
    }

    #[test]
    fn test_no_edge_below_threshold() {
        let books = Arc::new(OrderbookManager::new());
        books
            .apply_snapshot(
                Venue::Kalshi,
                "KXFED-CUT",
                &[level(dec!(0.49), dec!(100))],
                &[level(dec!(0.50), dec!(100))],
                now(),
            )
            .unwrap();
        books
            .apply_snapshot(
                Venue::Polymarket,
                "0xfedcut",
                &[level(dec!(0.50), dec!(100))],
                &[level(dec!(0.51), dec!(100))],
                now(),
            )
            .unwrap();
        let detector = detector(books, certain_race());

        assert!(matches!(
            detector.evaluate("fed-cut", now()),
            Err(NoOpportunity::BelowThreshold { .. })
        ));
        assert!(detector.detect("fed-cut").is_none());
    }

    #[test]
    fn test_picks_reverse_direction() {
        let books = Arc::new(OrderbookManager::new());
        books
            .apply_snapshot(
                Venue::Kalshi,
                "KXFED-CUT",
                &[level(dec!(0.60), dec!(50))],
                &[level(dec!(0.62), dec!(50))],
                now(),
            )
            .unwrap();
        books
            .apply_snapshot(
                Venue::Polymarket,
                "0xfedcut",
                &[level(dec!(0.52), dec!(50))],
                &[level(dec!(0.55), dec!(50))],
                now(),
            )
            .unwrap();
        let detector = detector(books, certain_race());

        let opp = detector.evaluate("fed-cut", now()).unwrap();
        assert_eq!(opp.buy_venue, Venue::Polymarket);
        assert_eq!(opp.gross_edge_bps, dec!(500));
        assert_eq!(opp.key().to_string(), "fed-cut:polymarket->kalshi");
    }

    // ==================== Staleness Tests ====================

    #[test]
    fn test_book_at_staleness_threshold_is_excluded() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        let detector = detector(books, certain_race());

        let just_inside = now() + Duration::milliseconds(1_999);
        assert!(detector.evaluate("fed-cut", just_inside).is_ok());

        let at_threshold = now() + Duration::milliseconds(2_000);
        assert!(matches!(
            detector.evaluate("fed-cut", at_threshold),
            Err(NoOpportunity::StaleBook {
                staleness_ms: 2_000,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_book_and_unknown_event() {
        let books = Arc::new(OrderbookManager::new());
        let detector = detector(books, certain_race());
        assert!(matches!(
            detector.evaluate("fed-cut", now()),
            Err(NoOpportunity::MissingBook { .. })
        ));
        assert!(matches!(
            detector.evaluate("nope", now()),
            Err(NoOpportunity::UnknownEvent(_))
        ));
    }

    // ==================== Race Model Tests ====================

    #[test]
    fn test_race_probability_scales_recommended_size() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        // Default curve: 0.9 * q(0) = 0.54 at zero age
        let detector = detector(books, Arc::new(RaceModel::default()));

        let opp = detector.evaluate("fed-cut", now()).unwrap();
        assert!((opp.buy_leg.fill_probability() - 0.54).abs() < 1e-9);
        // 100 * 0.54 * 0.54 = 29.16
        assert_eq!(opp.recommended_size, dec!(29));
        assert_eq!(opp.confidence, Confidence::Medium);
    }

    #[test]
    fn test_low_fill_probability_degrades_confidence() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        let detector = detector(books, Arc::new(RaceModel::default()));

        // 1.5s old: 0.54 * 0.5^0.75 ~ 0.32
        let opp = detector
            .evaluate("fed-cut", now() + Duration::milliseconds(1_500))
            .unwrap();
        assert_eq!(opp.confidence, Confidence::Low);
        assert_eq!(opp.buy_leg.book_age_ms, 1_500);
    }

    #[test]
    fn test_scan_all_summary() {
        let books = Arc::new(OrderbookManager::new());
        seed_books(&books, now());
        let events = EventTable::new(vec![
            CanonicalEvent::new("fed-cut", "KXFED-CUT", "0xfedcut"),
            CanonicalEvent::new("no-books", "KXNONE", "0xnone"),
        ]);
        let detector = ArbDetector::new(
            books,
            certain_race(),
            FeeSchedule::zero(),
            events,
            DetectorConfig::default(),
        );

        let summary = detector.scan_all(now());
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.opportunities.len(), 1);
        assert_eq!(summary.unusable_books, 1);
    }
}
