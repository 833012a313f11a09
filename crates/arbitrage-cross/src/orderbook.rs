//! Order book state for every (venue, instrument) pair.
//!
//! Each instrument keeps a private price ladder that only writers touch and a
//! published [`OrderbookSnapshot`] behind an `Arc`. Writers rebuild the
//! snapshot and swap the pointer; readers clone the `Arc` and never wait on a
//! ladder update in progress.
//!
//! Books are never merged across venues here. Reconciliation happens in the
//! detector, at decision time.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use xarb_core::{BookEvent, BookEventKind, OrderLevel, Side, Venue};

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Book updates that violate the ladder invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    /// Best bid at or above best ask. The instrument is stale until the next valid snapshot.
    #[error("crossed book on {venue}:{instrument}: bid {best_bid} >= ask {best_ask}")]
    Crossed {
        /// Venue of the book.
        venue: Venue,
        /// Instrument id.
        instrument: String,
        /// Best bid after the update.
        best_bid: Decimal,
        /// Best ask after the update.
        best_ask: Decimal,
    },

    /// The same price appears twice on one side of a snapshot, so the side
    /// is not strictly ordered. The instrument is stale until the next valid snapshot.
    #[error("duplicate {side} level on {venue}:{instrument} at {price}")]
    DuplicateLevel {
        /// Venue of the book.
        venue: Venue,
        /// Instrument id.
        instrument: String,
        /// Buy for bids, sell for asks.
        side: Side,
        /// Repeated price.
        price: Decimal,
    },

    /// Level with price outside (0, 1) or an unusable size.
    #[error("invalid level on {venue}:{instrument}: {size} @ {price}")]
    InvalidLevel {
        /// Venue of the book.
        venue: Venue,
        /// Instrument id.
        instrument: String,
        /// Offending price.
        price: Decimal,
        /// Offending size.
        size: Decimal,
    },
}

/// Result of a successfully processed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update changed the published book.
    Applied,
    /// The delta had no usable base; a fresh snapshot was requested.
    ResyncRequested,
}

/// Why a resync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncReason {
    /// A delta arrived before any snapshot.
    NoBaseSnapshot,
    /// A delta arrived while the book was invalidated.
    Invalidated,
}

/// A request for the transport to resend a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub venue: Venue,
    pub instrument_id: String,
    pub reason: ResyncReason,
    pub requested_at: DateTime<Utc>,
}

// =============================================================================
// Published Snapshot
// =============================================================================

/// Immutable, consistent view of one book.
///
/// Bids are strictly descending, asks strictly ascending, and the book is
/// never crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub venue: Venue,
    pub instrument_id: String,
    pub bids: Vec<OrderLevel>,
    pub asks: Vec<OrderLevel>,
    pub last_update_at: DateTime<Utc>,
}

impl OrderbookSnapshot {
    /// Returns the best (highest) bid price.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Returns the best (lowest) ask price.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Returns the mid price, if both sides have liquidity.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Levels consumed by an aggressive order on `side`: asks for a buy, bids for a sell.
    #[must_use]
    pub fn levels_for(&self, side: Side) -> &[OrderLevel] {
        match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        }
    }

    /// Levels a passive order on `side` would join: bids for a buy, asks for a sell.
    #[must_use]
    pub fn passive_levels(&self, side: Side) -> &[OrderLevel] {
        self.levels_for(side.opposite())
    }

    /// Total resting size on one side.
    #[must_use]
    pub fn depth(&self, side: Side) -> Decimal {
        self.levels_for(side).iter().map(|l| l.size).sum()
    }
}

/// A published snapshot plus its age at read time.
#[derive(Debug, Clone)]
pub struct BookView {
    pub snapshot: Arc<OrderbookSnapshot>,
    /// `now - last_update_at`, clamped at zero.
    pub staleness: chrono::Duration,
    /// True after a crossed update, until the next valid snapshot.
    pub invalidated: bool,
}

impl BookView {
    /// Staleness in whole milliseconds.
    #[must_use]
    pub fn staleness_ms(&self) -> i64 {
        self.staleness.num_milliseconds()
    }

    /// True when the book may be used for a decision at `max_staleness_ms`.
    /// A book exactly at the threshold is already too old.
    #[must_use]
    pub fn is_usable(&self, max_staleness_ms: i64) -> bool {
        !self.invalidated && self.staleness_ms() < max_staleness_ms
    }
}

/// Point-in-time summary for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    pub venue: Venue,
    pub instrument_id: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub last_update_at: DateTime<Utc>,
    pub staleness_ms: i64,
    pub invalidated: bool,
}

// =============================================================================
// Per-instrument State
// =============================================================================

#[derive(Debug, Default)]
struct Ladder {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// False until the first valid snapshot, and again after a crossed update.
    has_base: bool,
    last_update_at: Option<DateTime<Utc>>,
}

impl Ladder {
    fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|r| r.0)
    }

    fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    fn crossed(&self) -> Option<(Decimal, Decimal)> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid >= ask => Some((bid, ask)),
            _ => None,
        }
    }

    fn advance_clock(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.last_update_at {
            Some(prev) if prev > timestamp => prev,
            _ => timestamp,
        };
        self.last_update_at = Some(next);
        next
    }

    fn to_snapshot(&self, venue: Venue, instrument_id: &str) -> OrderbookSnapshot {
        OrderbookSnapshot {
            venue,
            instrument_id: instrument_id.to_string(),
            bids: self
                .bids
                .iter()
                .map(|(p, s)| OrderLevel::new(p.0, *s))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, s)| OrderLevel::new(*p, *s))
                .collect(),
            last_update_at: self.last_update_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Default)]
struct Published {
    snapshot: Option<Arc<OrderbookSnapshot>>,
    invalidated: bool,
}

#[derive(Debug, Default)]
struct InstrumentBook {
    /// Serializes writers for this instrument.
    ladder: Mutex<Ladder>,
    /// Held only for the pointer swap or an `Arc` clone.
    published: RwLock<Published>,
}

type BookKey = (Venue, String);

// =============================================================================
// Orderbook Manager
// =============================================================================

/// Owner of every order book the engine watches.
///
/// Safe for one writer task per venue and any number of readers.
#[derive(Debug, Default)]
pub struct OrderbookManager {
    books: RwLock<HashMap<BookKey, Arc<InstrumentBook>>>,
    resync_requests: Mutex<Vec<ResyncRequest>>,
}

impl OrderbookManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, venue: Venue, instrument: &str) -> Arc<InstrumentBook> {
        let key = (venue, instrument.to_string());
        if let Some(book) = self.books.read().get(&key) {
            return Arc::clone(book);
        }
        Arc::clone(self.books.write().entry(key).or_default())
    }

    fn existing(&self, venue: Venue, instrument: &str) -> Option<Arc<InstrumentBook>> {
        self.books
            .read()
            .get(&(venue, instrument.to_string()))
            .map(Arc::clone)
    }

    /// Dispatches a normalized feed message.
    ///
    /// # Errors
    ///
    /// See [`Self::apply_snapshot`] and [`Self::apply_delta`].
    pub fn apply_event(&self, event: &BookEvent) -> Result<ApplyOutcome, BookError> {
        match event.kind {
            BookEventKind::Snapshot => self.apply_snapshot(
                event.venue,
                &event.instrument_id,
                &event.bids,
                &event.asks,
                event.timestamp,
            ),
            BookEventKind::Delta => self.apply_delta(
                event.venue,
                &event.instrument_id,
                &event.bids,
                &event.asks,
                event.timestamp,
            ),
        }
    }

    /// Replaces the book for an instrument.
    ///
    /// # Errors
    ///
    /// Returns [`BookError::InvalidLevel`] if any level has a price outside
    /// (0, 1) or a non-positive size; the previous state is kept.
    /// Returns [`BookError::DuplicateLevel`] if a price repeats on one side,
    /// or [`BookError::Crossed`] if the snapshot is crossed; either way the
    /// instrument is marked stale.
    pub fn apply_snapshot(
        &self,
        venue: Venue,
        instrument: &str,
        bids: &[OrderLevel],
        asks: &[OrderLevel],
        timestamp: DateTime<Utc>,
    ) -> Result<ApplyOutcome, BookError> {
        if let Some(bad) = bids.iter().chain(asks).find(|l| !l.is_valid()) {
            return Err(invalid_level(venue, instrument, bad));
        }

        let book = self.entry(venue, instrument);
        let duplicate = duplicate_price(bids)
            .map(|price| (Side::Buy, price))
            .or_else(|| duplicate_price(asks).map(|price| (Side::Sell, price)));
        if let Some((side, price)) = duplicate {
            book.ladder.lock().has_base = false;
            book.published.write().invalidated = true;
            warn!(
                %venue,
                instrument,
                %side,
                %price,
                "Snapshot with duplicate price level rejected, instrument marked stale"
            );
            return Err(BookError::DuplicateLevel {
                venue,
                instrument: instrument.to_string(),
                side,
                price,
            });
        }

        let mut ladder = book.ladder.lock();
        ladder.bids = bids.iter().map(|l| (Reverse(l.price), l.size)).collect();
        ladder.asks = asks.iter().map(|l| (l.price, l.size)).collect();
        ladder.advance_clock(timestamp);

        if let Some((best_bid, best_ask)) = ladder.crossed() {
            ladder.has_base = false;
            drop(ladder);
            return Err(self.invalidate(&book, venue, instrument, best_bid, best_ask));
        }

        ladder.has_base = true;
        let snapshot = Arc::new(ladder.to_snapshot(venue, instrument));
        drop(ladder);

        let mut published = book.published.write();
        published.snapshot = Some(snapshot);
        published.invalidated = false;
        drop(published);

        self.clear_resync(venue, instrument);
        trace!(%venue, instrument, "Snapshot applied");
        Ok(ApplyOutcome::Applied)
    }

    /// Patches the book. A level with zero size removes that price.
    ///
    /// A delta without a valid base does not touch state and returns
    /// [`ApplyOutcome::ResyncRequested`].
    ///
    /// # Errors
    ///
    /// Returns [`BookError::InvalidLevel`] for prices outside (0, 1) or
    /// negative sizes. Returns [`BookError::Crossed`] if the patched book is
    /// crossed; the instrument is marked stale and a resync is requested.
    pub fn apply_delta(
        &self,
        venue: Venue,
        instrument: &str,
        bids: &[OrderLevel],
        asks: &[OrderLevel],
        timestamp: DateTime<Utc>,
    ) -> Result<ApplyOutcome, BookError> {
        if let Some(bad) = bids.iter().chain(asks).find(|l| {
            l.price <= Decimal::ZERO || l.price >= Decimal::ONE || l.size < Decimal::ZERO
        }) {
            return Err(invalid_level(venue, instrument, bad));
        }

        let Some(book) = self.existing(venue, instrument) else {
            self.request_resync(venue, instrument, ResyncReason::NoBaseSnapshot);
            return Ok(ApplyOutcome::ResyncRequested);
        };

        let mut ladder = book.ladder.lock();
        if !ladder.has_base {
            let reason = if book.published.read().snapshot.is_some() {
                ResyncReason::Invalidated
            } else {
                ResyncReason::NoBaseSnapshot
            };
            drop(ladder);
            self.request_resync(venue, instrument, reason);
            return Ok(ApplyOutcome::ResyncRequested);
        }

        for level in bids {
            if level.size.is_zero() {
                ladder.bids.remove(&Reverse(level.price));
            } else {
                ladder.bids.insert(Reverse(level.price), level.size);
            }
        }
        for level in asks {
            if level.size.is_zero() {
                ladder.asks.remove(&level.price);
            } else {
                ladder.asks.insert(level.price, level.size);
            }
        }
        ladder.advance_clock(timestamp);

        if let Some((best_bid, best_ask)) = ladder.crossed() {
            ladder.has_base = false;
            drop(ladder);
            let err = self.invalidate(&book, venue, instrument, best_bid, best_ask);
            self.request_resync(venue, instrument, ResyncReason::Invalidated);
            return Err(err);
        }

        let snapshot = Arc::new(ladder.to_snapshot(venue, instrument));
        drop(ladder);
        book.published.write().snapshot = Some(snapshot);
        Ok(ApplyOutcome::Applied)
    }

    fn invalidate(
        &self,
        book: &InstrumentBook,
        venue: Venue,
        instrument: &str,
        best_bid: Decimal,
        best_ask: Decimal,
    ) -> BookError {
        book.published.write().invalidated = true;
        warn!(
            %venue,
            instrument,
            best_bid = %best_bid,
            best_ask = %best_ask,
            "Crossed book rejected, instrument marked stale"
        );
        BookError::Crossed {
            venue,
            instrument: instrument.to_string(),
            best_bid,
            best_ask,
        }
    }

    /// Returns the latest consistent book with staleness measured against the wall clock.
    #[must_use]
    pub fn get_book(&self, venue: Venue, instrument: &str) -> Option<BookView> {
        self.get_book_at(venue, instrument, Utc::now())
    }

    /// Returns the latest consistent book with staleness measured at `now`.
    #[must_use]
    pub fn get_book_at(
        &self,
        venue: Venue,
        instrument: &str,
        now: DateTime<Utc>,
    ) -> Option<BookView> {
        let book = self.existing(venue, instrument)?;
        let published = book.published.read();
        let snapshot = Arc::clone(published.snapshot.as_ref()?);
        let invalidated = published.invalidated;
        drop(published);

        let staleness = (now - snapshot.last_update_at).max(chrono::Duration::zero());
        Some(BookView {
            snapshot,
            staleness,
            invalidated,
        })
    }

    fn request_resync(&self, venue: Venue, instrument: &str, reason: ResyncReason) {
        let mut pending = self.resync_requests.lock();
        if pending
            .iter()
            .any(|r| r.venue == venue && r.instrument_id == instrument)
        {
            return;
        }
        debug!(%venue, instrument, ?reason, "Delta without base, resync requested");
        pending.push(ResyncRequest {
            venue,
            instrument_id: instrument.to_string(),
            reason,
            requested_at: Utc::now(),
        });
    }

    fn clear_resync(&self, venue: Venue, instrument: &str) {
        self.resync_requests
            .lock()
            .retain(|r| !(r.venue == venue && r.instrument_id == instrument));
    }

    /// Drains pending resync requests for the transport layer.
    pub fn take_resync_requests(&self) -> Vec<ResyncRequest> {
        std::mem::take(&mut *self.resync_requests.lock())
    }

    /// Summaries of every published book.
    #[must_use]
    pub fn export_state(&self) -> Vec<BookSummary> {
        self.export_state_at(Utc::now())
    }

    /// Summaries of every published book, aged at `now`.
    #[must_use]
    pub fn export_state_at(&self, now: DateTime<Utc>) -> Vec<BookSummary> {
        let keys: Vec<BookKey> = self.books.read().keys().cloned().collect();
        let mut summaries: Vec<BookSummary> = keys
            .into_iter()
            .filter_map(|(venue, instrument)| {
                let view = self.get_book_at(venue, &instrument, now)?;
                let book = &view.snapshot;
                Some(BookSummary {
                    venue,
                    instrument_id: instrument,
                    best_bid: book.best_bid(),
                    best_ask: book.best_ask(),
                    bid_levels: book.bids.len(),
                    ask_levels: book.asks.len(),
                    bid_depth: book.depth(Side::Sell),
                    ask_depth: book.depth(Side::Buy),
                    last_update_at: book.last_update_at,
                    staleness_ms: view.staleness_ms(),
                    invalidated: view.invalidated,
                })
            })
            .collect();
        summaries.sort_by(|a, b| (a.venue, &a.instrument_id).cmp(&(b.venue, &b.instrument_id)));
        summaries
    }

    /// Number of instruments seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    /// Drops every book and pending resync request.
    pub fn reset(&self) {
        self.books.write().clear();
        self.resync_requests.lock().clear();
    }
}

/// First price that appears more than once.
fn duplicate_price(levels: &[OrderLevel]) -> Option<Decimal> {
    let mut seen = HashSet::with_capacity(levels.len());
    levels.iter().map(|l| l.price).find(|price| !seen.insert(*price))
}

fn invalid_level(venue: Venue, instrument: &str, level: &OrderLevel) -> BookError {
    BookError::InvalidLevel {
        venue,
        instrument: instrument.to_string(),
        price: level.price,
        size: level.size,
    }
}
