//! Venue, order book and event-mapping types shared by every crate.
//!
//! Prices are quoted as probabilities in the open interval (0, 1); a contract
//! pays $1 on the winning outcome, so size doubles as face-value notional.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Venue Identifiers
// =============================================================================

/// Identifies which trading venue a book, order or position belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Kalshi (venue A).
    Kalshi,
    /// Polymarket CLOB (venue B).
    Polymarket,
}

impl Venue {
    /// Both venues, in canonical order.
    pub const ALL: [Self; 2] = [Self::Kalshi, Self::Polymarket];

    /// Returns the counterpart venue.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Kalshi => Self::Polymarket,
            Self::Polymarket => Self::Kalshi,
        }
    }

    /// Returns the display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kalshi => "kalshi",
            Self::Polymarket => "polymarket",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value held once per venue.
///
/// Serializes as a table with `kalshi` and `polymarket` keys, which keeps
/// per-venue configuration readable in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VenuePair<T> {
    pub kalshi: T,
    pub polymarket: T,
}

impl<T> VenuePair<T> {
    /// Creates a pair from both values.
    pub const fn new(kalshi: T, polymarket: T) -> Self {
        Self { kalshi, polymarket }
    }

    /// Returns the value for a venue.
    #[must_use]
    pub fn get(&self, venue: Venue) -> &T {
        match venue {
            Venue::Kalshi => &self.kalshi,
            Venue::Polymarket => &self.polymarket,
        }
    }

    /// Returns a mutable reference to the value for a venue.
    pub fn get_mut(&mut self, venue: Venue) -> &mut T {
        match venue {
            Venue::Kalshi => &mut self.kalshi,
            Venue::Polymarket => &mut self.polymarket,
        }
    }
}

impl<T: Clone> VenuePair<T> {
    /// Creates a pair with the same value on both venues.
    pub fn splat(value: T) -> Self {
        Self {
            kalshi: value.clone(),
            polymarket: value,
        }
    }
}

// =============================================================================
// Order Side
// =============================================================================

/// Direction of an order or a book walk.
///
/// A buy consumes asks, a sell consumes bids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Sign applied to filled size when booking a position (+1 buy, -1 sell).
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Order Book Levels
// =============================================================================

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLevel {
    /// Price as a probability, strictly between 0 and 1.
    pub price: Decimal,
    /// Resting contracts at this price.
    pub size: Decimal,
}

impl OrderLevel {
    /// Creates a new level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// True when the price is inside (0, 1) and the size is positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.price > Decimal::ZERO && self.price < Decimal::ONE && self.size > Decimal::ZERO
    }

    /// Face-value cost of taking the whole level.
    #[must_use]
    pub fn cost(&self) -> Decimal {
        self.price * self.size
    }
}

// =============================================================================
// Canonical Events
// =============================================================================

/// One logical binary outcome listed on both venues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Stable identifier shared by both listings.
    pub event_id: String,
    /// Kalshi market ticker for the YES outcome.
    pub kalshi_instrument: String,
    /// Polymarket token id for the same YES outcome.
    pub polymarket_instrument: String,
    /// Outcome label, e.g. `"YES"` or `"BTC>100K"`.
    #[serde(default = "default_outcome_code")]
    pub outcome_code: String,
}

fn default_outcome_code() -> String {
    "YES".to_string()
}

impl CanonicalEvent {
    /// Creates a mapping for the YES outcome.
    pub fn new(
        event_id: impl Into<String>,
        kalshi_instrument: impl Into<String>,
        polymarket_instrument: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            kalshi_instrument: kalshi_instrument.into(),
            polymarket_instrument: polymarket_instrument.into(),
            outcome_code: default_outcome_code(),
        }
    }

    /// Returns the instrument listed on `venue`.
    #[must_use]
    pub fn instrument(&self, venue: Venue) -> &str {
        match venue {
            Venue::Kalshi => &self.kalshi_instrument,
            Venue::Polymarket => &self.polymarket_instrument,
        }
    }
}

/// Static table of canonical events, indexed by event id.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    events: Vec<CanonicalEvent>,
    by_id: HashMap<String, usize>,
}

impl EventTable {
    /// Builds a table. Later duplicates of an event id replace earlier ones.
    #[must_use]
    pub fn new(events: Vec<CanonicalEvent>) -> Self {
        let mut table = Self::default();
        for event in events {
            table.insert(event);
        }
        table
    }

    fn insert(&mut self, event: CanonicalEvent) {
        if let Some(&idx) = self.by_id.get(&event.event_id) {
            self.events[idx] = event;
        } else {
            self.by_id.insert(event.event_id.clone(), self.events.len());
            self.events.push(event);
        }
    }

    /// Looks up an event by id.
    #[must_use]
    pub fn get(&self, event_id: &str) -> Option<&CanonicalEvent> {
        self.by_id.get(event_id).map(|&idx| &self.events[idx])
    }

    /// Iterates events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &CanonicalEvent> {
        self.events.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// =============================================================================
// Normalized Feed Events
// =============================================================================

/// Whether a feed message replaces the book or patches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookEventKind {
    Snapshot,
    Delta,
}

/// Normalized order book message produced by a venue transport.
///
/// In a delta, a level with zero size removes that price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEvent {
    pub venue: Venue,
    pub instrument_id: String,
    #[serde(rename = "type")]
    pub kind: BookEventKind,
    #[serde(default)]
    pub bids: Vec<OrderLevel>,
    #[serde(default)]
    pub asks: Vec<OrderLevel>,
    pub timestamp: DateTime<Utc>,
}

impl BookEvent {
    /// Creates a snapshot message.
    pub fn snapshot(
        venue: Venue,
        instrument_id: impl Into<String>,
        bids: Vec<OrderLevel>,
        asks: Vec<OrderLevel>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            venue,
            instrument_id: instrument_id.into(),
            kind: BookEventKind::Snapshot,
            bids,
            asks,
            timestamp,
        }
    }

    /// Creates a delta message.
    pub fn delta(
        venue: Venue,
        instrument_id: impl Into<String>,
        bids: Vec<OrderLevel>,
        asks: Vec<OrderLevel>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            venue,
            instrument_id: instrument_id.into(),
            kind: BookEventKind::Delta,
            bids,
            asks,
            timestamp,
        }
    }
}
