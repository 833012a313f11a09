//! Execution attempt records and the state transition table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use xarb_core::{ExecutionMode, Side, Venue};

use crate::alerts::{Alert, CancelOutcome};
use crate::detector::{ArbOpportunity, LegQuote};
use crate::venue::{OrderRef, OrderType};

use super::ExecutionError;

// =============================================================================
// States
// =============================================================================

/// Lifecycle of one execution attempt.
///
/// ```text
/// PROPOSED -> LEG1_PLACED -> {LEG1_FILLED | LEG1_TIMEOUT} -> LEG2_PLACED
///          -> {BOTH_FILLED | ONE_SIDED | BOTH_FAILED} -> RESOLVED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Proposed,
    Leg1Placed,
    Leg1Filled,
    Leg1Timeout,
    Leg2Placed,
    BothFilled,
    OneSided,
    BothFailed,
    Resolved,
}

impl AttemptState {
    /// True if `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use AttemptState::{
            BothFailed, BothFilled, Leg1Filled, Leg1Placed, Leg1Timeout, Leg2Placed, OneSided,
            Proposed, Resolved,
        };
        matches!(
            (self, next),
            (Proposed, Leg1Placed | BothFailed)
                | (
                    Leg1Placed,
                    Leg1Filled | Leg1Timeout | Leg2Placed | OneSided | BothFailed
                )
                | (Leg1Filled, Leg2Placed | OneSided)
                | (Leg1Timeout, Leg2Placed | OneSided | BothFailed)
                | (Leg2Placed, BothFilled | OneSided | BothFailed)
                | (BothFilled | OneSided | BothFailed, Resolved)
        )
    }

    /// One of the three outcome states.
    #[must_use]
    pub fn is_outcome(self) -> bool {
        matches!(self, Self::BothFilled | Self::OneSided | Self::BothFailed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Leg1Placed => "LEG1_PLACED",
            Self::Leg1Filled => "LEG1_FILLED",
            Self::Leg1Timeout => "LEG1_TIMEOUT",
            Self::Leg2Placed => "LEG2_PLACED",
            Self::BothFilled => "BOTH_FILLED",
            Self::OneSided => "ONE_SIDED",
            Self::BothFailed => "BOTH_FAILED",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    BothFilled,
    OneSided,
    BothFailed,
}

impl AttemptOutcome {
    /// Classifies by which legs filled anything.
    #[must_use]
    pub fn from_fills(first_filled: bool, second_filled: bool) -> Self {
        match (first_filled, second_filled) {
            (true, true) => Self::BothFilled,
            (false, false) => Self::BothFailed,
            _ => Self::OneSided,
        }
    }

    #[must_use]
    pub fn state(self) -> AttemptState {
        match self {
            Self::BothFilled => AttemptState::BothFilled,
            Self::OneSided => AttemptState::OneSided,
            Self::BothFailed => AttemptState::BothFailed,
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AttemptState,
    pub to: AttemptState,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Orders
// =============================================================================

/// Role of an order within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    /// Passive resting order (maker-hedge mode, leg 1).
    Maker,
    /// Aggressive order hedging a maker fill (maker-hedge mode, leg 2).
    Hedge,
    /// Aggressive order sent concurrently with its counterpart.
    Taker,
}

/// One order of an attempt, with what was predicted and what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub venue: Venue,
    pub instrument_id: String,
    pub side: Side,
    pub role: LegRole,
    pub order_type: OrderType,
    pub limit_price: Decimal,
    pub requested_size: Decimal,
    /// Race probability when the order was sent.
    pub predicted_fill_probability: f64,
    /// Age of the book the price came from, at placement.
    pub book_age_ms: i64,
    pub queue_level_index: usize,
    pub order_ref: Option<OrderRef>,
    pub placed_at: Option<DateTime<Utc>>,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub first_fill_at: Option<DateTime<Utc>>,
    pub cancel: Option<CancelOutcome>,
    pub error: Option<String>,
}

impl OrderRecord {
    /// An aggressive order priced at the leg's slippage-bounded limit.
    #[must_use]
    pub fn aggressive(leg: &LegQuote, role: LegRole, size: Decimal) -> Self {
        Self {
            venue: leg.venue,
            instrument_id: leg.instrument_id.clone(),
            side: leg.side,
            role,
            order_type: OrderType::Fak,
            limit_price: leg.quote.worst_price,
            requested_size: size,
            predicted_fill_probability: leg.fill_probability(),
            book_age_ms: leg.book_age_ms,
            queue_level_index: leg.quote.queue_level_index(),
            order_ref: None,
            placed_at: None,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            first_fill_at: None,
            cancel: None,
            error: None,
        }
    }

    /// A passive order resting at `price` on the leg's venue.
    #[must_use]
    pub fn passive(leg: &LegQuote, price: Decimal, size: Decimal) -> Self {
        Self {
            order_type: OrderType::Gtc,
            limit_price: price,
            predicted_fill_probability: leg.passive_fill_probability,
            queue_level_index: 0,
            ..Self::aggressive(leg, LegRole::Maker, size)
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }

    /// Milliseconds from placement to the first fill.
    #[must_use]
    pub fn latency_ms(&self) -> Option<i64> {
        Some((self.first_fill_at? - self.placed_at?).num_milliseconds())
    }

    /// Signed YES contracts this order added to the position.
    #[must_use]
    pub fn signed_fill(&self) -> Decimal {
        self.side.sign() * self.filled_size
    }
}

// =============================================================================
// Attempt
// =============================================================================

/// One attempt to capture an opportunity. Owned by its executor task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_id: Uuid,
    pub opportunity: ArbOpportunity,
    /// Approved size in contracts.
    pub size: Decimal,
    pub mode: ExecutionMode,
    pub state: AttemptState,
    pub orders: Vec<OrderRecord>,
    pub transitions: Vec<StateTransition>,
    pub outcome: Option<AttemptOutcome>,
    /// P&L locked in by the hedged size, after fees.
    pub locked_pnl: Decimal,
    pub alerts: Vec<Alert>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ExecutionAttempt {
    /// Creates a proposed attempt.
    #[must_use]
    pub fn new(opportunity: ArbOpportunity, size: Decimal, mode: ExecutionMode) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            opportunity,
            size,
            mode,
            state: AttemptState::Proposed,
            orders: Vec::with_capacity(2),
            transitions: Vec::new(),
            outcome: None,
            locked_pnl: Decimal::ZERO,
            alerts: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.opportunity.event_id
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state == AttemptState::Resolved
    }

    /// Moves to `next` if the table allows it.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidTransition`] and leaves the state
    /// unchanged otherwise.
    pub fn transition(&mut self, next: AttemptState) -> Result<(), ExecutionError> {
        if !self.state.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                attempt_id: self.attempt_id,
                from: self.state,
                to: next,
            });
        }
        self.record_transition(next);
        Ok(())
    }

    /// Moves to `next` without consulting the table. Only used to guarantee
    /// that a broken attempt still reaches a terminal state.
    pub(crate) fn force_state(&mut self, next: AttemptState) {
        self.record_transition(next);
    }

    fn record_transition(&mut self, next: AttemptState) {
        let at = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            at,
        });
        self.state = next;
        if next == AttemptState::Resolved {
            self.resolved_at = Some(at);
        }
    }

    /// The path of states visited, starting with `PROPOSED`.
    #[must_use]
    pub fn state_path(&self) -> Vec<AttemptState> {
        std::iter::once(AttemptState::Proposed)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}
