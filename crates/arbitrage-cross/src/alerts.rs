//! Operator alerts.
//!
//! Alerts fan out over a `tokio::sync::broadcast` channel and are also kept
//! in a bounded history for pull-based export.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{error, warn};
use uuid::Uuid;

use xarb_core::{Side, Venue};

/// How urgently an operator should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// What the alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    /// One leg filled, the other did not.
    OneSidedFill,
    /// Both legs filled with different sizes.
    Imbalance,
    /// A venue rejected or timed out an order.
    PlacementFailure,
    /// The daily-loss kill switch tripped.
    KillSwitchTripped,
    /// A venue reported a fill after its attempt had resolved.
    LateFill,
}

/// Result of a cancel request on the unfilled leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The venue confirmed the cancel.
    Cancelled,
    /// The venue reported nothing left to cancel.
    NothingToCancel,
    /// No order was resting (placement failed).
    NotPlaced,
    /// The cancel request failed or timed out.
    Failed(String),
}

/// Full context for a directional position left by a one-sided fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneSidedDetails {
    pub filled_venue: Venue,
    pub filled_instrument: String,
    pub filled_side: Side,
    pub filled_size: Decimal,
    pub filled_price: Decimal,
    pub unfilled_venue: Venue,
    pub unfilled_instrument: String,
    pub unfilled_cancel: CancelOutcome,
    /// Residual directional size (signed, YES contracts).
    pub residual_size: Decimal,
    pub recommended_action: String,
}

/// A structured operator alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub event_id: Option<String>,
    pub attempt_id: Option<Uuid>,
    pub message: String,
    pub one_sided: Option<OneSidedDetails>,
    pub at: DateTime<Utc>,
}

impl Alert {
    /// Creates an alert with no event context.
    pub fn new(severity: AlertSeverity, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            kind,
            event_id: None,
            attempt_id: None,
            message: message.into(),
            one_sided: None,
            at: Utc::now(),
        }
    }

    /// Attaches the event and attempt.
    #[must_use]
    pub fn for_attempt(mut self, event_id: impl Into<String>, attempt_id: Uuid) -> Self {
        self.event_id = Some(event_id.into());
        self.attempt_id = Some(attempt_id);
        self
    }

    /// Attaches one-sided fill details.
    #[must_use]
    pub fn with_one_sided(mut self, details: OneSidedDetails) -> Self {
        self.one_sided = Some(details);
        self
    }
}

/// Broadcast fan-out plus bounded history.
#[derive(Debug)]
pub struct AlertChannel {
    tx: broadcast::Sender<Alert>,
    history: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl Default for AlertChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

impl AlertChannel {
    /// Creates a channel keeping the last `capacity` alerts.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Logs, stores and broadcasts an alert. Having no subscribers is fine.
    pub fn publish(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                kind = ?alert.kind,
                event_id = ?alert.event_id,
                attempt_id = ?alert.attempt_id,
                details = ?alert.one_sided,
                "{}",
                alert.message
            ),
            _ => warn!(
                kind = ?alert.kind,
                event_id = ?alert.event_id,
                attempt_id = ?alert.attempt_id,
                "{}",
                alert.message
            ),
        }

        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }
        let _ = self.tx.send(alert);
    }

    /// Subscribes to alerts published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Most recent alerts, newest last.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of alerts kept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// Clears the history.
    pub fn reset(&self) {
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_history() {
        let channel = AlertChannel::new(4);
        let mut rx = channel.subscribe();

        let attempt = Uuid::new_v4();
        channel.publish(
            Alert::new(AlertSeverity::Critical, AlertKind::OneSidedFill, "leg unfilled")
                .for_attempt("evt", attempt),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, AlertKind::OneSidedFill);
        assert_eq!(received.attempt_id, Some(attempt));
        assert_eq!(channel.recent(10).len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let channel = AlertChannel::new(2);
        for i in 0..5 {
            channel.publish(Alert::new(
                AlertSeverity::Warning,
                AlertKind::PlacementFailure,
                format!("failure {i}"),
            ));
        }
        let recent = channel.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, "failure 4");
        assert_eq!(channel.recent(1)[0].message, "failure 4");
    }
}
