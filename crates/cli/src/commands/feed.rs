//! Book event sources for the `run` command.
//!
//! - stdin: one JSON [`BookEvent`] per line, as a venue transport would emit
//! - demo: a seeded random walk per event with occasional cross-venue
//!   dislocations, for exercising the engine without live connectivity

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use xarb_core::{BookEvent, CanonicalEvent, OrderLevel, Venue};

/// Forwards JSONL book events from stdin until EOF or the receiver closes.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn stdin_feed(tx: mpsc::Sender<BookEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0_u64;
    let mut forwarded = 0_u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BookEvent>(&line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed book event"),
        }
    }

    info!(forwarded, "Stdin feed finished");
    Ok(())
}

/// Levels published per side.
const DEMO_DEPTH: i64 = 3;

/// Synthetic books for every configured event.
pub struct DemoFeed {
    events: Vec<CanonicalEvent>,
    fair_cents: Vec<f64>,
    dislocation_rate: f64,
    rng: StdRng,
}

impl DemoFeed {
    #[must_use]
    pub fn new(events: Vec<CanonicalEvent>, seed: Option<u64>) -> Self {
        let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let fair_cents = events.iter().map(|_| rng.gen_range(30.0..70.0)).collect();
        Self {
            events,
            fair_cents,
            dislocation_rate: 0.15,
            rng,
        }
    }

    /// Sets how often a venue's quote is pushed away from fair value.
    #[must_use]
    pub fn with_dislocation_rate(mut self, rate: f64) -> Self {
        self.dislocation_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// One snapshot per venue per event, stamped `now`.
    pub fn next_round(&mut self, now: DateTime<Utc>) -> Vec<BookEvent> {
        let mut out = Vec::with_capacity(self.events.len() * 2);
        for (idx, event) in self.events.iter().enumerate() {
            let fair = &mut self.fair_cents[idx];
            *fair = (*fair + self.rng.gen_range(-1.0..1.0)).clamp(10.0, 90.0);
            let fair_cents = fair.round() as i64;

            for venue in Venue::ALL {
                let offset = if self.rng.gen_bool(self.dislocation_rate) {
                    let shift = self.rng.gen_range(3..=6);
                    if self.rng.gen_bool(0.5) {
                        shift
                    } else {
                        -shift
                    }
                } else {
                    0
                };
                let mid = (fair_cents + offset).clamp(5, 95);
                let (bids, asks) = ladder(mid, &mut self.rng);
                out.push(BookEvent::snapshot(
                    venue,
                    event.instrument(venue),
                    bids,
                    asks,
                    now,
                ));
            }
        }
        out
    }

    /// Publishes a round every `interval` until `shutdown` flips or the
    /// receiver closes.
    pub async fn run(
        mut self,
        interval: Duration,
        tx: mpsc::Sender<BookEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        info!(
            events = self.events.len(),
            interval_ms = interval.as_millis(),
            "Demo feed started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for event in self.next_round(Utc::now()) {
                        if tx.send(event).await.is_err() {
                            debug!("Book receiver closed, demo feed stopping");
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// A one-cent-wide book around `mid_cents` with random sizes.
fn ladder(mid_cents: i64, rng: &mut StdRng) -> (Vec<OrderLevel>, Vec<OrderLevel>) {
    let mut size = || Decimal::from(rng.gen_range(20..=200_i64));
    let bids = (0..DEMO_DEPTH)
        .map(|i| mid_cents - 1 - i)
        .filter(|c| *c > 0)
        .map(|c| OrderLevel::new(Decimal::new(c, 2), size()))
        .collect();
    let asks = (0..DEMO_DEPTH)
        .map(|i| mid_cents + 1 + i)
        .filter(|c| *c < 100)
        .map(|c| OrderLevel::new(Decimal::new(c, 2), size()))
        .collect();
    (bids, asks)
}
