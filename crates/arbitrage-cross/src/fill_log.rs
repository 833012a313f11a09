//! Append-only log of execution resolutions.
//!
//! Every resolved attempt is appended with, per leg, the predicted fill
//! probability, whether and how much it filled, the latency to the first
//! fill, and the book age and queue index at placement. The log feeds
//! [`crate::race::RaceModel::calibrate`] through [`FillLogger::calibration_table`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use xarb_core::{ExecutionMode, Venue};

use crate::executor::{AttemptOutcome, AttemptState, ExecutionAttempt, OrderRecord};

// =============================================================================
// Entries
// =============================================================================

/// One resolved attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillLogEntry {
    pub attempt_id: Uuid,
    pub event_id: String,
    pub mode: ExecutionMode,
    pub outcome: Option<AttemptOutcome>,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
    pub size: Decimal,
    pub expected_edge_bps: Decimal,
    pub locked_pnl: Decimal,
    pub legs: Vec<OrderRecord>,
    pub states: Vec<AttemptState>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FillLogEntry {
    #[must_use]
    pub fn from_attempt(attempt: &ExecutionAttempt) -> Self {
        Self {
            attempt_id: attempt.attempt_id,
            event_id: attempt.opportunity.event_id.clone(),
            mode: attempt.mode,
            outcome: attempt.outcome,
            buy_venue: attempt.opportunity.buy_venue,
            sell_venue: attempt.opportunity.sell_venue,
            size: attempt.size,
            expected_edge_bps: attempt.opportunity.edge_bps,
            locked_pnl: attempt.locked_pnl,
            legs: attempt.orders.clone(),
            states: attempt.state_path(),
            created_at: attempt.created_at,
            resolved_at: attempt.resolved_at,
        }
    }
}

// =============================================================================
// Calibration Buckets
// =============================================================================

/// Bucket boundaries for [`FillLogger::calibration_table`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketLayout {
    /// Upper edges of the book-age buckets, ascending. Ages at or beyond the
    /// last edge fall into an open-ended final bucket.
    pub age_edges_ms: Vec<i64>,
    /// Queue indices above this are folded into it.
    pub max_queue_level: usize,
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self {
            age_edges_ms: vec![250, 500, 1_000, 2_000, 5_000],
            max_queue_level: 3,
        }
    }
}

impl BucketLayout {
    /// `(lo, hi)` of the age bucket containing `age_ms`.
    fn age_bucket(&self, age_ms: i64) -> (i64, Option<i64>) {
        let mut lo = 0;
        for &edge in &self.age_edges_ms {
            if age_ms < edge {
                return (lo, Some(edge));
            }
            lo = edge;
        }
        (lo, None)
    }
}

/// Predicted versus realized fills for one venue, age band and queue level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub venue: Venue,
    pub age_lo_ms: i64,
    /// `None` for the open-ended last band.
    pub age_hi_ms: Option<i64>,
    pub queue_level: usize,
    pub attempts: u32,
    pub fills: u32,
    pub predicted_sum: f64,
    pub mean_book_age_ms: f64,
}

impl CalibrationBucket {
    #[must_use]
    pub fn fill_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        f64::from(self.fills) / f64::from(self.attempts)
    }

    #[must_use]
    pub fn mean_predicted(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.predicted_sum / f64::from(self.attempts)
    }
}

/// Buckets ordered by venue, age band, then queue level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub buckets: Vec<CalibrationBucket>,
}

impl CalibrationTable {
    /// Total placed legs across all buckets.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.buckets.iter().map(|b| b.attempts).sum()
    }
}

// =============================================================================
// Fill Logger
// =============================================================================

/// Append-only resolution log with an optional JSONL sink.
#[derive(Debug, Default)]
pub struct FillLogger {
    entries: RwLock<Vec<FillLogEntry>>,
    sink: Option<Mutex<BufWriter<File>>>,
    sink_path: Option<PathBuf>,
}

impl FillLogger {
    /// In-memory log only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends each entry as one JSON line to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn with_sink(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "Fill log sink opened");
        Ok(Self {
            entries: RwLock::new(Vec::new()),
            sink: Some(Mutex::new(BufWriter::new(file))),
            sink_path: Some(path.to_path_buf()),
        })
    }

    /// Loads entries previously written by a sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a valid entry.
    pub fn replay(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open fill log {}", path.display()))?;

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: FillLogEntry = serde_json::from_str(&line)
                .with_context(|| format!("Invalid fill log entry on line {}", index + 1))?;
            entries.push(entry);
        }

        info!(path = %path.display(), entries = entries.len(), "Fill log replayed");
        Ok(Self {
            entries: RwLock::new(entries),
            sink: None,
            sink_path: None,
        })
    }

    #[must_use]
    pub fn sink_path(&self) -> Option<&Path> {
        self.sink_path.as_deref()
    }

    /// Appends an entry. Sink write failures are logged, never propagated.
    pub fn append(&self, entry: FillLogEntry) {
        if let Some(sink) = &self.sink {
            if let Err(e) = write_line(&mut sink.lock(), &entry) {
                warn!(attempt_id = %entry.attempt_id, error = %e, "Failed to persist fill log entry");
            }
        }
        self.entries.write().push(entry);
    }

    /// Appends a resolved attempt.
    pub fn record(&self, attempt: &ExecutionAttempt) {
        self.append(FillLogEntry::from_attempt(attempt));
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<FillLogEntry> {
        self.entries.read().clone()
    }

    /// Most recent `n` entries, newest last.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<FillLogEntry> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries[skip..].to_vec()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Aggregates every placed leg into venue x age x queue buckets.
    ///
    /// Legs that never reached the venue are excluded; they say nothing
    /// about fill races.
    #[must_use]
    pub fn calibration_table(&self, layout: &BucketLayout) -> CalibrationTable {
        let entries = self.entries.read();
        let mut buckets: Vec<CalibrationBucket> = Vec::new();

        for leg in entries
            .iter()
            .flat_map(|e| e.legs.iter())
            .filter(|leg| leg.order_ref.is_some())
        {
            let (age_lo_ms, age_hi_ms) = layout.age_bucket(leg.book_age_ms);
            let queue_level = leg.queue_level_index.min(layout.max_queue_level);

            let position = buckets.iter().position(|b| {
                b.venue == leg.venue && b.age_lo_ms == age_lo_ms && b.queue_level == queue_level
            });
            let bucket = match position {
                Some(i) => &mut buckets[i],
                None => {
                    buckets.push(CalibrationBucket {
                        venue: leg.venue,
                        age_lo_ms,
                        age_hi_ms,
                        queue_level,
                        attempts: 0,
                        fills: 0,
                        predicted_sum: 0.0,
                        mean_book_age_ms: 0.0,
                    });
                    let last = buckets.len() - 1;
                    &mut buckets[last]
                }
            };

            let n = f64::from(bucket.attempts);
            bucket.mean_book_age_ms =
                (bucket.mean_book_age_ms * n + leg.book_age_ms as f64) / (n + 1.0);
            bucket.attempts += 1;
            if leg.is_filled() {
                bucket.fills += 1;
            }
            bucket.predicted_sum += leg.predicted_fill_probability;
        }

        buckets.sort_by(|a, b| {
            (a.venue, a.age_lo_ms, a.queue_level).cmp(&(b.venue, b.age_lo_ms, b.queue_level))
        });
        CalibrationTable { buckets }
    }
}

fn write_line(writer: &mut BufWriter<File>, entry: &FillLogEntry) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, entry)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
