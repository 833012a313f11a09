//! Fill-probability ("race") model.
//!
//! Estimates the chance that an order priced off a book of a given age, at a
//! given queue depth, actually fills before the market moves:
//!
//! ```text
//! p = max(floor, base * 0.5^(age / half_life) * q(i))
//! q(i) = queue_floor + (1 - queue_floor) * (1 - exp(-i / queue_scale))
//! ```
//!
//! Parameters are per venue and hot-reloadable. Decisions only read them;
//! [`RaceModel::calibrate`] and [`RaceModel::update_params`] are the write path.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use xarb_core::{RaceParams, Venue, VenuePair};

use crate::fill_log::CalibrationTable;

/// z-score for a 95% Wilson interval.
const WILSON_Z: f64 = 1.96;

/// Bounds applied to a fitted half-life, in milliseconds.
const MIN_HALF_LIFE_MS: f64 = 50.0;
const MAX_HALF_LIFE_MS: f64 = 600_000.0;

/// Queue-depth factor; increases monotonically from `queue_floor` towards 1.
#[must_use]
pub fn queue_factor(params: &RaceParams, queue_level_index: usize) -> f64 {
    let depth = queue_level_index as f64;
    params.queue_floor + (1.0 - params.queue_floor) * (1.0 - (-depth / params.queue_scale).exp())
}

/// Evaluates the curve for one parameter set.
#[must_use]
pub fn probability_for(params: &RaceParams, book_age_ms: i64, queue_level_index: usize) -> f64 {
    let age = book_age_ms.max(0) as f64;
    let decay = 0.5f64.powf(age / params.half_life_ms);
    let p = params.base_probability * decay * queue_factor(params, queue_level_index);
    if p.is_nan() {
        return params.floor_probability;
    }
    p.clamp(params.floor_probability, 1.0)
}

/// Per-venue fill-probability model.
#[derive(Debug)]
pub struct RaceModel {
    params: RwLock<VenuePair<RaceParams>>,
}

impl Default for RaceModel {
    fn default() -> Self {
        Self::new(VenuePair::splat(RaceParams::default()))
    }
}

impl RaceModel {
    /// Creates a model with the given parameters.
    #[must_use]
    pub fn new(params: VenuePair<RaceParams>) -> Self {
        Self {
            params: RwLock::new(params),
        }
    }

    /// Probability in `[floor, 1]` that an order at `queue_level_index`, priced
    /// off a book `book_age_ms` old, fills on `venue`.
    #[must_use]
    pub fn fill_probability(&self, venue: Venue, book_age_ms: i64, queue_level_index: usize) -> f64 {
        let params = *self.params.read().get(venue);
        probability_for(&params, book_age_ms, queue_level_index)
    }

    /// Current parameters for a venue.
    #[must_use]
    pub fn params(&self, venue: Venue) -> RaceParams {
        *self.params.read().get(venue)
    }

    /// Current parameters for both venues.
    #[must_use]
    pub fn all_params(&self) -> VenuePair<RaceParams> {
        *self.params.read()
    }

    /// Replaces every parameter set, e.g. after a config reload.
    pub fn update_params(&self, params: VenuePair<RaceParams>) {
        let mut current = self.params.write();
        if *current != params {
            info!(
                kalshi_half_life_ms = params.kalshi.half_life_ms,
                polymarket_half_life_ms = params.polymarket.half_life_ms,
                "Race model parameters updated"
            );
        }
        *current = params;
    }

    /// Replaces one venue's parameters.
    pub fn set_params(&self, venue: Venue, params: RaceParams) {
        *self.params.write().get_mut(venue) = params;
    }

    /// Re-estimates `base_probability` and `half_life_ms` per venue from
    /// logged outcomes and applies the result.
    ///
    /// The base comes from the Wilson lower bound of the freshest bucket's
    /// fill rate, divided by that bucket's mean queue factor. The half-life
    /// is fitted from the decay between the freshest and the oldest
    /// sufficiently-sampled age buckets; if the rates do not decay it is left
    /// unchanged. Buckets with fewer than `min_samples` attempts are ignored.
    pub fn calibrate(&self, table: &CalibrationTable, min_samples: u32) -> CalibrationReport {
        let mut report = CalibrationReport::default();

        for venue in Venue::ALL {
            let previous = self.params(venue);
            let calibration = fit_venue(venue, previous, table, min_samples);
            if let Some(updated) = calibration.updated {
                self.set_params(venue, updated);
                info!(
                    %venue,
                    base_probability = updated.base_probability,
                    half_life_ms = updated.half_life_ms,
                    samples = calibration.samples,
                    "Race model recalibrated"
                );
            } else {
                debug!(%venue, note = %calibration.note, "Race model calibration skipped");
            }
            report.venues.push(calibration);
        }

        report
    }
}

/// Calibration result for one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueCalibration {
    pub venue: Venue,
    pub previous: RaceParams,
    pub updated: Option<RaceParams>,
    pub samples: u32,
    pub note: String,
}

/// Outcome of [`RaceModel::calibrate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub venues: Vec<VenueCalibration>,
}

impl CalibrationReport {
    /// True if any venue's parameters changed.
    #[must_use]
    pub fn any_updated(&self) -> bool {
        self.venues.iter().any(|v| v.updated.is_some())
    }
}

/// Aggregate of one age bucket across queue levels.
struct AgeSample {
    mean_age_ms: f64,
    attempts: u32,
    fills: u32,
    mean_queue_factor: f64,
}

fn fit_venue(
    venue: Venue,
    previous: RaceParams,
    table: &CalibrationTable,
    min_samples: u32,
) -> VenueCalibration {
    let mut by_age: Vec<(i64, AgeSample)> = Vec::new();
    for bucket in table.buckets.iter().filter(|b| b.venue == venue) {
        let q = queue_factor(&previous, bucket.queue_level);
        match by_age.iter_mut().find(|(lo, _)| *lo == bucket.age_lo_ms) {
            Some((_, sample)) => {
                let total = f64::from(sample.attempts + bucket.attempts);
                if total > 0.0 {
                    sample.mean_age_ms = (sample.mean_age_ms * f64::from(sample.attempts)
                        + bucket.mean_book_age_ms * f64::from(bucket.attempts))
                        / total;
                    sample.mean_queue_factor = (sample.mean_queue_factor
                        * f64::from(sample.attempts)
                        + q * f64::from(bucket.attempts))
                        / total;
                }
                sample.attempts += bucket.attempts;
                sample.fills += bucket.fills;
            }
            None => by_age.push((
                bucket.age_lo_ms,
                AgeSample {
                    mean_age_ms: bucket.mean_book_age_ms,
                    attempts: bucket.attempts,
                    fills: bucket.fills,
                    mean_queue_factor: q,
                },
            )),
        }
    }
    by_age.sort_by_key(|(lo, _)| *lo);

    let usable: Vec<&AgeSample> = by_age
        .iter()
        .map(|(_, s)| s)
        .filter(|s| s.attempts >= min_samples && s.mean_queue_factor > 0.0)
        .collect();
    let samples = by_age.iter().map(|(_, s)| s.attempts).sum();

    let Some(fresh) = usable.first() else {
        return VenueCalibration {
            venue,
            previous,
            updated: None,
            samples,
            note: format!("no age bucket with at least {min_samples} attempts"),
        };
    };

    let mut updated = previous;
    let (lower, _) = wilson_ci(fresh.fills, fresh.attempts, WILSON_Z);
    updated.base_probability =
        (lower / fresh.mean_queue_factor).clamp(previous.floor_probability, 1.0);

    let mut note = String::from("base re-estimated");
    if let Some(older) = usable.last().filter(|s| s.mean_age_ms > fresh.mean_age_ms) {
        let r0 = f64::from(fresh.fills) / f64::from(fresh.attempts) / fresh.mean_queue_factor;
        let r1 = f64::from(older.fills) / f64::from(older.attempts) / older.mean_queue_factor;
        if r1 > 0.0 && r0 > r1 {
            let half_life = (older.mean_age_ms - fresh.mean_age_ms) * std::f64::consts::LN_2
                / (r0 / r1).ln();
            updated.half_life_ms = half_life.clamp(MIN_HALF_LIFE_MS, MAX_HALF_LIFE_MS);
            note.push_str(", half-life fitted");
        } else {
            note.push_str(", no decay observed");
        }
    }

    VenueCalibration {
        venue,
        previous,
        updated: Some(updated),
        samples,
        note,
    }
}

/// Wilson score interval for a binomial proportion.
fn wilson_ci(successes: u32, total: u32, z: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }

    let n = f64::from(total);
    let p = f64::from(successes) / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let spread = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();

    (
        ((center - spread) / denom).max(0.0),
        ((center + spread) / denom).min(1.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill_log::CalibrationBucket;

    fn model() -> RaceModel {
        RaceModel::default()
    }

    // ==================== Curve Tests ====================

    #[test]
    fn test_fresh_deep_queue_approaches_base() {
        let p = model().fill_probability(Venue::Kalshi, 0, 50);
        assert!((p - 0.90).abs() < 1e-6, "p was {p}");
    }

    #[test]
    fn test_decays_with_age() {
        let model = model();
        let fresh = model.fill_probability(Venue::Kalshi, 0, 0);
        let half = model.fill_probability(Venue::Kalshi, 2_000, 0);
        assert!((half - fresh / 2.0).abs() < 1e-9);
        assert!(model.fill_probability(Venue::Kalshi, 4_000, 0) < half);
    }

    #[test]
    fn test_monotonic_in_queue_depth() {
        let model = model();
        let mut last = 0.0;
        for i in 0..10 {
            let p = model.fill_probability(Venue::Polymarket, 500, i);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_never_below_floor() {
        let model = model();
        let p = model.fill_probability(Venue::Kalshi, 10_000_000, 0);
        assert!((p - 0.05).abs() < f64::EPSILON);
        assert!(p > 0.0);
    }

    #[test]
    fn test_negative_age_treated_as_fresh() {
        let model = model();
        assert_eq!(
            model.fill_probability(Venue::Kalshi, -500, 1),
            model.fill_probability(Venue::Kalshi, 0, 1)
        );
    }

    #[test]
    fn test_update_params_hot_reload() {
        let model = model();
        let before = model.fill_probability(Venue::Kalshi, 1_000, 0);

        let mut params = model.all_params();
        params.kalshi.half_life_ms = 500.0;
        model.update_params(params);

        assert!(model.fill_probability(Venue::Kalshi, 1_000, 0) < before);
        assert!((model.params(Venue::Polymarket).half_life_ms - 2_000.0).abs() < f64::EPSILON);
    }

    // ==================== Calibration Tests ====================

    fn bucket(age_lo: i64, mean_age: f64, attempts: u32, fills: u32) -> CalibrationBucket {
        CalibrationBucket {
            venue: Venue::Kalshi,
            age_lo_ms: age_lo,
            age_hi_ms: None,
            queue_level: 3,
            attempts,
            fills,
            predicted_sum: 0.0,
            mean_book_age_ms: mean_age,
        }
    }

    #[test]
    fn test_calibrate_fits_half_life_and_base() {
        let model = model();
        let table = CalibrationTable {
            buckets: vec![bucket(0, 100.0, 100, 90), bucket(2_000, 2_100.0, 100, 45)],
        };

        let report = model.calibrate(&table, 30);
        assert!(report.any_updated());

        let params = model.params(Venue::Kalshi);
        assert!((params.half_life_ms - 2_000.0).abs() < 1e-6);
        // Wilson lower bound keeps the base below the naive estimate
        let naive = 0.9 / queue_factor(&params, 3);
        assert!(params.base_probability < naive);
        assert!(params.base_probability > 0.8);

        // Polymarket had no data
        let poly = report
            .venues
            .iter()
            .find(|v| v.venue == Venue::Polymarket)
            .unwrap();
        assert!(poly.updated.is_none());
        assert_eq!(model.params(Venue::Polymarket), RaceParams::default());
    }

    #[test]
    fn test_calibrate_ignores_thin_buckets() {
        let model = model();
        let table = CalibrationTable {
            buckets: vec![bucket(0, 100.0, 5, 5)],
        };
        let report = model.calibrate(&table, 30);
        assert!(!report.any_updated());
        assert_eq!(model.params(Venue::Kalshi), RaceParams::default());
    }

    #[test]
    fn test_wilson_ci_50_percent_with_100_samples() {
        let (lower, upper) = wilson_ci(50, 100, 1.96);
        assert!(lower > 0.39 && lower < 0.42, "lower was {lower}");
        assert!(upper > 0.58 && upper < 0.61, "upper was {upper}");
    }
}
