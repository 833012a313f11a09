//! Engine configuration.
//!
//! Every section has a serde default, so a config file only needs to name the
//! values it changes. Durations are written in milliseconds.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CanonicalEvent, VenuePair};

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Which execution state machine handles approved opportunities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Rest a passive order on one venue, hedge aggressively on fill.
    MakerHedge,
    /// Cross the spread on both venues at once.
    #[default]
    Taker,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MakerHedge => write!(f, "maker_hedge"),
            Self::Taker => write!(f, "taker"),
        }
    }
}

/// Full engine configuration, read at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution mode for approved opportunities.
    pub mode: ExecutionMode,

    /// Fixed interval between detection scans.
    #[serde(rename = "scan_interval_ms", with = "duration_ms")]
    pub scan_interval: Duration,

    /// Position and loss limits.
    pub risk: RiskLimits,

    /// Opportunity detection thresholds.
    pub detector: DetectorConfig,

    /// Execution timeouts.
    pub execution: ExecutionConfig,

    /// Fill-probability model parameters per venue. Hot-reloadable.
    pub race: VenuePair<RaceParams>,

    /// Fee model per venue.
    pub fees: VenuePair<FeeModel>,

    /// Optional JSONL file receiving every execution resolution.
    pub fill_log_path: Option<PathBuf>,

    /// Canonical event table.
    pub events: Vec<CanonicalEvent>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            scan_interval: Duration::from_secs(1),
            risk: RiskLimits::default(),
            detector: DetectorConfig::default(),
            execution: ExecutionConfig::default(),
            race: VenuePair::splat(RaceParams::default()),
            fees: VenuePair::new(FeeModel::kalshi_default(), FeeModel::polymarket_default()),
            fill_log_path: None,
            events: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Sets the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the event table.
    #[must_use]
    pub fn with_events(mut self, events: Vec<CanonicalEvent>) -> Self {
        self.events = events;
        self
    }

    /// Sets the risk limits.
    #[must_use]
    pub fn with_risk(mut self, risk: RiskLimits) -> Self {
        self.risk = risk;
        self
    }

    /// Sets the detector configuration.
    #[must_use]
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval.is_zero() {
            bail!("scan_interval_ms must be positive");
        }
        self.risk.validate()?;
        self.detector.validate()?;
        self.execution.validate()?;
        self.race.kalshi.validate()?;
        self.race.polymarket.validate()?;
        for event in &self.events {
            if event.event_id.is_empty()
                || event.kalshi_instrument.is_empty()
                || event.polymarket_instrument.is_empty()
            {
                bail!("event entries need event_id, kalshi_instrument and polymarket_instrument");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Risk Limits
// =============================================================================

/// Limits enforced by the risk manager before any order is sent.
///
/// Exposure is measured as capital at risk: `size * price` for a long YES
/// position and `size * (1 - price)` for a short one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum contracts per trade. Larger opportunities are resized.
    pub max_trade_size: Decimal,

    /// Smallest trade worth sending after resizing.
    pub min_trade_size: Decimal,

    /// Maximum capital at risk on one event, including in-flight attempts.
    pub max_event_exposure: Decimal,

    /// Maximum capital at risk across all events.
    pub max_portfolio_exposure: Decimal,

    /// Daily loss (positive dollars) at which the kill switch trips.
    pub max_daily_loss: Decimal,

    /// Consecutive losing or failed attempts before trading pauses.
    pub max_consecutive_losses: u32,

    /// How long trading pauses after the consecutive-loss limit.
    #[serde(rename = "loss_pause_ms", with = "duration_ms")]
    pub loss_pause: Duration,

    /// Whether low-confidence opportunities may trade.
    pub allow_low_confidence: bool,

    /// Number of rejection records kept for export.
    pub rejection_history: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trade_size: dec!(500),
            min_trade_size: dec!(5),
            max_event_exposure: dec!(1000),
            max_portfolio_exposure: dec!(5000),
            max_daily_loss: dec!(200),
            max_consecutive_losses: 3,
            loss_pause: Duration::from_secs(300),
            allow_low_confidence: false,
            rejection_history: 512,
        }
    }
}

impl RiskLimits {
    /// Creates conservative limits for initial live testing.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_trade_size: dec!(50),
            min_trade_size: dec!(5),
            max_event_exposure: dec!(100),
            max_portfolio_exposure: dec!(500),
            max_daily_loss: dec!(50),
            max_consecutive_losses: 2,
            loss_pause: Duration::from_secs(900),
            allow_low_confidence: false,
            rejection_history: 512,
        }
    }

    /// Sets the maximum daily loss.
    #[must_use]
    pub fn with_max_daily_loss(mut self, max: Decimal) -> Self {
        self.max_daily_loss = max;
        self
    }

    /// Sets the per-trade size cap.
    #[must_use]
    pub fn with_max_trade_size(mut self, max: Decimal) -> Self {
        self.max_trade_size = max;
        self
    }

    /// Sets the per-event exposure cap.
    #[must_use]
    pub fn with_max_event_exposure(mut self, max: Decimal) -> Self {
        self.max_event_exposure = max;
        self
    }

    /// Sets the portfolio exposure cap.
    #[must_use]
    pub fn with_max_portfolio_exposure(mut self, max: Decimal) -> Self {
        self.max_portfolio_exposure = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_trade_size <= Decimal::ZERO || self.min_trade_size <= Decimal::ZERO {
            bail!("risk.max_trade_size and risk.min_trade_size must be positive");
        }
        if self.min_trade_size > self.max_trade_size {
            bail!("risk.min_trade_size exceeds risk.max_trade_size");
        }
        if self.max_daily_loss <= Decimal::ZERO {
            bail!("risk.max_daily_loss must be positive");
        }
        if self.max_event_exposure > self.max_portfolio_exposure {
            bail!("risk.max_event_exposure exceeds risk.max_portfolio_exposure");
        }
        Ok(())
    }
}

// =============================================================================
// Detector Configuration
// =============================================================================

/// Thresholds applied when scanning for opportunities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum net edge after slippage and fees, in basis points.
    pub min_edge_bps: Decimal,

    /// Maximum price move from top of book allowed while walking, in bps.
    pub max_slippage_bps: Decimal,

    /// Books at or beyond this age are ignored.
    pub max_staleness_ms: i64,

    /// Contracts requested from each book per evaluation.
    pub candidate_size: Decimal,

    /// Per-leg fill probability below which confidence drops to low.
    pub min_fill_probability: f64,

    /// Per-leg fill probability at or above which confidence is high.
    pub high_confidence_probability: f64,

    /// Number of detected opportunities kept for export.
    pub opportunity_history: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_edge_bps: dec!(100),
            max_slippage_bps: dec!(200),
            max_staleness_ms: 2_000,
            candidate_size: dec!(100),
            min_fill_probability: 0.5,
            high_confidence_probability: 0.8,
            opportunity_history: 256,
        }
    }
}

impl DetectorConfig {
    /// Creates a conservative configuration for lower risk.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            min_edge_bps: dec!(200),
            max_slippage_bps: dec!(100),
            max_staleness_ms: 1_000,
            candidate_size: dec!(50),
            min_fill_probability: 0.6,
            high_confidence_probability: 0.85,
            opportunity_history: 256,
        }
    }

    /// Creates an aggressive configuration for more opportunities.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            min_edge_bps: dec!(50),
            max_slippage_bps: dec!(300),
            max_staleness_ms: 3_000,
            candidate_size: dec!(250),
            min_fill_probability: 0.4,
            high_confidence_probability: 0.75,
            opportunity_history: 256,
        }
    }

    /// Sets the minimum edge.
    #[must_use]
    pub fn with_min_edge_bps(mut self, bps: Decimal) -> Self {
        self.min_edge_bps = bps;
        self
    }

    /// Sets the slippage bound.
    #[must_use]
    pub fn with_max_slippage_bps(mut self, bps: Decimal) -> Self {
        self.max_slippage_bps = bps;
        self
    }

    /// Sets the staleness bound.
    #[must_use]
    pub fn with_max_staleness_ms(mut self, ms: i64) -> Self {
        self.max_staleness_ms = ms;
        self
    }

    /// Sets the candidate size.
    #[must_use]
    pub fn with_candidate_size(mut self, size: Decimal) -> Self {
        self.candidate_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.candidate_size <= Decimal::ZERO {
            bail!("detector.candidate_size must be positive");
        }
        if self.max_slippage_bps < Decimal::ZERO {
            bail!("detector.max_slippage_bps must not be negative");
        }
        if self.max_staleness_ms <= 0 {
            bail!("detector.max_staleness_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_fill_probability)
            || !(0.0..=1.0).contains(&self.high_confidence_probability)
        {
            bail!("detector fill probability thresholds must lie in [0, 1]");
        }
        if self.min_fill_probability > self.high_confidence_probability {
            bail!("detector.min_fill_probability exceeds high_confidence_probability");
        }
        Ok(())
    }
}

// =============================================================================
// Execution Configuration
// =============================================================================

/// Timeouts bounding every wait in the execution state machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How long a resting maker order waits for a fill.
    #[serde(rename = "maker_timeout_ms", with = "duration_ms")]
    pub maker_timeout: Duration,

    /// How long an aggressive order waits for its fill report.
    #[serde(rename = "taker_timeout_ms", with = "duration_ms")]
    pub taker_timeout: Duration,

    /// Bound on a single place or cancel round trip.
    #[serde(rename = "rpc_timeout_ms", with = "duration_ms")]
    pub rpc_timeout: Duration,

    /// Maximum attempts running at once.
    pub max_concurrent_attempts: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            maker_timeout: Duration::from_secs(10),
            taker_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_millis(1_500),
            max_concurrent_attempts: 4,
        }
    }
}

impl ExecutionConfig {
    fn validate(&self) -> Result<()> {
        if self.maker_timeout.is_zero() || self.taker_timeout.is_zero() || self.rpc_timeout.is_zero()
        {
            bail!("execution timeouts must be positive");
        }
        if self.max_concurrent_attempts == 0 {
            bail!("execution.max_concurrent_attempts must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Race Model Parameters
// =============================================================================

/// Fill-probability curve for one venue.
///
/// `p = max(floor, base * 0.5^(age / half_life) * q(i))` with
/// `q(i) = queue_floor + (1 - queue_floor) * (1 - exp(-i / queue_scale))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceParams {
    /// Fill probability of a fresh quote at the deepest queue position.
    pub base_probability: f64,
    /// Book age at which the probability halves.
    pub half_life_ms: f64,
    /// Queue factor at the top level.
    pub queue_floor: f64,
    /// Levels over which the queue factor approaches 1.
    pub queue_scale: f64,
    /// Lower clamp, strictly positive.
    pub floor_probability: f64,
}

impl Default for RaceParams {
    fn default() -> Self {
        Self {
            base_probability: 0.90,
            half_life_ms: 2_000.0,
            queue_floor: 0.60,
            queue_scale: 2.0,
            floor_probability: 0.05,
        }
    }
}

impl RaceParams {
    fn validate(&self) -> Result<()> {
        if !(self.base_probability > 0.0 && self.base_probability <= 1.0) {
            bail!("race.base_probability must lie in (0, 1]");
        }
        if !(self.floor_probability > 0.0 && self.floor_probability <= self.base_probability) {
            bail!("race.floor_probability must lie in (0, base_probability]");
        }
        if self.half_life_ms <= 0.0 || self.queue_scale <= 0.0 {
            bail!("race.half_life_ms and race.queue_scale must be positive");
        }
        if !(0.0..=1.0).contains(&self.queue_floor) {
            bail!("race.queue_floor must lie in [0, 1]");
        }
        Ok(())
    }
}

// =============================================================================
// Fee Models
// =============================================================================

/// Deterministic fee rule for one venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum FeeModel {
    /// `ceil_to_cent(rate * contracts * price * (1 - price))`.
    Kalshi { rate: Decimal },
    /// `rate * price * contracts`.
    Proportional { rate: Decimal },
    /// No trading fee.
    Zero,
}

impl FeeModel {
    /// Kalshi's published taker schedule.
    #[must_use]
    pub fn kalshi_default() -> Self {
        Self::Kalshi { rate: dec!(0.07) }
    }

    /// Polymarket's CLOB trading fee.
    #[must_use]
    pub fn polymarket_default() -> Self {
        Self::Proportional { rate: dec!(0.0001) }
    }
}

// =============================================================================
// Duration Serde Helper
// =============================================================================

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
