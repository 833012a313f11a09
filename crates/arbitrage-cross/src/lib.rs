//! Depth-aware cross-venue arbitrage between Kalshi and Polymarket.
//!
//! When the same binary event is priced differently on the two venues,
//! buying YES where it is cheap and selling it (buying the complementary NO)
//! where it is rich locks in the spread:
//!
//! ```text
//! Kalshi:     ask 0.46 x 100
//! Polymarket: bid 0.51 x 100
//!
//! Buy 100 YES on Kalshi @ 0.46, sell 100 YES on Polymarket @ 0.51
//!   capital per contract: 0.46 + (1 - 0.51) = 0.95
//!   gross edge:           500 bps
//! ```
//!
//! Top-of-book prices overstate what is actually fillable, so every price
//! here is a VWAP over the depth the size consumes, and every leg carries a
//! fill probability from the [`race`] model that shrinks the recommended
//! size when books are old or the leg sits behind a queue.
//!
//! # Pipeline
//!
//! - [`orderbook`]: per-venue books with lock-free snapshot reads
//! - [`depth`]: walk a ladder for VWAP, slippage and executable size
//! - [`race`]: staleness and queue-position fill probability
//! - [`fees`]: venue-keyed fee rules
//! - [`detector`]: reconcile both venues and score opportunities
//! - [`risk`] and [`inventory`]: exposure limits, kill switch, positions
//! - [`executor`]: maker-hedge and taker-taker state machines
//! - [`venue`] and [`paper`]: order gateway trait, fill routing, simulated venue
//! - [`fill_log`]: append-only execution history for calibration
//! - [`alerts`]: structured alerts for one-sided fills and kill switch trips
//! - [`engine`]: composition root and scan loop
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xarb_arbitrage_cross::{ArbEngine, FillRouter, PaperFillPolicy, PaperVenue};
//! use xarb_core::{ConfigLoader, VenuePair};
//!
//! let config = ConfigLoader::load_from("xarb.toml")?;
//! let fills = Arc::new(FillRouter::new());
//! let venue = PaperVenue::new(VenuePair::splat(PaperFillPolicy::default()), Arc::clone(&fills));
//! let engine = Arc::new(ArbEngine::new(config, Arc::new(venue), fills)?);
//!
//! engine.spawn_feed(book_rx);
//! engine.run(shutdown_rx).await;
//! ```

pub mod alerts;
pub mod depth;
pub mod detector;
pub mod engine;
pub mod executor;
pub mod fees;
pub mod fill_log;
pub mod inventory;
pub mod orderbook;
pub mod paper;
pub mod race;
pub mod risk;
pub mod venue;

// Re-export main types for convenience
pub use alerts::{Alert, AlertChannel, AlertKind, AlertSeverity, CancelOutcome, OneSidedDetails};
pub use depth::{walk_book, ExecutableQuote};
pub use detector::{
    ArbDetector, ArbOpportunity, Confidence, DetectionSummary, LegQuote, NoOpportunity,
    OpportunityKey,
};
pub use engine::{ArbEngine, BotHealth, EngineStats, ScanReport};
pub use executor::{
    ArbExecutor, AttemptOutcome, AttemptState, ExecutionAttempt, ExecutionError, LegRole,
    MakerHedgeExecutor, OrderRecord, TakerExecutor,
};
pub use fees::FeeSchedule;
pub use fill_log::{BucketLayout, CalibrationBucket, CalibrationTable, FillLogEntry, FillLogger};
pub use inventory::{FillRecord, InventoryTracker, NetPosition, Position};
pub use orderbook::{BookError, BookSummary, BookView, OrderbookManager, OrderbookSnapshot};
pub use paper::{PaperFillPolicy, PaperVenue};
pub use race::{CalibrationReport, RaceModel};
pub use risk::{RejectReason, RiskDecision, RiskManager, RiskSnapshot};
pub use venue::{
    ClosedOrder, FillReport, FillRouter, LateFillHandler, OrderRef, OrderRequest, OrderType,
    VenueError, VenueGateway,
};
