//! Shared types and configuration for the xarb cross-venue arbitrage engine.
//!
//! - [`types`]: venues, order book levels, canonical events, normalized feed messages
//! - [`config`]: engine configuration with per-section defaults
//! - [`config_loader`]: figment-based layered loading (file + `XARB_` env)
//! - [`config_watcher`]: file watching for hot reload

pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod types;

pub use config::{
    DetectorConfig, EngineConfig, ExecutionConfig, ExecutionMode, FeeModel, RaceParams, RiskLimits,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use types::{
    BookEvent, BookEventKind, CanonicalEvent, EventTable, OrderLevel, Side, Venue, VenuePair,
};
