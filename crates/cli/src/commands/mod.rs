//! CLI commands for the xarb engine.

pub mod calibrate;
pub mod check_config;
pub mod duration;
pub mod feed;
pub mod run;

pub use calibrate::{run_calibrate, CalibrateArgs};
pub use check_config::{run_check_config, CheckConfigArgs};
pub use run::{run_engine, RunArgs};
