//! `xarb calibrate`: refit race model parameters from a fill log.
//!
//! Reads the JSONL fill log written by a previous run, buckets every leg by
//! venue, book age and queue position, and fits `base_probability` and
//! `half_life_ms` per venue starting from the configured parameters.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use xarb_arbitrage_cross::{BucketLayout, CalibrationReport, FillLogger, RaceModel};
use xarb_core::ConfigLoader;

/// Arguments for the calibrate command.
#[derive(Args, Debug, Clone)]
pub struct CalibrateArgs {
    /// JSONL fill log to replay
    #[arg(long)]
    pub fill_log: PathBuf,

    /// Config file providing the starting race parameters
    #[arg(short, long, default_value = "config/xarb.toml")]
    pub config: PathBuf,

    /// Minimum attempts for a bucket to be used
    #[arg(long, default_value = "30")]
    pub min_samples: u32,

    /// Print per-bucket fill rates as well as the fit
    #[arg(long)]
    pub show_buckets: bool,
}

/// Replays the log, fits the model and prints the result as JSON.
///
/// # Errors
///
/// Returns an error if the config or the fill log cannot be read.
pub fn run_calibrate(args: &CalibrateArgs) -> Result<()> {
    let config = ConfigLoader::load_from(&args.config)?;
    let report = calibrate(args, config.race)?;

    for venue in &report.venues {
        match &venue.updated {
            Some(updated) => tracing::info!(
                venue = %venue.venue,
                samples = venue.samples,
                base_probability = %format!("{:.3} -> {:.3}", venue.previous.base_probability, updated.base_probability),
                half_life_ms = %format!("{:.0} -> {:.0}", venue.previous.half_life_ms, updated.half_life_ms),
                "Race parameters refit"
            ),
            None => tracing::info!(
                venue = %venue.venue,
                samples = venue.samples,
                note = %venue.note,
                "Race parameters unchanged"
            ),
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn calibrate(
    args: &CalibrateArgs,
    starting: xarb_core::VenuePair<xarb_core::RaceParams>,
) -> Result<CalibrationReport> {
    let log = FillLogger::replay(&args.fill_log)?;
    let table = log.calibration_table(&BucketLayout::default());
    tracing::info!(
        entries = log.len(),
        buckets = table.buckets.len(),
        attempts = table.total_attempts(),
        "Calibration table built"
    );

    if args.show_buckets {
        for bucket in &table.buckets {
            println!(
                "{:<11} age {:>5}-{:<5}ms  queue {}  attempts {:>5}  fill rate {:.3}  predicted {:.3}",
                bucket.venue.to_string(),
                bucket.age_lo_ms,
                bucket.age_hi_ms.map_or_else(|| "inf".to_string(), |hi| hi.to_string()),
                bucket.queue_level,
                bucket.attempts,
                bucket.fill_rate(),
                bucket.mean_predicted(),
            );
        }
    }

    let model = RaceModel::new(starting);
    Ok(model.calibrate(&table, args.min_samples))
}
