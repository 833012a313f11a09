//! `xarb check-config`: load, validate and print the effective config.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use xarb_core::{ConfigLoader, EngineConfig};

/// Arguments for the check-config command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Config file path (TOML or JSON)
    #[arg(short, long, default_value = "config/xarb.toml")]
    pub config: PathBuf,

    /// Layer `<stem>.<profile>.toml` over the base file
    #[arg(long)]
    pub profile: Option<String>,
}

/// Loads the layered config and prints it as JSON.
///
/// # Errors
///
/// Returns an error if the config fails to parse or validate.
pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = load(args)?;
    tracing::info!(
        path = %args.config.display(),
        mode = %config.mode,
        events = config.events.len(),
        "Configuration valid"
    );
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn load(args: &CheckConfigArgs) -> Result<EngineConfig> {
    match &args.profile {
        Some(profile) => ConfigLoader::load_with_profile(&args.config, profile),
        None => ConfigLoader::load_from(&args.config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Check Config Tests ====================

    #[test]
    fn test_profile_overlays_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("xarb.toml");
        std::fs::write(&base, "mode = \"taker\"\n[detector]\nmin_edge_bps = \"150\"\n").unwrap();
        std::fs::write(dir.path().join("xarb.live.toml"), "mode = \"maker_hedge\"\n").unwrap();

        let args = CheckConfigArgs {
            config: base,
            profile: Some("live".to_string()),
        };
        let config = load(&args).unwrap();
        assert_eq!(config.mode, xarb_core::ExecutionMode::MakerHedge);
        assert_eq!(config.detector.min_edge_bps, rust_decimal_macros::dec!(150));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("xarb.toml");
        std::fs::write(&base, "[risk]\nmax_daily_loss = \"-5\"\n").unwrap();

        let args = CheckConfigArgs {
            config: base,
            profile: None,
        };
        assert!(run_check_config(&args).is_err());
    }
}
