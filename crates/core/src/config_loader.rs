use crate::config::EngineConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

/// Default location of the engine config file.
pub const DEFAULT_CONFIG_PATH: &str = "config/xarb.toml";

/// Prefix for environment overrides, e.g. `XARB_RISK__MAX_DAILY_LOSS=150`.
pub const ENV_PREFIX: &str = "XARB_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the engine configuration from [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn load() -> Result<EngineConfig> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads the engine configuration by layering built-in defaults, the
    /// given file (TOML, or JSON when the extension is `.json`) and
    /// `XARB_`-prefixed environment variables.
    ///
    /// A missing file is not an error; the defaults and environment apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };

        let config: EngineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Loads a base file plus a profile overlay such as `config/xarb.paper.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be parsed or the result fails validation.
    pub fn load_with_profile(path: impl AsRef<Path>, profile: &str) -> Result<EngineConfig> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "xarb".to_string());
        let overlay = path.with_file_name(format!("{stem}.{profile}.toml"));

        let config: EngineConfig = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Toml::file(&overlay))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load config profile {profile}"))?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
mode = "maker_hedge"
scan_interval_ms = 500

[risk]
max_daily_loss = 150

[race.polymarket]
half_life_ms = 750.0

[fees.polymarket]
model = "zero"

[[events]]
event_id = "btc-100k"
kalshi_instrument = "KXBTC-100K"
polymarket_instrument = "0xbtc100k"
"#;

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "xarb.toml", SAMPLE);

        let config = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(config.mode, ExecutionMode::MakerHedge);
        assert_eq!(config.scan_interval, Duration::from_millis(500));
        assert_eq!(config.risk.max_daily_loss, dec!(150));
        assert!((config.race.polymarket.half_life_ms - 750.0).abs() < f64::EPSILON);
        assert!((config.race.kalshi.half_life_ms - 2_000.0).abs() < f64::EPSILON);
        assert_eq!(config.fees.polymarket, crate::config::FeeModel::Zero);
        assert_eq!(config.events.len(), 1);
        assert_eq!(config.events[0].outcome_code, "YES");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.scan_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "bad.toml", "[risk]\nmax_daily_loss = 0\n");
        assert!(ConfigLoader::load_from(&path).is_err());
    }

    #[test]
    fn test_profile_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_config(&dir, "xarb.toml", SAMPLE);
        write_config(&dir, "xarb.paper.toml", "mode = \"taker\"\n");

        let config = ConfigLoader::load_with_profile(&base, "paper").unwrap();
        assert_eq!(config.mode, ExecutionMode::Taker);
        assert_eq!(config.risk.max_daily_loss, dec!(150));
    }
}
