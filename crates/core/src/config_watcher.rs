use crate::config::EngineConfig;
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Publishes a fresh [`EngineConfig`] whenever the config file changes.
///
/// Reloads that fail to parse or validate are logged and dropped, so
/// subscribers only ever see valid configurations.
pub struct ConfigWatcher {
    tx: watch::Sender<EngineConfig>,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Creates a watcher for `path`, seeded with the already-loaded config.
    ///
    /// Returns a tuple of the watcher and a receiver for configuration updates.
    #[must_use]
    pub fn new(
        initial_config: EngineConfig,
        path: impl Into<PathBuf>,
    ) -> (Self, watch::Receiver<EngineConfig>) {
        let (tx, rx) = watch::channel(initial_config);
        (
            Self {
                tx,
                path: path.into(),
            },
            rx,
        )
    }

    /// Returns the watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file once and publishes it if valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the file fails to load or validate.
    pub fn reload(&self) -> Result<()> {
        let config = ConfigLoader::load_from(&self.path)?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Watches the configuration file for changes and broadcasts updates.
    ///
    /// Runs until every receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(&self) -> Result<()> {
        let tx = self.tx.clone();
        let config_path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(&config_path, RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if !event.kind.is_modify() {
                    continue;
                }
                tracing::info!(path = %config_path.display(), "Config file changed, reloading");
                match ConfigLoader::load_from(&config_path) {
                    Ok(new_config) => {
                        if tx.send(new_config).is_err() {
                            break;
                        }
                        tracing::info!("Config reloaded successfully");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload config, keeping previous");
                    }
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reload_publishes_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xarb.toml");
        std::fs::write(&path, "[risk]\nmax_daily_loss = 75\n").unwrap();

        let (watcher, rx) = ConfigWatcher::new(EngineConfig::default(), &path);
        assert_eq!(rx.borrow().risk.max_daily_loss, dec!(200));

        watcher.reload().unwrap();
        assert_eq!(rx.borrow().risk.max_daily_loss, dec!(75));
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xarb.toml");
        std::fs::write(&path, "[race.kalshi]\nfloor_probability = 0.0\n").unwrap();

        let (watcher, rx) = ConfigWatcher::new(EngineConfig::default(), &path);
        assert!(watcher.reload().is_err());
        assert!(rx.borrow().race.kalshi.floor_probability > 0.0);
    }
}
