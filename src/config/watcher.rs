//! Hot reload of the configuration file
//!
//! The file's directory is watched rather than the file itself, so editors
//! that save by replacing the file keep triggering reloads. Bursts of events
//! collapse into one reload after a short quiet period, and a reload that
//! parses to the configuration already delivered is not forwarded.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period before re-reading
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Yields each changed, parseable configuration
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

fn touches(event: &Event, file: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|p| p.file_name() == file.file_name())
}

impl ConfigWatcher {
    /// Start watching `config_path`. Returns the watcher and the config as
    /// currently on disk.
    pub async fn new(config_path: String) -> Result<(Self, AppConfig)> {
        let initial = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let file = PathBuf::from(&config_path);
        let dir = match file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // notify calls back on its own thread; only a wake-up crosses over
        let (wake_tx, wake_rx) = mpsc::channel::<()>(1);
        let watched = file.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if touches(&event, &watched) => {
                debug!("Config file event: {:?}", event.kind);
                let _ = wake_tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => error!("Watch error: {}", e),
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config directory: {}", dir.display()))?;

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(reload_loop(config_path.clone(), initial.clone(), wake_rx, tx));

        info!("Watching {} for changes", config_path);
        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial,
        ))
    }

    /// Next changed configuration; `None` once the watcher is gone
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

async fn reload_loop(
    path: String,
    mut current: AppConfig,
    mut wake_rx: mpsc::Receiver<()>,
    tx: mpsc::Sender<AppConfig>,
) {
    while wake_rx.recv().await.is_some() {
        // Wait until the writes stop
        loop {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            if wake_rx.try_recv().is_err() {
                break;
            }
        }

        match AppConfig::load(&path).await {
            Ok(config) if config == current => debug!("Config rewritten without changes"),
            Ok(config) => {
                info!("Configuration reloaded");
                current = config.clone();
                if tx.send(config).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Failed to reload config (keeping old config): {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_burst_of_writes_yields_final_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "mixer:\n  host: \"192.168.1.20\"\n")?;

        let (mut watcher, config) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        assert_eq!(config.mixer.host.as_deref(), Some("192.168.1.20"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, "mixer:\n  host: \"192.168.1.21\"\n")?;
        fs::write(&config_path, "mixer:\n  host: \"192.168.1.22\"\n")?;

        let new_config = tokio::time::timeout(Duration::from_secs(2), watcher.next_config()).await?;

        // Some platforms coalesce or miss events in temp dirs
        if let Some(new_config) = new_config {
            assert_eq!(new_config.mixer.host.as_deref(), Some("192.168.1.22"));
            assert!(config.endpoint_changed(&new_config));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unrelated_file_is_ignored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "mixer:\n  port: 10024\n")?;

        let (mut watcher, _) = ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(temp_dir.path().join("other.yaml"), "mixer:\n  port: 1\n")?;
        // Same content again: parsed but not forwarded
        fs::write(&config_path, "mixer:\n  port: 10024\n")?;

        let next = tokio::time::timeout(Duration::from_millis(500), watcher.next_config()).await;
        assert!(next.is_err(), "unexpected reload: {:?}", next);
        Ok(())
    }
}
