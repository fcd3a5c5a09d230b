//! Configuration file watcher for hot reload.
//!
//! Filesystem notifications arrive on a notify thread; they are coalesced on
//! the tokio side so an editor's write-rename-chmod burst triggers one reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// Quiet period after the last notification before the file is re-read.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Watches the configuration file and publishes validated reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Create a watcher and the receiver that yields reloaded configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned notify handle must be kept alive for as
    /// long as reloads are wanted.
    pub fn run(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<RecommendedWatcher, notify::Error> {
        let (touch_tx, touch_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = touch_tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        tokio::spawn(reload_loop(self.path, touch_rx, self.update_tx, shutdown));
        Ok(watcher)
    }
}

async fn reload_loop(
    path: PathBuf,
    mut touches: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<GatewayConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            touched = touches.recv() => {
                if touched.is_none() {
                    break;
                }
                // Drain the burst.
                while let Ok(Some(())) = tokio::time::timeout(DEBOUNCE, touches.recv()).await {}

                match load_config(&path) {
                    Ok(config) => {
                        tracing::info!(path = ?path, "Configuration reloaded");
                        if updates.send(config).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload config; keeping current policies");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Config reload loop stopped");
}
