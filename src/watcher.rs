// Configuration file watcher for hot reload

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long the file must stay untouched before it is read again.
pub const QUIET_PERIOD: Duration = Duration::from_millis(250);

/// Watches one config file and reports every change to it.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<()>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver of change notifications.
    pub fn new(path: impl AsRef<Path>) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            ConfigWatcher {
                path: path.as_ref().to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Starts watching. Events stop when the returned handle is dropped.
    ///
    /// The parent directory is watched rather than the file so that editors
    /// which replace the file on save are still picked up.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher { path, update_tx } = self;

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());
        let changed_path = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }

                    let touches_config = event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_config {
                        return;
                    }

                    tracing::debug!(path = %changed_path.display(), "Config file change detected");
                    let _ = update_tx.send(());
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default(),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}

/// Waits for a change, then for `quiet` to pass with no further change.
///
/// A single save usually arrives as several events (truncate, then write);
/// reading after the first one would see a partial file. `None` once the
/// watcher is gone.
pub async fn settled(changes: &mut mpsc::UnboundedReceiver<()>, quiet: Duration) -> Option<()> {
    changes.recv().await?;

    loop {
        match tokio::time::timeout(quiet, changes.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) | Err(_) => return Some(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_settled_collapses_bursts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }

        let started = Instant::now();
        assert_eq!(settled(&mut rx, Duration::from_millis(50)).await, Some(()));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_settled_waits_for_late_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();

        let late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = late.send(());
        });

        settled(&mut rx, Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_settled_ends_when_watcher_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        drop(tx);

        assert_eq!(settled(&mut rx, Duration::from_millis(10)).await, None);
    }
}
