// Proxy runtime entry point
// Starts every server plus the metrics endpoint, reloads from the origin file
// when there is one, and blocks until shutdown or failure

use crate::config::{self, ProxyConfig};
use crate::metrics::{self, ProxyMetrics};
use crate::proxy::ProxyServer;
use crate::watcher::{self, ConfigWatcher};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};

/// Runs until Ctrl-C/SIGTERM. An empty `origin_path` disables reload.
pub async fn run(config: ProxyConfig, origin_path: &str) -> Result<()> {
    run_until(config, origin_path, shutdown_signal()).await
}

/// Like [`run`], with the caller choosing what ends a clean run.
pub async fn run_until<F>(config: ProxyConfig, origin_path: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let metrics = Arc::new(ProxyMetrics::new().context("Failed to create metrics registry")?);

    let metrics_task = match &config.metrics {
        Some(address) => {
            let listener = metrics::bind(&address.address()).await?;
            Some(tokio::spawn(metrics::serve(listener, Arc::clone(&metrics))))
        }
        None => None,
    };

    let mut servers = ServerSet::start(&config, &metrics).await?;

    let (_watcher, mut reloads) = if origin_path.is_empty() {
        tracing::debug!("Configuration is not file-backed, reload disabled");
        (None, None)
    } else {
        let (watcher, reloads) = ConfigWatcher::new(origin_path);
        let handle = watcher
            .run()
            .with_context(|| format!("Failed to watch config file {}", origin_path))?;
        (Some(handle), Some(reloads))
    };

    tokio::pin!(shutdown);
    let mut current = config;

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping proxy");
                break Ok(());
            }
            Some((name, outcome)) = servers.join_next() => {
                break Err(match outcome {
                    Err(e) => e.context(format!("Proxy server '{}' failed", name)),
                    Ok(()) => anyhow::anyhow!("Proxy server '{}' stopped unexpectedly", name),
                });
            }
            Some(()) = next_reload(&mut reloads) => {
                let new_config = match config::load(origin_path) {
                    Ok(new_config) => new_config,
                    Err(e) => {
                        tracing::error!(
                            error = %format!("{:#}", anyhow::Error::from(e)),
                            "Invalid config file, keeping current configuration"
                        );
                        metrics.config_reloads_total.with_label_values(&["invalid"]).inc();
                        continue;
                    }
                };

                if new_config == current {
                    tracing::debug!("Config file changed without effect, nothing to reload");
                    continue;
                }

                if new_config.metrics != current.metrics {
                    tracing::warn!("Metrics address changes take effect only after restart");
                }

                servers.shutdown().await;

                match ServerSet::start(&new_config, &metrics).await {
                    Ok(started) => {
                        servers = started;
                        current = new_config;
                        metrics.config_reloads_total.with_label_values(&["success"]).inc();
                        tracing::info!(servers = current.servers.len(), "Configuration reloaded");
                    }
                    Err(e) => {
                        metrics.config_reloads_total.with_label_values(&["failed"]).inc();
                        tracing::error!(
                            error = %format!("{:#}", e),
                            "Failed to apply reloaded configuration, restoring previous one"
                        );

                        match ServerSet::start(&current, &metrics).await {
                            Ok(restored) => servers = restored,
                            Err(e) => break Err(e.context("Failed to restore previous configuration")),
                        }
                    }
                }
            }
        }
    };

    servers.shutdown().await;
    if let Some(task) = metrics_task {
        task.abort();
    }

    result
}

/// Resolves once a burst of file changes has settled.
async fn next_reload(reloads: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match reloads.as_mut() {
        Some(rx) => watcher::settled(rx, watcher::QUIET_PERIOD).await,
        None => std::future::pending().await,
    }
}

/// Running accept loops and the server name behind each task.
struct ServerSet {
    tasks: JoinSet<Result<()>>,
    names: HashMap<task::Id, String>,
}

impl ServerSet {
    /// Binds every listener before spawning any, so a bad server leaves
    /// nothing half started.
    async fn start(config: &ProxyConfig, metrics: &Arc<ProxyMetrics>) -> Result<Self> {
        let mut bound = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            bound.push(ProxyServer::bind(server.clone(), Arc::clone(metrics)).await?);
        }

        let mut set = ServerSet::empty();
        for server in bound {
            let name = server.name().to_string();
            set.spawn(name, server.run());
        }

        Ok(set)
    }

    fn empty() -> Self {
        ServerSet {
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, name: String, server: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(server);
        self.names.insert(handle.id(), name);
    }

    /// Next finished server, named. Panics and cancellations become errors.
    async fn join_next(&mut self) -> Option<(String, Result<()>)> {
        let (id, outcome) = match self.tasks.join_next_with_id().await? {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (e.id(), Err(anyhow::Error::from(e))),
        };

        let name = self
            .names
            .remove(&id)
            .unwrap_or_else(|| format!("task {}", id));
        Some((name, outcome))
    }

    async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
        self.names.clear();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
