// TCP forwarding server
// One ProxyServer per configured server: accept, pick a target, copy both ways

use crate::config::{HostConfig, ServerConfig};
use crate::metrics::ProxyMetrics;
use anyhow::{Context, Result};
use prometheus::IntCounter;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Pause after a failed accept, e.g. when out of file descriptors.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Logs an accept failure and waits before the next accept.
pub(crate) async fn accept_error_backoff(listener: &str, error: &io::Error) {
    tracing::error!(listener = %listener, error = %error, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Rotates the starting target for each new connection.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices to try for one connection: every target once, starting at
    /// the next position in the rotation.
    pub fn order(&self, len: usize) -> impl Iterator<Item = usize> {
        let start = if len == 0 {
            0
        } else {
            self.counter.fetch_add(1, Ordering::Relaxed)
        };

        (0..len).map(move |i| (start + i) % len)
    }
}

struct Shared {
    config: ServerConfig,
    balancer: RoundRobin,
    metrics: Arc<ProxyMetrics>,
}

pub struct ProxyServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl ProxyServer {
    pub async fn bind(config: ServerConfig, metrics: Arc<ProxyMetrics>) -> Result<Self> {
        let bind_addr = config.listener.address();

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind server '{}' to {}", config.name, bind_addr))?;

        Ok(ProxyServer {
            listener,
            shared: Arc::new(Shared {
                config,
                balancer: RoundRobin::new(),
                metrics,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept loop. Connections already handed off keep running if this
    /// future is dropped.
    pub async fn run(self) -> Result<()> {
        let targets: Vec<String> = self
            .shared
            .config
            .targets
            .iter()
            .map(HostConfig::address)
            .collect();

        tracing::info!(
            server = %self.name(),
            address = %self.local_addr()?,
            targets = ?targets,
            "Proxy server listening"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(
                        server = %self.name(),
                        peer = %peer_addr,
                        "Client connection established"
                    );

                    let shared = Arc::clone(&self.shared);

                    tokio::spawn(async move {
                        let name = shared.config.name.clone();

                        if let Err(e) = handle_connection(stream, peer_addr, shared).await {
                            tracing::warn!(
                                server = %name,
                                peer = %peer_addr,
                                error = %format!("{:#}", e),
                                "Connection handling error"
                            );
                        }
                    });
                }
                Err(e) => accept_error_backoff(self.name(), &e).await,
            }
        }
    }
}

struct ActiveConnection {
    shared: Arc<Shared>,
}

impl ActiveConnection {
    fn open(shared: Arc<Shared>) -> Self {
        let name = shared.config.name.as_str();
        shared.metrics.connections_total.with_label_values(&[name]).inc();
        shared.metrics.active_connections.with_label_values(&[name]).inc();
        ActiveConnection { shared }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.shared
            .metrics
            .active_connections
            .with_label_values(&[self.shared.config.name.as_str()])
            .dec();
    }
}

#[tracing::instrument(skip(client, shared), fields(server = %shared.config.name, trace_id = %Uuid::new_v4()))]
async fn handle_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<()> {
    let _active = ActiveConnection::open(Arc::clone(&shared));

    let (upstream, target) = dial(&shared).await?;

    tracing::debug!(backend = %target, "Forwarding to target");

    // Counted as read, so interrupted connections still show their traffic
    let name = shared.config.name.as_str();
    let bytes = &shared.metrics.bytes_transferred_total;
    let mut client = CountedStream::new(client, bytes.with_label_values(&[name, "upstream"]));
    let mut upstream = CountedStream::new(upstream, bytes.with_label_values(&[name, "downstream"]));

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .with_context(|| format!("Forwarding to {} interrupted", target))?;

    tracing::debug!(backend = %target, sent, received, "Client connection closed");

    Ok(())
}

/// Adds every byte read from the inner stream to a counter.
pub struct CountedStream<S> {
    inner: S,
    read: IntCounter,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, read: IntCounter) -> Self {
        CountedStream { inner, read }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.read.inc_by((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Tries each target once, in rotation order, until one accepts.
async fn dial(shared: &Shared) -> Result<(TcpStream, String)> {
    let targets = &shared.config.targets;
    let timeout = shared.config.connect_timeout();

    for index in shared.balancer.order(targets.len()) {
        let address = targets[index].address();

        match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => return Ok((stream, address)),
            Ok(Err(e)) => {
                tracing::warn!(backend = %address, error = %e, "Failed to connect to target");
            }
            Err(_) => {
                tracing::warn!(backend = %address, timeout = ?timeout, "Timed out connecting to target");
            }
        }

        shared
            .metrics
            .target_dial_errors_total
            .with_label_values(&[shared.config.name.as_str(), address.as_str()])
            .inc();
    }

    anyhow::bail!("No target reachable out of {}", targets.len())
}
