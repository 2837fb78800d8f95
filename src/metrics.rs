// Prometheus metrics for the proxy runtime and the HTTP endpoint exposing them

use crate::proxy::accept_error_backoff;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ProxyMetrics {
    registry: Registry,
    pub connections_total: IntCounterVec,
    pub active_connections: IntGaugeVec,
    pub bytes_transferred_total: IntCounterVec,
    pub target_dial_errors_total: IntCounterVec,
    pub config_reloads_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("octo_connections_total", "Accepted client connections"),
            &["name"],
        )?;
        let active_connections = IntGaugeVec::new(
            Opts::new("octo_active_connections", "Client connections currently open"),
            &["name"],
        )?;
        let bytes_transferred_total = IntCounterVec::new(
            Opts::new(
                "octo_bytes_transferred_total",
                "Bytes copied between clients and targets",
            ),
            &["name", "direction"],
        )?;
        let target_dial_errors_total = IntCounterVec::new(
            Opts::new(
                "octo_target_dial_errors_total",
                "Failed attempts to connect to a target",
            ),
            &["name", "target"],
        )?;
        let config_reloads_total = IntCounterVec::new(
            Opts::new("octo_config_reloads_total", "Configuration reload attempts"),
            &["result"],
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(bytes_transferred_total.clone()))?;
        registry.register(Box::new(target_dial_errors_total.clone()))?;
        registry.register(Box::new(config_reloads_total.clone()))?;

        Ok(ProxyMetrics {
            registry,
            connections_total,
            active_connections,
            bytes_transferred_total,
            target_dial_errors_total,
            config_reloads_total,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;

        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }
}

/// Binds the metrics endpoint. Fails fast so a bad address surfaces at startup.
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint to {}", address))
}

/// Serves `GET /metrics` until the task is aborted.
pub async fn serve(listener: TcpListener, metrics: Arc<ProxyMetrics>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Metrics endpoint listening");
    }

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_error_backoff("metrics", &e).await;
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, Infallible>(handle_request(request, &metrics)) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(peer = %peer_addr, error = %e, "Metrics connection error");
            }
        });
    }
}

fn handle_request(request: Request<Incoming>, metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    if request.method() != Method::GET || request.uri().path() != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found\n".to_string());
    }

    match metrics.render() {
        Ok(body) => text_response(StatusCode::OK, body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e))
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
