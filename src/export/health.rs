use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "harvestd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Applications currently registered.
    pub applications: Gauge,
    /// Runs currently connected and harvesting.
    pub active_runs: Gauge,
    /// Total connect attempts.
    pub connect_attempts: Counter,
    /// Total successful connects.
    pub connects: Counter,
    /// Connect failures by failure kind.
    pub connect_failures: CounterVec,
    /// Harvest cycles by harvest kind.
    pub harvests: CounterVec,
    /// Delivery responses by HTTP status code.
    pub delivery_status: CounterVec,
    /// Containers merged back for retry after a delivery failure.
    pub payloads_saved: Counter,
    /// Containers dropped: retry budget exhausted or non-retryable failure.
    pub payloads_dropped: Counter,
    /// Transactions dropped by an ignore rule.
    pub txns_ignored: Counter,
    /// Transaction submissions for unknown run ids.
    pub txns_unknown_run: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let applications = Gauge::with_opts(
            Opts::new("applications", "Applications currently registered.")
                .namespace("harvestd"),
        )?;
        let active_runs = Gauge::with_opts(
            Opts::new("active_runs", "Runs currently connected and harvesting.")
                .namespace("harvestd"),
        )?;
        let connect_attempts = Counter::with_opts(
            Opts::new("connect_attempts_total", "Total connect attempts.").namespace("harvestd"),
        )?;
        let connects = Counter::with_opts(
            Opts::new("connects_total", "Total successful connects.").namespace("harvestd"),
        )?;
        let connect_failures = CounterVec::new(
            Opts::new(
                "connect_failures_total",
                "Total connect failures by failure kind.",
            )
            .namespace("harvestd"),
            &["kind"],
        )?;
        let harvests = CounterVec::new(
            Opts::new("harvests_total", "Total harvest cycles by harvest kind.")
                .namespace("harvestd"),
            &["kind"],
        )?;
        let delivery_status = CounterVec::new(
            Opts::new(
                "delivery_status_total",
                "Delivery responses by HTTP status code.",
            )
            .namespace("harvestd"),
            &["status"],
        )?;
        let payloads_saved = Counter::with_opts(
            Opts::new(
                "payloads_saved_total",
                "Containers merged back for retry after a delivery failure.",
            )
            .namespace("harvestd"),
        )?;
        let payloads_dropped = Counter::with_opts(
            Opts::new(
                "payloads_dropped_total",
                "Containers dropped after delivery failure.",
            )
            .namespace("harvestd"),
        )?;
        let txns_ignored = Counter::with_opts(
            Opts::new(
                "txns_ignored_total",
                "Transactions dropped by an ignore rule.",
            )
            .namespace("harvestd"),
        )?;
        let txns_unknown_run = Counter::with_opts(
            Opts::new(
                "txns_unknown_run_total",
                "Transaction submissions for unknown run ids.",
            )
            .namespace("harvestd"),
        )?;

        registry.register(Box::new(applications.clone()))?;
        registry.register(Box::new(active_runs.clone()))?;
        registry.register(Box::new(connect_attempts.clone()))?;
        registry.register(Box::new(connects.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;
        registry.register(Box::new(harvests.clone()))?;
        registry.register(Box::new(delivery_status.clone()))?;
        registry.register(Box::new(payloads_saved.clone()))?;
        registry.register(Box::new(payloads_dropped.clone()))?;
        registry.register(Box::new(txns_ignored.clone()))?;
        registry.register(Box::new(txns_unknown_run.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            applications,
            active_runs,
            connect_attempts,
            connects,
            connect_failures,
            harvests,
            delivery_status,
            payloads_saved,
            payloads_dropped,
            txns_ignored,
            txns_unknown_run,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8126"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics register");

        health.connect_attempts.inc();
        health.connects.inc();
        health.applications.set(3.0);
        health.harvests.with_label_values(&["all"]).inc();
        health.delivery_status.with_label_values(&["503"]).inc();

        let families = health.registry.gather();
        assert!(!families.is_empty());
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics register");
        health.start().await.expect("server starts");
        health.stop().await.expect("server stops");
    }
}
