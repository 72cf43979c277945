use crate::signup::{self, SignupDesk};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state. Goes false when storage becomes unavailable.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state (ready).
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Set readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the relay is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// `/health` and `/ready`, plus the pay-to-relay routes when a sign-up desk
/// is running.
pub fn http_router(health_state: HealthState, signups: Option<Arc<SignupDesk>>) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));
    match signups {
        Some(desk) => app.merge(signup::routes(desk)),
        None => app,
    }
}

/// Serves `/metrics` alongside [`http_router`].
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or the bind fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
    signups: Option<Arc<SignupDesk>>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = http_router(health_state, signups).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("ostrich_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("ostrich_connections_active").decrement(1.0);
    }

    /// Adjust the live subscription gauge by `delta`.
    pub fn subscriptions_delta(delta: f64) {
        metrics::gauge!("ostrich_subscriptions_active").increment(delta);
    }

    /// Set the persistence queue depth for one writer shard.
    pub fn persist_queue_depth(shard: usize, depth: usize) {
        metrics::gauge!("ostrich_persist_queue_depth", "shard" => shard.to_string())
            .set(depth as f64);
    }
}

/// Counters.
pub mod counters {
    /// Record a client command by verb.
    pub fn commands_total(command: &'static str) {
        metrics::counter!("ostrich_commands_total", "command" => command).increment(1);
    }

    /// Record an admission decision (`accepted` or a rejection label).
    pub fn admission_decisions_total(outcome: &'static str) {
        metrics::counter!("ostrich_admission_decisions_total", "outcome" => outcome).increment(1);
    }

    /// Record an external admission service failure that was failed open.
    pub fn admission_service_failures_total(kind: &'static str) {
        metrics::counter!("ostrich_admission_service_failures_total", "kind" => kind).increment(1);
    }

    /// Record a persistence outcome (`stored`, `duplicate`, `ephemeral`, `failed`).
    pub fn writes_total(outcome: &'static str) {
        metrics::counter!("ostrich_writes_total", "outcome" => outcome).increment(1);
    }

    /// Record a NIP-05 check outcome.
    pub fn identity_checks_total(outcome: &'static str) {
        metrics::counter!("ostrich_identity_checks_total", "outcome" => outcome).increment(1);
    }

    /// Increment the delivered-events counter.
    pub fn deliveries_total(count: u64) {
        metrics::counter!("ostrich_deliveries_total").increment(count);
    }

    /// Increment the dropped-deliveries counter with the given reason label.
    pub fn deliveries_dropped_total(reason: &'static str) {
        metrics::counter!("ostrich_deliveries_dropped_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Time spent in the admission chain.
    pub fn admission_latency_seconds(value: f64) {
        metrics::histogram!("ostrich_admission_latency_seconds").record(value);
    }

    /// Time spent writing one event to storage.
    pub fn write_latency_seconds(value: f64) {
        metrics::histogram!("ostrich_write_latency_seconds").record(value);
    }

    /// Time spent answering a historical query.
    pub fn query_latency_seconds(value: f64) {
        metrics::histogram!("ostrich_query_latency_seconds").record(value);
    }
}
