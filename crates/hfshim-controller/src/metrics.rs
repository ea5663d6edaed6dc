use crate::error::{ControllerError, ErrorClass, Result};
use crate::reconciler::ReconcileOutcome;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Prometheus collectors for the controller, on a private registry
pub struct ControllerMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    errors: IntCounterVec,
    duration: Histogram,
    leader: IntGauge,
}

fn register_error(e: prometheus::Error) -> ControllerError {
    ControllerError::internal_error(format!("Failed to register metric: {}", e))
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("hfshim_reconcile_total", "Reconcile passes by outcome"),
            &["outcome"],
        )
        .map_err(register_error)?;
        let errors = IntCounterVec::new(
            Opts::new("hfshim_reconcile_errors_total", "Failed reconcile passes by error class"),
            &["class"],
        )
        .map_err(register_error)?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "hfshim_reconcile_duration_seconds",
            "Time spent in a single reconcile pass",
        ))
        .map_err(register_error)?;
        let leader = IntGauge::new("hfshim_leader", "1 while this replica holds the leader lease")
            .map_err(register_error)?;

        registry.register(Box::new(reconciles.clone())).map_err(register_error)?;
        registry.register(Box::new(errors.clone())).map_err(register_error)?;
        registry.register(Box::new(duration.clone())).map_err(register_error)?;
        registry.register(Box::new(leader.clone())).map_err(register_error)?;

        Ok(Self {
            registry,
            reconciles,
            errors,
            duration,
            leader,
        })
    }

    pub fn record_outcome(&self, outcome: ReconcileOutcome) {
        self.reconciles.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_error(&self, class: ErrorClass) {
        self.reconciles.with_label_values(&["error"]).inc();
        self.errors.with_label_values(&[class.as_str()]).inc();
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.duration.observe(seconds);
    }

    pub fn set_leader(&self, leading: bool) {
        self.leader.set(i64::from(leading));
    }

    /// Text exposition of every collector. Empty if encoding fails.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Router exposing `/healthz` and `/metrics`
pub fn router(metrics: Arc<ControllerMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

/// Bind `addr` and serve until the token is cancelled
pub async fn serve(addr: SocketAddr, metrics: Arc<ControllerMetrics>, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::internal_error(format!("Failed to bind metrics server on {}: {}", addr, e)))?;
    serve_on(listener, metrics, token).await
}

pub async fn serve_on(listener: TcpListener, metrics: Arc<ControllerMetrics>, token: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting metrics server on {}", addr);
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| ControllerError::internal_error(format!("Metrics server failed: {}", e)))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(metrics): State<Arc<ControllerMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
