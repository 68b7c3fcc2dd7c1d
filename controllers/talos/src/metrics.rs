//! Prometheus metrics and probe endpoints
//!
//! Serves `/metrics`, `/healthz` and `/readyz` on one port. `/readyz` turns
//! green once every watcher has been started.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::error::ControllerError;

/// Reconciliation metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_errors: IntCounterVec,
    reconcile_duration: HistogramVec,
}

impl Metrics {
    /// Create and register all collectors on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("talos_reconcile_total", "Reconciliation passes by kind and result"),
            &["kind", "result"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("talos_reconcile_errors_total", "Failed reconciliation passes by kind and reason"),
            &["kind", "reason"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("talos_reconcile_duration_seconds", "Duration of reconciliation passes")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            &["kind"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_errors,
            reconcile_duration,
        })
    }

    /// Record a successful pass
    pub fn record_success(&self, kind: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[kind, "success"]).inc();
        self.reconcile_duration.with_label_values(&[kind]).observe(elapsed.as_secs_f64());
    }

    /// Record a failed pass
    pub fn record_error(&self, kind: &str, error: &ControllerError, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[kind, "error"]).inc();
        self.reconcile_errors.with_label_values(&[kind, error.reason()]).inc();
        self.reconcile_duration.with_label_values(&[kind]).observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ProbeState {
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

/// Router for the metrics and probe endpoints
pub fn routes(metrics: Arc<Metrics>, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz_handler))
        .with_state(Arc::new(ProbeState { metrics, ready }))
}

async fn metrics_handler(State(state): State<Arc<ProbeState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn readyz_handler(State(state): State<Arc<ProbeState>>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve the metrics and probe endpoints until the process exits
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, ready: Arc<AtomicBool>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind metrics address {addr}: {e}")))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, routes(metrics, ready))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server stopped: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_render_includes_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_success("Secrets", Duration::from_millis(20));
        metrics.record_error(
            "Bootstrap",
            &ControllerError::DependencyNotReady("secrets".to_string()),
            Duration::from_millis(5),
        );

        let text = metrics.render().unwrap();
        assert!(text.contains("talos_reconcile_total{kind=\"Secrets\",result=\"success\"} 1"));
        assert!(text.contains("talos_reconcile_errors_total{kind=\"Bootstrap\",reason=\"dependency_not_ready\"} 1"));
        assert!(text.contains("talos_reconcile_duration_seconds_count{kind=\"Secrets\"} 1"));
    }

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = routes(Arc::new(Metrics::new().unwrap()), Arc::clone(&ready));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::Relaxed);
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthz_and_metrics_respond() {
        let app = routes(Arc::new(Metrics::new().unwrap()), Arc::new(AtomicBool::new(true)));
        for uri in ["/healthz", "/metrics"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }
}
