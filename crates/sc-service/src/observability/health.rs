//! Health endpoints for the Session Coordinator.
//!
//! - `GET /health` - liveness; 200 while the process runs
//! - `GET /ready` - readiness; 200 once the media engine is initialized,
//!   503 during shutdown and forever after the engine worker died
//! - `GET /metrics` - Prometheus text format, when a handle is supplied

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness of the service.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Media engine initialized and accepting sessions.
    ready: AtomicBool,
    /// The engine worker died; the process is about to exit.
    engine_dead: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready. Ignored once the engine is dead.
    pub fn set_ready(&self) {
        if !self.engine_dead.load(Ordering::SeqCst) {
            self.ready.store(true, Ordering::SeqCst);
        }
    }

    /// Mark the service as not ready (shutdown in progress).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Record that the engine worker died. Readiness cannot recover.
    pub fn set_engine_dead(&self) {
        self.engine_dead.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_engine_dead(&self) -> bool {
        self.engine_dead.load(Ordering::SeqCst)
    }
}

/// Build the health router. `/metrics` is only mounted when `prometheus`
/// is given.
pub fn health_router(health_state: Arc<HealthState>, prometheus: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match prometheus {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        None => router,
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else if state.is_engine_dead() {
        (StatusCode::SERVICE_UNAVAILABLE, "media engine died")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
