//! Mutating admission webhook for application monitoring
//!
//! Intercepts Deployment create/update operations and rewrites their pod
//! template so the pods start with the monitoring agents configured by the
//! namespace's Instrumentation resource. Objects no resource governs any
//! more are reverted to their original shape.

pub mod mutator;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

pub use mutator::{mutate_handler, Mutator};

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Orchestrator answering admission reviews
    pub mutator: Mutator,
}

impl WebhookState {
    /// Create a new webhook state around `mutator`
    pub fn new(mutator: Mutator) -> Self {
        Self { mutator }
    }
}

/// Create the webhook router
///
/// - POST /mutate - Answer a Deployment AdmissionReview
/// - GET /healthz - Liveness probe
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
