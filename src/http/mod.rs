//! HTTP Handler (C6): routes under a configurable base path.
//!
//! Grounded on the teacher's `api/routes/mod.rs` router-assembly style and
//! `api/types::ApiError` error-to-status mapping.

pub mod poll;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;

use crate::engine::BusEngine;

/// Bounds used by the poll handler, distinct from the full process
/// `AppConfig` so this module stays usable without the `core` wiring.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub long_poll_timeout: Duration,
    pub keepalive: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(25),
            keepalive: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<BusEngine>,
    pub config: HttpConfig,
}

/// Build the router, nested under `base_path` by the caller (`spec.md` §4.5:
/// default `/message-bus`). `GET /_diagnostics/*` is reserved (404) rather
/// than silently absent, per `spec.md` §4.5.
pub fn router(engine: Arc<BusEngine>, config: HttpConfig) -> Router {
    let state = HttpState { engine, config };

    Router::new()
        .route("/{client_id}/poll", any(poll::poll))
        .route("/_diagnostics/{*rest}", get(poll::diagnostics_reserved))
        .with_state(state)
}
