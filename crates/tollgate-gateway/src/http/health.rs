use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::app::AppState;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub components: Components,
}

#[derive(Serialize)]
pub struct Components {
    pub database: &'static str,
    pub registry: &'static str,
    pub rate_limiter: &'static str,
}

/// GET /health — component status. The limiter runs degraded without its
/// backend, so it reports but never fails the probe.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let database = state
        .db
        .with_conn(|conn| -> tollgate_store::Result<i64> {
            Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?)
        })
        .map(|_| "ok")
        .unwrap_or("error");

    let registry = if state.registry.is_empty() {
        "empty"
    } else {
        "ok"
    };

    let rate_limiter = if state.limiter.backend_connected() {
        "ok"
    } else {
        "degraded"
    };

    let status = if database == "ok" { "healthy" } else { "unhealthy" };

    Json(Health {
        status,
        components: Components {
            database,
            registry,
            rate_limiter,
        },
    })
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
