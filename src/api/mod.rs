//! Admin, health and metrics surface.
//!
//! Control operations are authenticated with a shared secret compared in
//! constant time. The health endpoint aggregates subsystem checks into
//! healthy / degraded / unhealthy.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::chain::rpc::RpcClient;
use crate::crank::{CrankService, CrankStatus};
use crate::db::Database;
use crate::metrics::CrankMetrics;
use crate::util::timeout::with_timeout;

const HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone)]
pub struct ApiState {
    pub crank: CrankService,
    pub metrics: Arc<CrankMetrics>,
    pub rpc: Arc<RpcClient>,
    pub db: Database,
    pub admin_api_key: Option<String>,
}

/// Compare two secrets without short-circuiting. Hashing first makes the
/// comparison length-independent.
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug)]
enum AuthError {
    MissingKey,
    InvalidKey,
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingKey => (StatusCode::UNAUTHORIZED, "Missing admin API key"),
            AuthError::InvalidKey => (StatusCode::UNAUTHORIZED, "Invalid admin API key"),
            AuthError::NotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ADMIN_API_KEY is not configured",
            ),
        };
        (status, message).into_response()
    }
}

async fn admin_auth(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return Err(AuthError::NotConfigured);
    };

    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
        .ok_or(AuthError::MissingKey)?;

    if !constant_time_eq(provided, expected) {
        warn!("admin request rejected: bad api key");
        return Err(AuthError::InvalidKey);
    }
    Ok(next.run(req).await)
}

pub fn router(state: ApiState) -> Router {
    let admin = Router::new()
        .route("/admin/start", post(admin_start))
        .route("/admin/stop", post(admin_stop))
        .route("/admin/pause", post(admin_pause))
        .route("/admin/resume", post(admin_resume))
        .route("/admin/skip-pending-mpc", post(admin_skip_pending_mpc))
        .route("/admin/status", get(admin_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .merge(admin)
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn command_response(result: anyhow::Result<()>, action: &str) -> Response {
    match result {
        Ok(()) => {
            info!(action, "admin command accepted");
            Json(json!({"ok": true, "action": action})).into_response()
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "action": action, "error": format!("{e:#}")})),
        )
            .into_response(),
    }
}

async fn admin_start(State(state): State<ApiState>) -> Response {
    command_response(state.crank.start().await, "start")
}

async fn admin_stop(State(state): State<ApiState>) -> Response {
    state.crank.stop().await;
    command_response(Ok(()), "stop")
}

async fn admin_pause(State(state): State<ApiState>) -> Response {
    command_response(state.crank.pause(), "pause")
}

async fn admin_resume(State(state): State<ApiState>) -> Response {
    command_response(state.crank.resume(), "resume")
}

async fn admin_skip_pending_mpc(State(state): State<ApiState>) -> Response {
    match state.crank.skip_pending_mpc().await {
        Ok(count) => Json(json!({"ok": true, "action": "skip-pending-mpc", "skipped": count}))
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": format!("{e:#}")})),
        )
            .into_response(),
    }
}

async fn admin_status(State(state): State<ApiState>) -> Response {
    Json(state.crank.status_report()).into_response()
}

async fn metrics_text(State(state): State<ApiState>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn health(State(state): State<ApiState>) -> Response {
    let db_ok = {
        let conn = state.db.conn().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    };

    let rpc_ok = with_timeout("health getSlot", HEALTH_CHECK_TIMEOUT_MS, async {
        state.rpc.get_slot().await
    })
    .await
    .is_ok();

    let ws_active = state.crank.order_cache().is_active();
    let crank_state = state.crank.status();

    let overall = if !db_ok {
        "unhealthy"
    } else if !rpc_ok || (crank_state == CrankStatus::Running && !ws_active) {
        "degraded"
    } else {
        "healthy"
    };
    let status_code = if overall == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        Json(json!({
            "status": overall,
            "subsystems": {
                "database": if db_ok { "up" } else { "down" },
                "rpc": if rpc_ok { "up" } else { "down" },
                "order_subscription": if ws_active { "up" } else { "down" },
                "crank": crank_state.as_str(),
            },
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_accepts_equal_secrets() {
        assert!(constant_time_eq("super-secret-key", "super-secret-key"));
    }

    #[test]
    fn constant_time_eq_rejects_differences() {
        assert!(!constant_time_eq("super-secret-key", "super-secret-kez"));
        assert!(!constant_time_eq("short", "a-much-longer-secret"));
        assert!(!constant_time_eq("", "x"));
    }
}
