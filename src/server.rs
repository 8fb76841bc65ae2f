//! HTTP trigger and status endpoints.
//!
//! Exposes three routes:
//!
//! - `POST /api/generate`: runs a generation pass synchronously and
//!   returns its summary. Protected by the bearer token.
//! - `GET /api/status`: budget, queue, and provider health, read through
//!   the Redis cache. Protected by the bearer token.
//! - `GET /api/health`: unauthenticated liveness probe.
//!
//! Auth rejects before any pipeline work is started, and compares the
//! token in constant time.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::budget::{BudgetStatus, BudgetTracker};
use crate::cache::ReadThroughCache;
use crate::config::PipelineConfig;
use crate::orchestrator::GenerationOrchestrator;
use crate::scheduler::{JobQueue, QueueStats};
use crate::storage::Store;

/// How long a computed status payload stays cached.
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(30);

/// Cache key for the status payload.
const STATUS_CACHE_KEY: &str = "status";

/// Shared state for all handlers.
pub struct AppState {
    pub config: PipelineConfig,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub store: Arc<dyn Store>,
    pub budget: Arc<BudgetTracker>,
    pub queue: Arc<JobQueue>,
    pub cache: Arc<ReadThroughCache>,
}

/// Provider line in the status payload.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct ProviderStatus {
    id: String,
    display_name: String,
    active: bool,
    auto_disabled: bool,
    consecutive_failures: u32,
}

/// Payload for `GET /api/status`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct StatusPayload {
    budget: BudgetStatus,
    queue: QueueStatusPayload,
    providers: Vec<ProviderStatus>,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct QueueStatusPayload {
    pending_jobs: usize,
    processing_jobs: usize,
    dead_letter_jobs: usize,
    paused: bool,
}

impl From<QueueStats> for QueueStatusPayload {
    fn from(stats: QueueStats) -> Self {
        Self {
            pending_jobs: stats.pending_jobs,
            processing_jobs: stats.processing_jobs,
            dead_letter_jobs: stats.dead_letter_jobs,
            paused: stats.paused,
        }
    }
}

/// Builds the router with auth applied to the protected routes.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/generate", post(generate))
        .route("/api/status", get(status))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listen address and serves until the process is stopped.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Trigger server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Bearer-token middleware. Rejects before any pipeline work runs.
async fn require_bearer(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // Fail closed if no token is configured.
    if state.config.api_token.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "API token not configured").into_response();
    }

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("");

    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }

    if !constant_time_eq(token, &state.config.api_token) {
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    }

    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Runs one generation pass and returns its summary.
async fn generate(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.run().await {
        Ok(summary) => {
            // The run changed budget and provider state; drop the cached
            // status rather than serving a stale one for the TTL.
            state.cache.invalidate(STATUS_CACHE_KEY).await;
            (StatusCode::OK, Json(summary)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Generation run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Returns pipeline status, cached for [`STATUS_CACHE_TTL`].
async fn status(State(state): State<Arc<AppState>>) -> Response {
    let result = state
        .cache
        .get_or_compute(STATUS_CACHE_KEY, || compute_status(Arc::clone(&state)))
        .await;

    match result {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Status computation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response()
        }
    }
}

async fn compute_status(state: Arc<AppState>) -> Result<StatusPayload, String> {
    let providers = state
        .store
        .list_providers()
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|p| ProviderStatus {
            id: p.id,
            display_name: p.display_name,
            active: p.active,
            auto_disabled: p.auto_disabled,
            consecutive_failures: p.consecutive_failures,
        })
        .collect();

    let queue = state.queue.stats().await.map_err(|e| e.to_string())?;

    Ok(StatusPayload {
        budget: state.budget.status(),
        queue: queue.into(),
        providers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret-token", "secret-token"));
        assert!(!constant_time_eq("secret-token", "secret-tokeX"));
        assert!(!constant_time_eq("short", "a-much-longer-token"));
        assert!(!constant_time_eq("", "nonempty"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_status_payload_round_trips() {
        let payload = StatusPayload {
            budget: BudgetTracker::new(50.0).status(),
            queue: QueueStatusPayload {
                pending_jobs: 3,
                processing_jobs: 1,
                dead_letter_jobs: 0,
                paused: false,
            },
            providers: vec![ProviderStatus {
                id: "acme".to_string(),
                display_name: "Acme Forecasts".to_string(),
                active: true,
                auto_disabled: false,
                consecutive_failures: 0,
            }],
        };

        // The payload passes through the cache as JSON; it must survive
        // a serialize/deserialize cycle intact.
        let json = serde_json::to_string(&payload).expect("serializes");
        let parsed: StatusPayload = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(parsed.providers[0].id, "acme");
        assert!(!parsed.queue.paused);
    }
}
