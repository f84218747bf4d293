use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::info;
use anyhow::Result;

use crate::orchestrator::{EventBus, ResponseCache, Supervisor, TokenBudgetController};

struct ServerError(StatusCode, anyhow::Error);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1.to_string() }))).into_response()
    }
}

impl<E> From<E> for ServerError where E: Into<anyhow::Error> {
    fn from(err: E) -> Self { Self(StatusCode::INTERNAL_SERVER_ERROR, err.into()) }
}

/// Handles shared by the handlers; cache, budget and events are the same
/// instances the supervisor uses
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub budget: Arc<TokenBudgetController>,
    pub events: EventBus,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            cache: supervisor.cache(),
            budget: supervisor.budget(),
            events: supervisor.events().clone(),
            started_at: Utc::now(),
            supervisor,
        }
    }
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub user_context: Map<String, Value>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/query", post(query))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/prune", post(cache_prune))
        .route("/v1/budget", get(budget))
        .route("/v1/events", get(events))
        .route("/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ServerError> {
    if req.query.trim().is_empty() {
        return Err(ServerError(StatusCode::BAD_REQUEST, anyhow::anyhow!("query must not be empty")));
    }
    let response = state.supervisor.process_query(&req.query, req.user_context).await;
    Ok(Json(response))
}

async fn cache_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    let Some(cache) = state.cache else {
        return Ok(Json(json!({ "enabled": false })));
    };
    let stats = cache.stats().await?;
    Ok(Json(json!({ "enabled": true, "stats": stats })))
}

async fn cache_prune(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    let removed = match state.cache {
        Some(cache) => cache.prune().await?,
        None => 0,
    };
    Ok(Json(json!({ "removed": removed })))
}

async fn budget(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.budget.usage_report())
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = BroadcastStream::new(state.events.subscribe())
        // Lagged receivers skip what they missed
        .filter_map(|msg| msg.ok())
        .map(|event| Event::default().event("pipeline").json_data(event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let roles: Vec<String> = state
        .supervisor
        .config()
        .enabled_agents
        .iter()
        .map(|r| r.to_string())
        .collect();
    Json(json!({
        "status": "ok",
        "roles": roles,
        "cache_enabled": state.cache.is_some(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}
