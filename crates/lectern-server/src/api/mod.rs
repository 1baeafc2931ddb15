use crate::state::AppState;
use crate::ws;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::handler::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers_total: usize,
    pub workers_alive: usize,
    pub sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers_total = state.pool.worker_count().await;
    let workers_alive = state.pool.alive_count().await;
    let status = if workers_alive > 0 { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        workers_total,
        workers_alive,
        sessions: state.sessions.session_count().await,
    })
}
