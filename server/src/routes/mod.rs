//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the health/presence HTTP endpoints and the websocket upgrade under
//! a single Axum router. Everything stateful happens behind `/ws`; the HTTP
//! surface is read-only.

pub mod ws;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::services::workspace;
use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/workspace/{id}", get(workspace_info))
        .route("/ws", get(ws::handle_ws))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    Json(workspace::health(&state).await).into_response()
}

async fn workspace_info(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match workspace::workspace_info(&state, &id).await {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, "workspace not found").into_response(),
    }
}
