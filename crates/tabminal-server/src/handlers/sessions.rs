//! Session handlers

use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tabminal_types::SessionSummary;

pub async fn list(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list().await)
}

pub async fn create(
    State(state): State<AppState>,
) -> Result<Json<SessionSummary>, StatusCode> {
    match state.registry.create().await {
        Ok(session) => Ok(Json(session.summary().await)),
        Err(e) => {
            tracing::error!("Failed to create session: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, StatusCode> {
    match state.registry.get(&id).await {
        Some(session) => Ok(Json(session.summary().await)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.registry.remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::debug!("Failed to remove session {}: {}", id, e);
            StatusCode::NOT_FOUND
        }
    }
}
