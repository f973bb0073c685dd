//! Record lookup endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use melaka_core::DocumentStore;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /cve/{id}` - the stored document for one record.
pub async fn get_cve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(ApiError::BadRequest("record id must not be empty".to_string()));
    }

    let store = Arc::clone(&state.store);
    let lookup = id.clone();
    let document = tokio::task::spawn_blocking(move || store.find(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;

    document
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no record with id {}", id)))
}
