//! API route definitions.

mod cve;
mod health;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /cve/{id}` - Stored document for one record
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/cve/{id}", get(cve::get_cve))
        .with_state(state)
}
