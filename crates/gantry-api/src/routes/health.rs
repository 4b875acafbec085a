//! Liveness and readiness endpoints.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Ready once the database schema matches the embedded migrations.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.schema.ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
