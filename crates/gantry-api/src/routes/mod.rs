//! HTTP routes.

pub mod builds;
pub mod discovery;
pub mod health;
pub mod repositories;
pub mod webhooks;

use std::str::FromStr;

use axum::Router;

use crate::AppState;
use crate::error::ApiError;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(webhooks::router())
        .merge(builds::router())
        .merge(discovery::router())
        .merge(repositories::router())
        .merge(health::router())
        .with_state(state)
}

/// Parse a mandatory form field.
fn required<T: FromStr>(value: Option<&str>, name: &str) -> Result<T, ApiError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required", name)))?;
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {}: {}", name, value)))
}
