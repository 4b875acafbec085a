//! Repository registration.

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Json, Router};
use gantry_core::Repository;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::required;
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/repository", post(create_repository))
}

#[derive(Debug, Deserialize)]
pub struct RepositoryForm {
    pub name: Option<String>,
    /// Browser URL; webhooks are matched against it.
    pub url: Option<String>,
    pub clone_url: Option<String>,
    pub private: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RepositoryResponse {
    pub repository_id: i32,
}

async fn create_repository(
    State(state): State<AppState>,
    Form(form): Form<RepositoryForm>,
) -> Result<Json<RepositoryResponse>, ApiError> {
    let name: String = required(form.name.as_deref(), "name")?;
    let url: String = required(form.url.as_deref(), "url")?;
    let clone_url: String = required(form.clone_url.as_deref(), "clone_url")?;
    let private = matches!(form.private.as_deref(), Some("true" | "1" | "on"));

    let repository = state
        .repos
        .repositories
        .create(&Repository::new(name, url, clone_url, private))
        .await?;
    info!(repository.id = repository.id, name = %repository.name, "repository registered");
    Ok(Json(RepositoryResponse {
        repository_id: repository.id,
    }))
}
