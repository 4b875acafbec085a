//! Discovery trigger and progress.

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::required;
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/discovery", post(discover).get(running))
}

#[derive(Debug, Deserialize)]
pub struct DiscoveryForm {
    pub repository_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub repository_id: i32,
}

#[derive(Debug, Serialize)]
pub struct RunningResponse {
    /// Repositories with a discovery job in flight.
    pub running: Vec<i32>,
}

async fn discover(
    State(state): State<AppState>,
    Form(form): Form<DiscoveryForm>,
) -> Result<Json<DiscoveryResponse>, ApiError> {
    let repository_id: i32 = required(form.repository_id.as_deref(), "repository_id")?;
    let repository = state.repos.repositories.get(repository_id).await?;

    state.discoverer.find_out(&repository, "").await?;
    info!(repository.id = repository.id, "discovery requested");
    Ok(Json(DiscoveryResponse { repository_id }))
}

async fn running(State(state): State<AppState>) -> Json<RunningResponse> {
    Json(RunningResponse {
        running: state.viewer.running(),
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::testing::{body_json, form, harness, seed};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gantry_cluster::JobHandler;
    use gantry_scheduler::BuilderOptions;
    use gantry_scheduler::discovery::discovery_job_template;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_discover_repository() {
        let h = harness(true);
        let (repository, _) = seed(&h.db).await;

        let response = router(h.state.clone())
            .oneshot(form("/discovery", &format!("repository_id={}", repository.id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["repository_id"], repository.id);
        assert_eq!(h.discoverer.runs(), vec![(repository.id, String::new())]);
    }

    #[tokio::test]
    async fn test_discover_unknown_repository() {
        let h = harness(true);

        let response = router(h.state.clone())
            .oneshot(form("/discovery", "repository_id=42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(h.discoverer.runs().is_empty());
    }

    #[tokio::test]
    async fn test_running_discoveries() {
        let h = harness(true);
        let (repository, _) = seed(&h.db).await;
        let job = discovery_job_template(&BuilderOptions::default(), &repository, "", "6.4.0");
        h.viewer.sync_job(&job).await.unwrap();

        let response = router(h.state.clone())
            .oneshot(Request::builder().uri("/discovery").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["running"][0], repository.id);
    }
}
