//! Manual build triggers.

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Json, Router};
use gantry_core::{JobDefinition, TriggerSource};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::required;
use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/run", post(run))
        .route("/redo", post(redo))
}

#[derive(Debug, Deserialize)]
pub struct RunForm {
    pub job_id: Option<String>,
    /// Defaults to the head of the repository's default branch. Scheduled
    /// runs leave it empty and build whatever the clone checks out.
    pub revision: Option<String>,
    pub via: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RedoForm {
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub task_id: i32,
}

async fn run(
    State(state): State<AppState>,
    Form(form): Form<RunForm>,
) -> Result<Json<RunResponse>, ApiError> {
    let job_id: i32 = required(form.job_id.as_deref(), "job_id")?;
    let via = match form.via.as_deref().filter(|v| !v.is_empty()) {
        Some(via) => via.parse::<TriggerSource>().map_err(ApiError::BadRequest)?,
        None => TriggerSource::Api,
    };

    let job = state.repos.jobs.get(job_id).await?;
    let revision = match form.revision.filter(|r| !r.is_empty()) {
        Some(revision) => revision,
        None if via == TriggerSource::Cron => String::new(),
        None => default_branch_head(&state, &job).await?,
    };

    let task = state.builder.build(&job, &revision, via).await?;
    info!(job.id = job.id, task.id = task.id, revision = %revision, via = %via, "build requested");
    Ok(Json(RunResponse { task_id: task.id }))
}

async fn redo(
    State(state): State<AppState>,
    Form(form): Form<RedoForm>,
) -> Result<Json<RunResponse>, ApiError> {
    let task_id: i32 = required(form.task_id.as_deref(), "task_id")?;
    let task = state.repos.tasks.get(task_id).await?;
    let job = state.repos.jobs.get(task.job_id).await?;

    let redo = state
        .builder
        .build(&job, &task.revision, TriggerSource::Api)
        .await?;
    info!(task.id = redo.id, previous = task.id, "task redone");
    Ok(Json(RunResponse { task_id: redo.id }))
}

async fn default_branch_head(state: &AppState, job: &JobDefinition) -> Result<String, ApiError> {
    let repository = state.repos.repositories.get(job.repository_id).await?;
    let Some(github) = &state.github else {
        return Err(ApiError::BadRequest(
            "revision is required without a git host".to_string(),
        ));
    };
    let Some((owner, name)) = repository.github_owner_and_name() else {
        return Err(ApiError::BadRequest(format!(
            "revision is required for {}",
            repository.url
        )));
    };
    Ok(github.default_branch_head(&owner, &name).await?)
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::testing::{body_json, form, harness, seed};
    use axum::http::StatusCode;
    use gantry_core::{Task, TriggerSource};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_run_at_revision() {
        let h = harness(true);
        let (_, jobs) = seed(&h.db).await;

        let response = router(h.state.clone())
            .oneshot(form("/run", &format!("job_id={}&revision=c0ffee&via=push", jobs[0].id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let task_id = body["task_id"].as_i64().unwrap() as i32;
        let task = h.db.repos().tasks.get(task_id).await.unwrap();
        assert_eq!(task.revision, "c0ffee");
        assert_eq!(h.builder.builds(), vec![(jobs[0].id, "c0ffee".to_string(), TriggerSource::Push)]);
    }

    #[tokio::test]
    async fn test_run_resolves_default_branch() {
        let h = harness(true);
        let (_, jobs) = seed(&h.db).await;

        let response = router(h.state.clone())
            .oneshot(form("/run", &format!("job_id={}", jobs[1].id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.builder.builds(), vec![(jobs[1].id, "main-head".to_string(), TriggerSource::Api)]);
    }

    #[tokio::test]
    async fn test_scheduled_run_has_no_revision() {
        let h = harness(true);
        let (_, jobs) = seed(&h.db).await;

        let response = router(h.state.clone())
            .oneshot(form("/run", &format!("job_id={}&via=cron", jobs[2].id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.builder.builds(), vec![(jobs[2].id, String::new(), TriggerSource::Cron)]);
    }

    #[tokio::test]
    async fn test_run_rejects_bad_input() {
        let h = harness(true);
        seed(&h.db).await;
        let app = router(h.state.clone());

        let missing = app.clone().oneshot(form("/run", "revision=abc")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let invalid = app.clone().oneshot(form("/run", "job_id=abc")).await.unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(invalid).await["error"].as_str().unwrap().contains("job_id"));

        let unknown = app.oneshot(form("/run", "job_id=999&revision=abc")).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        assert!(h.builder.builds().is_empty());
    }

    #[tokio::test]
    async fn test_redo_rebuilds_same_revision() {
        let h = harness(true);
        let (_, jobs) = seed(&h.db).await;
        let mut previous = h
            .db
            .repos()
            .tasks
            .create(&Task::new(jobs[0].id, "c0ffee", TriggerSource::Push, jobs[0].command, jobs[0].target.clone()))
            .await
            .unwrap();
        previous.finish(false);
        h.db.repos().tasks.update(&mut previous).await.unwrap();

        let response = router(h.state.clone())
            .oneshot(form("/redo", &format!("task_id={}", previous.id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_ne!(body["task_id"].as_i64().unwrap() as i32, previous.id);
        assert_eq!(h.builder.builds(), vec![(jobs[0].id, "c0ffee".to_string(), TriggerSource::Api)]);
    }
}
