//! Test doubles for the scheduler and git hosting seams, and request helpers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use gantry_core::githost::{CommitStatus, GitHost};
use gantry_core::{Command, Error, JobDefinition, Repository, Result, Task, TriggerSource};
use gantry_db::Repos;
use gantry_db::memory::{MemoryDb, StaticSchemaCheck};
use gantry_scheduler::{Builder, Discoverer, DiscoveryViewer};
use serde_json::Value;

use crate::AppState;

/// Records build requests and persists a task for each.
pub struct FakeBuilder {
    repos: Repos,
    pub builds: Mutex<Vec<(i32, String, TriggerSource)>>,
}

impl FakeBuilder {
    pub fn new(repos: Repos) -> Self {
        Self {
            repos,
            builds: Mutex::new(Vec::new()),
        }
    }

    pub fn builds(&self) -> Vec<(i32, String, TriggerSource)> {
        self.builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, job: &JobDefinition, revision: &str, via: TriggerSource) -> Result<Task> {
        self.builds
            .lock()
            .unwrap()
            .push((job.id, revision.to_string(), via));
        let task = Task::new(job.id, revision, via, job.command, job.target.clone());
        Ok(self.repos.tasks.create(&task).await?)
    }
}

#[derive(Default)]
pub struct FakeDiscoverer {
    pub runs: Mutex<Vec<(i32, String)>>,
}

impl FakeDiscoverer {
    pub fn runs(&self) -> Vec<(i32, String)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Discoverer for FakeDiscoverer {
    async fn find_out(&self, repository: &Repository, revision: &str) -> Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((repository.id, revision.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeGitHost {
    pub comments: Mutex<Vec<(String, i32, String)>>,
    pub fail_comment: bool,
}

impl FakeGitHost {
    pub fn comments(&self) -> Vec<(String, i32, String)> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHost for FakeGitHost {
    async fn create_status(
        &self,
        _owner: &str,
        _repo: &str,
        _sha: &str,
        _status: &CommitStatus,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
        body: &str,
    ) -> Result<()> {
        if self.fail_comment {
            return Err(Error::ExternalService("comment rejected".to_string()));
        }
        self.comments
            .lock()
            .unwrap()
            .push((format!("{}/{}", owner, repo), number, body.to_string()));
        Ok(())
    }

    async fn pull_request_head(&self, _owner: &str, _repo: &str, number: i32) -> Result<String> {
        Ok(format!("pr-{}-head", number))
    }

    async fn default_branch_head(&self, _owner: &str, _repo: &str) -> Result<String> {
        Ok("main-head".to_string())
    }

    async fn file_content(
        &self,
        _owner: &str,
        _repo: &str,
        _path: &str,
        _reference: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// `f110/ops` with one build, one test and one run definition.
pub async fn seed(db: &MemoryDb) -> (Repository, Vec<JobDefinition>) {
    let repos = db.repos();
    let repository = repos
        .repositories
        .create(&Repository::new(
            "ops",
            "https://github.com/f110/ops",
            "https://github.com/f110/ops.git",
            false,
        ))
        .await
        .unwrap();
    let mut jobs = Vec::new();
    for (command, target) in [
        (Command::Build, "//app:bin"),
        (Command::Test, "//app:test"),
        (Command::Run, "//app:deploy"),
    ] {
        let job = repos
            .jobs
            .create(&JobDefinition::new(repository.id, command, target))
            .await
            .unwrap();
        jobs.push(job);
    }
    (repository, jobs)
}

pub struct Harness {
    pub db: MemoryDb,
    pub builder: Arc<FakeBuilder>,
    pub discoverer: Arc<FakeDiscoverer>,
    pub github: Arc<FakeGitHost>,
    pub viewer: Arc<DiscoveryViewer>,
    pub state: AppState,
}

/// Application state over an in-memory database and recording fakes.
pub fn harness(ready: bool) -> Harness {
    let db = MemoryDb::new();
    let builder = Arc::new(FakeBuilder::new(db.repos()));
    let discoverer = Arc::new(FakeDiscoverer::default());
    let github = Arc::new(FakeGitHost::default());
    let viewer = Arc::new(DiscoveryViewer::new());
    let state = AppState::new(
        db.repos(),
        builder.clone(),
        discoverer.clone(),
        Some(github.clone()),
        viewer.clone(),
        Arc::new(StaticSchemaCheck(ready)),
    );
    Harness {
        db,
        builder,
        discoverer,
        github,
        viewer,
        state,
    }
}

pub fn form(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
