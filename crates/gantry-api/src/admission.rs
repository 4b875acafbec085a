//! Webhook admission: which events build what.
//!
//! Pushes to the default branch build every active build/test definition of
//! the repository, and pushes touching a build manifest re-run discovery.
//! Pull requests build only when the author is a trusted user or a trusted
//! user granted a permit for that pull request with the allow command.

use std::sync::Arc;

use gantry_core::event::{
    ALLOW_COMMAND, EventRepository, IssueCommentEvent, PullRequestEvent, PushEvent,
};
use gantry_core::githost::GitHost;
use gantry_core::{Error, PullRequestPermit, Repository, Result, TriggerSource};
use gantry_db::Repos;
use gantry_scheduler::{Builder, Discoverer};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Posted on pull requests whose author may not trigger builds.
pub fn not_allowed_comment() -> String {
    format!(
        "Sorry, We could not build this pull request. Because building this pull request is not allowed due to security reason.\n\n\
         For author, Thank you for your contribution. We appreciate your work. Please wait for permitting to build this pull request by administrator.\n\
         For administrator, If you are going to allow this pull request, please comment `{}`.",
        ALLOW_COMMAND
    )
}

/// Posted after a trusted user allowed a pull request.
pub const ALLOWED_COMMENT: &str =
    "Understood. This pull request added to allow list.\nWe are going to build the job.";

/// A webhook delivery, classified by its `X-GitHub-Event` header.
#[derive(Debug)]
pub enum WebhookEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    IssueComment(IssueCommentEvent),
    Ping,
    Other(String),
}

impl WebhookEvent {
    /// Parse a payload. Known event kinds missing required fields are malformed.
    pub fn parse(kind: &str, payload: &Value) -> Result<Self> {
        let malformed = || Error::MalformedInput(format!("invalid {} payload", kind));
        match kind {
            "push" => PushEvent::from_github_payload(payload)
                .map(WebhookEvent::Push)
                .ok_or_else(malformed),
            "pull_request" => PullRequestEvent::from_github_payload(payload)
                .map(WebhookEvent::PullRequest)
                .ok_or_else(malformed),
            "issue_comment" => IssueCommentEvent::from_github_payload(payload)
                .map(WebhookEvent::IssueComment)
                .ok_or_else(malformed),
            "ping" => Ok(WebhookEvent::Ping),
            other => Ok(WebhookEvent::Other(other.to_string())),
        }
    }
}

pub struct Admission {
    repos: Repos,
    builder: Arc<dyn Builder>,
    discoverer: Arc<dyn Discoverer>,
    github: Option<Arc<dyn GitHost>>,
}

impl Admission {
    pub fn new(
        repos: Repos,
        builder: Arc<dyn Builder>,
        discoverer: Arc<dyn Discoverer>,
        github: Option<Arc<dyn GitHost>>,
    ) -> Self {
        Self {
            repos,
            builder,
            discoverer,
            github,
        }
    }

    pub async fn handle(&self, event: WebhookEvent) -> Result<()> {
        match event {
            WebhookEvent::Push(event) => self.on_push(&event).await,
            WebhookEvent::PullRequest(event) => self.on_pull_request(&event).await,
            WebhookEvent::IssueComment(event) => self.on_issue_comment(&event).await,
            WebhookEvent::Ping => {
                info!("received ping");
                Ok(())
            }
            WebhookEvent::Other(kind) => {
                debug!(event = %kind, "ignoring webhook event");
                Ok(())
            }
        }
    }

    pub async fn on_push(&self, event: &PushEvent) -> Result<()> {
        let Some(repository) = self.find_repository(&event.repository.html_url).await else {
            return Ok(());
        };

        if event.touches_manifest() {
            match self.discoverer.find_out(&repository, "").await {
                Ok(()) => info!(repository.id = repository.id, "build manifest changed, discovering"),
                Err(e) => warn!(repository.id = repository.id, error = %e, "failed to start discovery"),
            }
        }

        if !event.is_default_branch() {
            return Ok(());
        }
        if event.skip_ci() {
            info!(repo = %event.repository.full_name, revision = %event.after, "skip build");
            return Ok(());
        }
        self.build_repository(&repository, &event.after, TriggerSource::Push)
            .await;
        Ok(())
    }

    pub async fn on_pull_request(&self, event: &PullRequestEvent) -> Result<()> {
        let repo = &event.repository;
        match event.action.as_str() {
            "opened" | "reopened" => {
                if !self
                    .is_allowed(&repo.full_name, event.number, event.sender.id)
                    .await?
                {
                    info!(
                        repo = %repo.full_name,
                        number = event.number,
                        sender = %event.sender.login,
                        "pull request is not allowed to build"
                    );
                    return self
                        .comment(repo, event.number, &not_allowed_comment())
                        .await;
                }
                self.build_pull_request(event).await;
                Ok(())
            }
            "synchronize" => {
                if self
                    .is_allowed(&repo.full_name, event.number, event.sender.id)
                    .await?
                {
                    self.build_pull_request(event).await;
                }
                Ok(())
            }
            "closed" => {
                if let Some(permit) = self.repos.permits.find(&repo.full_name, event.number).await? {
                    self.repos.permits.delete(permit.id).await?;
                    info!(repo = %repo.full_name, number = event.number, "permit removed");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn on_issue_comment(&self, event: &IssueCommentEvent) -> Result<()> {
        if event.action != "created" || !event.is_pull_request || !event.has_allow_command() {
            return Ok(());
        }
        let repo = &event.repository;

        let Some(user) = self
            .repos
            .trusted_users
            .get_by_github_id(event.sender.id)
            .await?
        else {
            info!(
                repo = %repo.full_name,
                number = event.number,
                sender = %event.sender.login,
                "ignoring allow command from untrusted user"
            );
            return Ok(());
        };
        if self
            .repos
            .permits
            .find(&repo.full_name, event.number)
            .await?
            .is_some()
        {
            debug!(repo = %repo.full_name, number = event.number, "pull request already allowed");
            return Ok(());
        }

        self.repos
            .permits
            .create(&PullRequestPermit::new(repo.full_name.clone(), event.number))
            .await?;
        info!(repo = %repo.full_name, number = event.number, by = %user.username, "pull request allowed");
        self.comment(repo, event.number, ALLOWED_COMMENT).await?;

        let Some(github) = &self.github else {
            warn!("git host is not configured, cannot resolve pull request head");
            return Ok(());
        };
        let head = match github
            .pull_request_head(&repo.owner, &repo.name, event.number)
            .await
        {
            Ok(head) => head,
            Err(e) => {
                warn!(repo = %repo.full_name, number = event.number, error = %e, "failed to get pull request head");
                return Ok(());
            }
        };
        if let Some(repository) = self.find_repository(&repo.html_url).await {
            self.build_repository(&repository, &head, TriggerSource::PullRequest)
                .await;
        }
        Ok(())
    }

    /// A pull request may build when its author is trusted or a permit exists.
    pub async fn is_allowed(&self, repository: &str, number: i32, sender_id: i64) -> Result<bool> {
        if self
            .repos
            .trusted_users
            .get_by_github_id(sender_id)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        Ok(self.repos.permits.find(repository, number).await?.is_some())
    }

    async fn build_pull_request(&self, event: &PullRequestEvent) {
        if event.skip_ci() {
            info!(repo = %event.repository.full_name, number = event.number, "skip build");
            return;
        }
        if let Some(repository) = self.find_repository(&event.repository.html_url).await {
            self.build_repository(&repository, &event.head_sha, TriggerSource::PullRequest)
                .await;
        }
    }

    /// Build every event-triggered definition of `repository`. Returns the number of tasks created.
    async fn build_repository(
        &self,
        repository: &Repository,
        revision: &str,
        via: TriggerSource,
    ) -> usize {
        let jobs = match self.repos.jobs.list_by_repository(repository.id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(repository.id = repository.id, error = %e, "failed to list job definitions");
                return 0;
            }
        };

        let mut created = 0;
        for job in jobs.iter().filter(|j| j.is_triggered_by_events()) {
            match self.builder.build(job, revision, via).await {
                Ok(task) => {
                    debug!(job.id = job.id, task.id = task.id, "build triggered");
                    created += 1;
                }
                Err(e) => warn!(job.id = job.id, revision, error = %e, "failed to build"),
            }
        }
        info!(repository.id = repository.id, revision, via = %via, created, "triggered builds");
        created
    }

    /// The registered repository for `html_url`. Unknown or ambiguous URLs yield nothing.
    async fn find_repository(&self, html_url: &str) -> Option<Repository> {
        match self.repos.repositories.list_by_url(html_url).await {
            Ok(mut found) if found.len() == 1 => found.pop(),
            Ok(found) if found.is_empty() => {
                info!(url = %html_url, "repository is not registered");
                None
            }
            Ok(found) => {
                warn!(url = %html_url, count = found.len(), "repository url is registered more than once");
                None
            }
            Err(e) => {
                warn!(url = %html_url, error = %e, "failed to look up repository");
                None
            }
        }
    }

    async fn comment(&self, repo: &EventRepository, number: i32, body: &str) -> Result<()> {
        let Some(github) = &self.github else {
            warn!(repo = %repo.full_name, number, "git host is not configured, comment dropped");
            return Ok(());
        };
        github
            .create_comment(&repo.owner, &repo.name, number, body)
            .await
            .inspect_err(|e| warn!(repo = %repo.full_name, number, error = %e, "failed to comment"))
    }
}
