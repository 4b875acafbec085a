//! Webhook payloads sent by the git hosting service.
//!
//! Only the fields the admission protocol reads are extracted. Parsing returns
//! `None` when a required field is missing so callers can reject the payload
//! as malformed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comment command a trusted user posts to allow an untrusted pull request.
pub const ALLOW_COMMAND: &str = "/allow-build";

/// Commit message / pull request title prefix that suppresses builds.
pub const SKIP_CI: &str = "[skip ci]";

/// File names whose change requires re-discovering the build graph.
pub const MANIFEST_FILES: &[&str] = &["BUILD", "BUILD.bazel", ".bazelversion"];

/// Repository section common to every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRepository {
    /// `owner/name`.
    pub full_name: String,
    pub owner: String,
    pub name: String,
    pub html_url: String,
    pub clone_url: String,
    pub default_branch: String,
    pub private: bool,
}

impl EventRepository {
    fn from_payload(repo: &Value) -> Option<Self> {
        let full_name = repo.get("full_name")?.as_str()?.to_string();
        let name = repo.get("name")?.as_str()?.to_string();
        // Push payloads carry `owner.name`, every other payload `owner.login`.
        let owner = repo
            .get("owner")
            .and_then(|o| o.get("login").or_else(|| o.get("name")))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| full_name.split('/').next().map(str::to_string))?;
        let html_url = repo.get("html_url")?.as_str()?.to_string();
        let clone_url = repo
            .get("clone_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let default_branch = repo
            .get("default_branch")
            .or_else(|| repo.get("master_branch"))
            .and_then(|v| v.as_str())
            .unwrap_or("master")
            .to_string();
        let private = repo
            .get("private")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Some(Self {
            full_name,
            owner,
            name,
            html_url,
            clone_url,
            default_branch,
            private,
        })
    }
}

/// Account that caused the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub login: String,
}

impl Sender {
    fn from_payload(payload: &Value) -> Option<Self> {
        let sender = payload.get("sender")?;
        Some(Self {
            id: sender.get("id")?.as_i64()?,
            login: sender
                .get("login")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Parsed push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    /// Pushed head commit.
    pub after: String,
    pub repository: EventRepository,
    pub head_commit_message: String,
    /// Every path added, modified or removed across the pushed commits.
    pub changed_files: Vec<String>,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload
    pub fn from_github_payload(payload: &Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository = EventRepository::from_payload(payload.get("repository")?)?;

        let head_commit_message = payload
            .get("head_commit")
            .and_then(|c| c.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        let changed_files = payload
            .get("commits")
            .and_then(|c| c.as_array())
            .map(|commits| {
                commits
                    .iter()
                    .flat_map(|commit| {
                        ["added", "modified", "removed"]
                            .into_iter()
                            .filter_map(move |key| commit.get(key).and_then(|v| v.as_array()))
                            .flatten()
                    })
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            r#ref,
            after,
            repository,
            head_commit_message,
            changed_files,
        })
    }

    /// Branch name when the ref points at a branch.
    pub fn branch(&self) -> Option<&str> {
        self.r#ref.strip_prefix("refs/heads/")
    }

    pub fn is_default_branch(&self) -> bool {
        self.branch() == Some(self.repository.default_branch.as_str())
    }

    /// Whether any changed file is a build manifest (compared by base name).
    pub fn touches_manifest(&self) -> bool {
        self.changed_files.iter().any(|path| {
            let base = path.rsplit('/').next().unwrap_or(path);
            MANIFEST_FILES.contains(&base)
        })
    }

    pub fn skip_ci(&self) -> bool {
        self.head_commit_message.starts_with(SKIP_CI)
    }
}

/// Parsed pull request event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i32,
    pub title: String,
    pub head_sha: String,
    pub repository: EventRepository,
    pub sender: Sender,
}

impl PullRequestEvent {
    /// Parse a GitHub pull_request webhook payload
    pub fn from_github_payload(payload: &Value) -> Option<Self> {
        let action = payload.get("action")?.as_str()?.to_string();
        let pr = payload.get("pull_request")?;
        let number = payload
            .get("number")
            .or_else(|| pr.get("number"))?
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())?;
        let title = pr
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let head_sha = pr.get("head")?.get("sha")?.as_str()?.to_string();

        Some(Self {
            action,
            number,
            title,
            head_sha,
            repository: EventRepository::from_payload(payload.get("repository")?)?,
            sender: Sender::from_payload(payload)?,
        })
    }

    pub fn skip_ci(&self) -> bool {
        self.title.starts_with(SKIP_CI)
    }
}

/// Parsed issue comment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub number: i32,
    pub body: String,
    /// Comments on pull requests arrive as issue comments with this set.
    pub is_pull_request: bool,
    pub repository: EventRepository,
    pub sender: Sender,
}

impl IssueCommentEvent {
    /// Parse a GitHub issue_comment webhook payload
    pub fn from_github_payload(payload: &Value) -> Option<Self> {
        let action = payload.get("action")?.as_str()?.to_string();
        let issue = payload.get("issue")?;
        let number = issue
            .get("number")?
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())?;
        let is_pull_request = issue
            .get("pull_request")
            .is_some_and(|v| !v.is_null());
        let body = payload
            .get("comment")
            .and_then(|c| c.get("body"))
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string();

        Some(Self {
            action,
            number,
            body,
            is_pull_request,
            repository: EventRepository::from_payload(payload.get("repository")?)?,
            sender: Sender::from_payload(payload)?,
        })
    }

    pub fn has_allow_command(&self) -> bool {
        self.body.contains(ALLOW_COMMAND)
    }
}
