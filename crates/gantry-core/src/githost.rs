//! Git hosting service seam: commit statuses, comments, heads and file lookups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// State of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

/// A commit status attached to a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: StatusState,
    /// Identifies the check, e.g. `test //pkg:test`.
    pub context: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// Operations the orchestrator performs against the git hosting service.
#[async_trait]
pub trait GitHost: Send + Sync {
    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<()>;

    async fn create_comment(&self, owner: &str, repo: &str, number: i32, body: &str)
    -> Result<()>;

    /// Head commit of a pull request.
    async fn pull_request_head(&self, owner: &str, repo: &str, number: i32) -> Result<String>;

    /// Head commit of the repository's default branch.
    async fn default_branch_head(&self, owner: &str, repo: &str) -> Result<String>;

    /// Contents of a file at `reference`, or at the default branch when
    /// `reference` is empty. `None` when the file does not exist.
    async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<String>>;
}
