//! Source repositories and the allow-list entities used by pull request admission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::tracking::{Change, ChangeSet, Tracked};

/// A remote source location that job definitions are discovered from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i32,
    pub name: String,
    /// Canonical (browser) URL, e.g. `https://github.com/f110/ops`.
    pub url: String,
    pub clone_url: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    mark: Option<Box<Repository>>,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        clone_url: impl Into<String>,
        private: bool,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            url: url.into(),
            clone_url: clone_url.into(),
            private,
            created_at: Utc::now(),
            updated_at: None,
            mark: None,
        }
    }

    /// Owner and repository name when the repository is hosted on github.com.
    pub fn github_owner_and_name(&self) -> Option<(String, String)> {
        let url = Url::parse(&self.url).ok()?;
        if url.host_str()? != "github.com" {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let owner = segments.next()?.to_string();
        let name = segments.next()?.trim_end_matches(".git").to_string();
        Some((owner, name))
    }
}

impl Tracked for Repository {
    const TABLE: &'static str = "source_repository";

    fn id(&self) -> i32 {
        self.id
    }

    fn changes(&self) -> Vec<Change> {
        ChangeSet::new(self.mark.as_deref())
            .field("name", &self.name, |s| &s.name)
            .field("url", &self.url, |s| &s.url)
            .field("clone_url", &self.clone_url, |s| &s.clone_url)
            .field("private", &self.private, |s| &s.private)
            .finish()
    }

    fn reset_mark(&mut self) {
        self.mark = None;
        self.mark = Some(Box::new(self.clone()));
    }
}

/// A git hosting account whose pull requests build without a permit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedUser {
    pub id: i32,
    pub github_id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    mark: Option<Box<TrustedUser>>,
}

impl TrustedUser {
    pub fn new(github_id: i64, username: impl Into<String>) -> Self {
        Self {
            id: 0,
            github_id,
            username: username.into(),
            created_at: Utc::now(),
            mark: None,
        }
    }
}

impl Tracked for TrustedUser {
    const TABLE: &'static str = "trusted_user";
    const HAS_UPDATED_AT: bool = false;

    fn id(&self) -> i32 {
        self.id
    }

    fn changes(&self) -> Vec<Change> {
        ChangeSet::new(self.mark.as_deref())
            .field("github_id", &self.github_id, |s| &s.github_id)
            .field("username", &self.username, |s| &s.username)
            .finish()
    }

    fn reset_mark(&mut self) {
        self.mark = None;
        self.mark = Some(Box::new(self.clone()));
    }
}

/// A one-shot grant allowing a specific pull request to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestPermit {
    pub id: i32,
    /// Repository full name (`owner/name`).
    pub repository: String,
    pub number: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    mark: Option<Box<PullRequestPermit>>,
}

impl PullRequestPermit {
    pub fn new(repository: impl Into<String>, number: i32) -> Self {
        Self {
            id: 0,
            repository: repository.into(),
            number,
            created_at: Utc::now(),
            mark: None,
        }
    }
}

impl Tracked for PullRequestPermit {
    const TABLE: &'static str = "permit_pull_request";
    const HAS_UPDATED_AT: bool = false;

    fn id(&self) -> i32 {
        self.id
    }

    fn changes(&self) -> Vec<Change> {
        ChangeSet::new(self.mark.as_deref())
            .field("repository", &self.repository, |s| &s.repository)
            .field("number", &self.number, |s| &s.number)
            .finish()
    }

    fn reset_mark(&mut self) {
        self.mark = None;
        self.mark = Some(Box::new(self.clone()));
    }
}
