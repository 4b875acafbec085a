//! Job definitions discovered from a repository's build graph.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::tracking::{Change, ChangeSet, Tracked};

/// The build-tool command a job definition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    #[display("build")]
    Build,
    #[display("test")]
    Test,
    #[display("run")]
    Run,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Build => "build",
            Command::Test => "test",
            Command::Run => "run",
        }
    }

    /// Whether repository events (push, pull request) trigger this command.
    /// `run` targets are only started explicitly.
    pub fn is_triggered_by_events(&self) -> bool {
        matches!(self, Command::Build | Command::Test)
    }
}

impl std::str::FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Command::Build),
            "test" => Ok(Command::Test),
            "run" => Ok(Command::Run),
            _ => Err(format!("unknown command: {}", s)),
        }
    }
}

/// A discovered, persistent build recipe.
///
/// Identified for reconciliation purposes by `(repository_id, command, target)`.
/// Never deleted; targets that disappear from the build graph are deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i32,
    pub repository_id: i32,
    pub command: Command,
    /// Full target label, e.g. `//tools/unissh:pkg`.
    pub target: String,
    pub active: bool,
    pub all_revision: bool,
    pub github_status: bool,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub exclusive: bool,
    pub config_name: Option<String>,
    pub bazel_version: Option<String>,
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    mark: Option<Box<JobDefinition>>,
}

impl JobDefinition {
    pub fn new(repository_id: i32, command: Command, target: impl Into<String>) -> Self {
        Self {
            id: 0,
            repository_id,
            command,
            target: target.into(),
            active: true,
            all_revision: false,
            github_status: false,
            cpu_limit: None,
            memory_limit: None,
            exclusive: false,
            config_name: None,
            bazel_version: None,
            schedule: None,
            created_at: Utc::now(),
            updated_at: None,
            mark: None,
        }
    }

    /// Key used to match stored definitions with discovered targets.
    pub fn reconcile_key(&self) -> String {
        format!("{}/{}", self.command, self.target)
    }

    pub fn is_triggered_by_events(&self) -> bool {
        self.active && self.command.is_triggered_by_events()
    }
}

impl Tracked for JobDefinition {
    const TABLE: &'static str = "job";

    fn id(&self) -> i32 {
        self.id
    }

    fn changes(&self) -> Vec<Change> {
        ChangeSet::new(self.mark.as_deref())
            .field("active", &self.active, |s| &s.active)
            .field("all_revision", &self.all_revision, |s| &s.all_revision)
            .field("github_status", &self.github_status, |s| &s.github_status)
            .field("cpu_limit", &self.cpu_limit, |s| &s.cpu_limit)
            .field("memory_limit", &self.memory_limit, |s| &s.memory_limit)
            .field("exclusive", &self.exclusive, |s| &s.exclusive)
            .field("config_name", &self.config_name, |s| &s.config_name)
            .field("bazel_version", &self.bazel_version, |s| &s.bazel_version)
            .field("schedule", &self.schedule, |s| &s.schedule)
            .finish()
    }

    fn reset_mark(&mut self) {
        self.mark = None;
        self.mark = Some(Box::new(self.clone()));
    }
}
