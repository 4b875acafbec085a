//! Tasks: single executions of a job definition.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::job::Command;
use crate::tracking::{Change, ChangeSet, Tracked};

/// What caused a task to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[display("push")]
    Push,
    #[display("pull_request")]
    PullRequest,
    #[display("api")]
    Api,
    /// A scheduled run started by a CronJob.
    #[display("cron")]
    Cron,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Push => "push",
            TriggerSource::PullRequest => "pull_request",
            TriggerSource::Api => "api",
            TriggerSource::Cron => "cron",
        }
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TriggerSource::Push),
            "pr" | "pull_request" => Ok(TriggerSource::PullRequest),
            "api" => Ok(TriggerSource::Api),
            "cron" => Ok(TriggerSource::Cron),
            _ => Err(format!("unknown trigger source: {}", s)),
        }
    }
}

/// One execution of a job definition at a revision.
///
/// A task with `finished_at` set is terminal and never changes again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i32,
    pub job_id: i32,
    pub revision: String,
    pub success: bool,
    pub log_file: Option<String>,
    pub via: TriggerSource,
    pub command: Command,
    pub target: String,
    /// Set once a cluster job exists for the task. `None` while queued.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    mark: Option<Box<Task>>,
}

impl Task {
    pub fn new(
        job_id: i32,
        revision: impl Into<String>,
        via: TriggerSource,
        command: Command,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            job_id,
            revision: revision.into(),
            success: false,
            log_file: None,
            via,
            command,
            target: target.into(),
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
            updated_at: None,
            mark: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Mark the task terminal with the given outcome.
    pub fn finish(&mut self, success: bool) {
        self.success = success;
        self.finished_at = Some(Utc::now());
    }
}

impl Tracked for Task {
    const TABLE: &'static str = "task";

    fn id(&self) -> i32 {
        self.id
    }

    fn changes(&self) -> Vec<Change> {
        ChangeSet::new(self.mark.as_deref())
            .field("revision", &self.revision, |s| &s.revision)
            .field("success", &self.success, |s| &s.success)
            .field("log_file", &self.log_file, |s| &s.log_file)
            .field("started_at", &self.started_at, |s| &s.started_at)
            .field("finished_at", &self.finished_at, |s| &s.finished_at)
            .finish()
    }

    fn reset_mark(&mut self) {
        self.mark = None;
        self.mark = Some(Box::new(self.clone()));
    }
}
