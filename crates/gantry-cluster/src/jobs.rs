//! Labels and status helpers for cluster jobs created by gantry.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};

/// Label carrying the router type key.
pub const TYPE_LABEL: &str = "build.f110.dev/type";
pub const CONTROL_BY_LABEL: &str = "build.f110.dev/control-by";
pub const CONTROL_BY_VALUE: &str = "bazel-build";
pub const JOB_ID_LABEL: &str = "build.f110.dev/job-id";
pub const TASK_ID_LABEL: &str = "build.f110.dev/task-id";
pub const REPO_NAME_LABEL: &str = "build.f110.dev/repo-name";
pub const REPOSITORY_ID_LABEL: &str = "build.f110.dev/repository-id";
pub const REVISION_LABEL: &str = "build.f110.dev/revision";
pub const BAZEL_VERSION_LABEL: &str = "build.f110.dev/bazel-version";

/// Terminal state reported by a job's status conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// No conditions reported yet.
    Pending,
    /// Conditions exist but none is terminal.
    Running,
    Complete,
    Failed,
}

pub fn name(job: &Job) -> &str {
    job.metadata.name.as_deref().unwrap_or_default()
}

pub fn label<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn is_deleted(job: &Job) -> bool {
    job.metadata.deletion_timestamp.is_some()
}

/// Mark a job as being deleted, keeping an existing deletion timestamp.
pub fn mark_deleted(job: &mut Job) {
    if job.metadata.deletion_timestamp.is_none() {
        job.metadata.deletion_timestamp = Some(Time(Utc::now()));
    }
}

pub fn created_at(job: &Job) -> Option<DateTime<Utc>> {
    job.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

pub fn outcome(job: &Job) -> JobOutcome {
    let conditions = match job.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        Some(c) if !c.is_empty() => c,
        _ => return JobOutcome::Pending,
    };
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobOutcome::Complete,
            "Failed" => return JobOutcome::Failed,
            _ => {}
        }
    }
    JobOutcome::Running
}

pub fn is_completed(job: &Job) -> bool {
    job.status
        .as_ref()
        .is_some_and(|s| s.completion_time.is_some())
}

/// Render a label selector in the `key=value,key in (a,b)` query form.
pub fn selector_string(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (k, v) in labels {
            parts.push(format!("{}={}", k, v));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, values)),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, values)),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                _ => {}
            }
        }
    }
    parts.join(",")
}

/// Selector matching the pods backing a job.
pub fn pod_selector(job: &Job) -> String {
    job.spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .map(selector_string)
        .unwrap_or_default()
}
