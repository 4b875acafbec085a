//! Test doubles for the cluster and git hosting seams.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use gantry_cluster::{Cluster, CronJob, Job, Pod};
use gantry_core::githost::{CommitStatus, GitHost};
use gantry_core::{Error, Result};
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};

#[derive(Default)]
pub struct ClusterState {
    pub jobs: Vec<Job>,
    pub created: Vec<Job>,
    pub deleted_jobs: Vec<String>,
    pub pods: Vec<Pod>,
    pub deleted_pods: Vec<String>,
    pub logs: HashMap<(String, String), String>,
    pub cron_jobs: Vec<CronJob>,
    pub replaced_cron_jobs: Vec<String>,
    pub deleted_cron_jobs: Vec<String>,
    pub fail_list_jobs: bool,
    pub fail_create: bool,
    /// Yield before returning pod logs, so concurrent callers interleave.
    pub slow_logs: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn add_pod(&self, name: &str) {
        self.state().pods.push(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    pub fn set_log(&self, pod: &str, container: &str, log: &str) {
        self.state()
            .logs
            .insert((pod.to_string(), container.to_string()), log.to_string());
    }

    pub fn created_names(&self) -> Vec<String> {
        self.state()
            .created
            .iter()
            .filter_map(|j| j.metadata.name.clone())
            .collect()
    }
}

fn matches(metadata: &ObjectMeta, selector: &str) -> bool {
    let labels = metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|l| l == v),
            None => labels.contains_key(pair),
        })
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.state();
        if state.fail_create {
            return Err(Error::Cluster("create refused".to_string()));
        }
        state.jobs.push(job.clone());
        state.created.push(job.clone());
        Ok(job.clone())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .jobs
            .retain(|j| j.metadata.name.as_deref() != Some(name));
        state.deleted_jobs.push(name.to_string());
        Ok(())
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>> {
        let state = self.state();
        if state.fail_list_jobs {
            return Err(Error::Cluster("list refused".to_string()));
        }
        Ok(state
            .jobs
            .iter()
            .filter(|j| matches(&j.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, _label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self.state().pods.clone())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .pods
            .retain(|p| p.metadata.name.as_deref() != Some(name));
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn pod_logs(&self, pod: &str, container: Option<&str>) -> Result<String> {
        let slow = self.state().slow_logs;
        if slow {
            tokio::task::yield_now().await;
        }
        let key = (pod.to_string(), container.unwrap_or_default().to_string());
        self.state()
            .logs
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Cluster(format!("no logs for {}/{}", key.0, key.1)))
    }

    async fn list_cron_jobs(&self, label_selector: &str) -> Result<Vec<CronJob>> {
        Ok(self
            .state()
            .cron_jobs
            .iter()
            .filter(|c| matches(&c.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob> {
        self.state().cron_jobs.push(cron_job.clone());
        Ok(cron_job.clone())
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob> {
        let mut state = self.state();
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        let existing = state
            .cron_jobs
            .iter_mut()
            .find(|c| c.metadata.name.as_deref() == Some(name.as_str()))
            .ok_or_else(|| Error::NotFound(format!("cron job {}", name)))?;
        *existing = cron_job.clone();
        state.replaced_cron_jobs.push(name);
        Ok(cron_job.clone())
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .cron_jobs
            .retain(|c| c.metadata.name.as_deref() != Some(name));
        state.deleted_cron_jobs.push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeGitHost {
    pub statuses: Mutex<Vec<(String, CommitStatus)>>,
    pub comments: Mutex<Vec<(String, i32, String)>>,
    /// File contents by `(path, reference)`.
    pub files: Mutex<HashMap<(String, String), String>>,
    /// `(path, reference)` of every file lookup.
    pub lookups: Mutex<Vec<(String, String)>>,
    pub fail_status: bool,
    pub fail_files: bool,
}

impl FakeGitHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<(String, CommitStatus)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<(String, i32, String)> {
        self.comments.lock().unwrap().clone()
    }

    pub fn set_file(&self, path: &str, reference: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert((path.to_string(), reference.to_string()), content.to_string());
    }

    pub fn lookups(&self) -> Vec<(String, String)> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHost for FakeGitHost {
    async fn create_status(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<()> {
        if self.fail_status {
            return Err(Error::ExternalService("status rejected".to_string()));
        }
        self.statuses
            .lock()
            .unwrap()
            .push((sha.to_string(), status.clone()));
        Ok(())
    }

    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
        body: &str,
    ) -> Result<()> {
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
        path: &str,
        reference: &str,
    ) -> Result<Option<String>> {
        let key = (path.to_string(), reference.to_string());
        self.lookups.lock().unwrap().push(key.clone());
        if self.fail_files {
            return Err(Error::ExternalService("contents unavailable".to_string()));
        }
        Ok(self.files.lock().unwrap().get(&key).cloned())
    }
}

/// A job as the watcher would observe it: scheduled with a pod selector and
/// created `age_secs` ago, optionally carrying a terminal condition.
pub fn observed(mut job: Job, condition: Option<&str>, age_secs: i64) -> Job {
    job.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(age_secs)));
    if let Some(spec) = job.spec.as_mut() {
        spec.selector = Some(LabelSelector {
            match_labels: Some(
                [("controller-uid".to_string(), "uid".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        });
    }
    let conditions = condition.map(|c| {
        vec![JobCondition {
            type_: c.to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]
    });
    job.status = Some(JobStatus {
        start_time: Some(Time(Utc::now())),
        completion_time: (condition == Some("Complete")).then(|| Time(Utc::now())),
        conditions,
        ..Default::default()
    });
    job
}
