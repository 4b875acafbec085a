//! Build coordinator: launches build jobs and drives tasks to a terminal state.
//!
//! A task moves from pending to running once its cluster job exists, and to
//! succeeded, failed or timed out when the job's conditions say so. Terminal
//! transitions store the job's logs, report a commit status, tear the job
//! down, and only then persist the task. A task whose `finished_at` is set is
//! never touched again, so replayed watch events are harmless.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use gantry_cluster::jobs::{
    self, BAZEL_VERSION_LABEL, CONTROL_BY_LABEL, CONTROL_BY_VALUE, JOB_ID_LABEL, JobOutcome,
    TASK_ID_LABEL, TYPE_LABEL,
};
use gantry_cluster::{Cluster, Job, JobHandler};
use gantry_config::SystemConfig;
use gantry_core::artifact::{LogStore, compose_build_log};
use gantry_core::githost::{CommitStatus, GitHost, StatusState};
use gantry_core::{Error, JobDefinition, Repository, Result, Task, TriggerSource};
use gantry_db::Repos;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::queue::TaskQueue;

/// Router type key of build jobs.
pub const JOB_TYPE: &str = "bazelBuilder";

const WORK_VOLUME: &str = "workdir";
const WORK_DIR: &str = "/work";

/// Starts builds of job definitions.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Create a task for `job` at `revision` and launch (or queue) its cluster job.
    async fn build(&self, job: &JobDefinition, revision: &str, via: TriggerSource)
    -> Result<Task>;
}

/// Images, defaults and limits applied to every job gantry creates.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub namespace: String,
    pub dashboard_url: String,
    pub bazel_image: String,
    pub default_bazel_version: String,
    pub sidecar_image: String,
    /// Image of the container scheduled runs post to `/run` from.
    pub trigger_image: String,
    /// Base URL of the server as seen from inside the cluster.
    pub api_url: String,
    pub remote_cache: Option<String>,
    pub remote_asset: bool,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub timeout: Duration,
}

impl BuilderOptions {
    pub fn from_config(config: &SystemConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            dashboard_url: config.dashboard_url.clone(),
            bazel_image: config.bazel.image.clone(),
            default_bazel_version: config.bazel.default_version.clone(),
            sidecar_image: config.bazel.sidecar_image.clone(),
            trigger_image: config.schedule.trigger_image.clone(),
            api_url: config.schedule.api_url.clone(),
            remote_cache: config.bazel.remote_cache.clone(),
            remote_asset: config.bazel.remote_asset,
            cpu_limit: config.task.cpu_limit.clone(),
            memory_limit: config.task.memory_limit.clone(),
            timeout: config.task.timeout(),
        }
    }

    fn image(&self, version: Option<&str>) -> String {
        format!(
            "{}:{}",
            self.bazel_image,
            version.unwrap_or(&self.default_bazel_version)
        )
    }
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self::from_config(&SystemConfig::default())
    }
}

/// Init container cloning the repository into the shared work volume.
pub(crate) fn clone_container(options: &BuilderOptions, clone_url: &str, revision: &str) -> Container {
    let mut args = vec![
        "--action=clone".to_string(),
        "--work-dir=work".to_string(),
        format!("--url={}", clone_url),
    ];
    if !revision.is_empty() {
        args.push(format!("--commit={}", revision));
    }
    Container {
        name: "pre-process".to_string(),
        image: Some(options.sidecar_image.clone()),
        args: Some(args),
        working_dir: Some("/".to_string()),
        volume_mounts: Some(vec![work_mount()]),
        ..Default::default()
    }
}

pub(crate) fn work_mount() -> VolumeMount {
    VolumeMount {
        name: WORK_VOLUME.to_string(),
        mount_path: WORK_DIR.to_string(),
        ..Default::default()
    }
}

pub(crate) fn work_volume() -> Volume {
    Volume {
        name: WORK_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Arguments of the build step: command, cache flags, config, target.
pub fn build_args(options: &BuilderOptions, job: &JobDefinition) -> Vec<String> {
    let mut args = vec![job.command.to_string()];
    if let Some(cache) = &options.remote_cache {
        args.push(format!("--remote_cache={}", cache));
        if options.remote_asset {
            args.push(format!("--experimental_remote_downloader={}", cache));
        }
    }
    if let Some(config) = job.config_name.as_deref().filter(|c| !c.is_empty()) {
        args.push(format!("--config={}", config));
    }
    args.push(job.target.clone());
    args
}

/// Cluster job running one task of `job`.
pub fn build_job_template(
    options: &BuilderOptions,
    repository: &Repository,
    job: &JobDefinition,
    task: &Task,
) -> Job {
    let version = job.bazel_version.as_deref();
    let labels = BTreeMap::from([
        (TYPE_LABEL.to_string(), JOB_TYPE.to_string()),
        (CONTROL_BY_LABEL.to_string(), CONTROL_BY_VALUE.to_string()),
        (JOB_ID_LABEL.to_string(), job.id.to_string()),
        (TASK_ID_LABEL.to_string(), task.id.to_string()),
        (
            BAZEL_VERSION_LABEL.to_string(),
            version.unwrap_or(&options.default_bazel_version).to_string(),
        ),
    ]);
    let pod_labels = BTreeMap::from([
        (TASK_ID_LABEL.to_string(), task.id.to_string()),
        (CONTROL_BY_LABEL.to_string(), CONTROL_BY_VALUE.to_string()),
    ]);
    let limits = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(job.cpu_limit.clone().unwrap_or_else(|| options.cpu_limit.clone())),
        ),
        (
            "memory".to_string(),
            Quantity(
                job.memory_limit
                    .clone()
                    .unwrap_or_else(|| options.memory_limit.clone()),
            ),
        ),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", repository.name, task.id)),
            namespace: Some(options.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![clone_container(
                        options,
                        &repository.clone_url,
                        &task.revision,
                    )]),
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some(options.image(version)),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(build_args(options, job)),
                        working_dir: Some(WORK_DIR.to_string()),
                        volume_mounts: Some(vec![work_mount()]),
                        resources: Some(ResourceRequirements {
                            limits: Some(limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![work_volume()]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Task ids a `sync` call is currently driving.
#[derive(Default)]
struct InFlight {
    ids: std::sync::Mutex<HashSet<i32>>,
}

struct Claim<'a> {
    in_flight: &'a InFlight,
    id: i32,
}

impl InFlight {
    /// Claim a task, or `None` when another sync already holds it.
    fn claim(&self, id: i32) -> Option<Claim<'_>> {
        let mut ids = self.ids.lock().ok()?;
        ids.insert(id).then_some(Claim {
            in_flight: self,
            id,
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.in_flight.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

pub struct BazelBuilder {
    options: BuilderOptions,
    cluster: Arc<dyn Cluster>,
    repos: Repos,
    logs: Arc<dyn LogStore>,
    github: Option<Arc<dyn GitHost>>,
    queue: TaskQueue,
    in_flight: InFlight,
    trigger_lock: Mutex<()>,
}

impl BazelBuilder {
    pub fn new(
        options: BuilderOptions,
        cluster: Arc<dyn Cluster>,
        repos: Repos,
        logs: Arc<dyn LogStore>,
        github: Option<Arc<dyn GitHost>>,
    ) -> Self {
        Self {
            options,
            cluster,
            repos,
            logs,
            github,
            queue: TaskQueue::new(),
            in_flight: InFlight::default(),
            trigger_lock: Mutex::new(()),
        }
    }

    pub fn queued(&self, job_id: i32) -> usize {
        self.queue.len(job_id)
    }

    /// Whether a cluster job of the definition is still in flight. Listing
    /// errors count as running.
    async fn is_running_job(&self, job: &JobDefinition) -> bool {
        let selector = format!("{}={}", JOB_ID_LABEL, job.id);
        match self.cluster.list_jobs(&selector).await {
            Ok(found) => found.iter().any(|j| {
                !jobs::is_deleted(j)
                    && matches!(jobs::outcome(j), JobOutcome::Pending | JobOutcome::Running)
            }),
            Err(e) => {
                warn!(job.id = job.id, error = %e, "could not list jobs, assuming running");
                true
            }
        }
    }

    /// Create the cluster job of a task and mark it started. A task whose job
    /// cannot be created is finished as failed.
    async fn launch(
        &self,
        job: &JobDefinition,
        repository: &Repository,
        mut task: Task,
    ) -> Result<Task> {
        let template = build_job_template(&self.options, repository, job, &task);
        if let Err(e) = self.cluster.create_job(&template).await {
            task.finish(false);
            if let Err(update) = self.repos.tasks.update(&mut task).await {
                warn!(task.id = task.id, error = %update, "failed to record launch failure");
            }
            return Err(e);
        }

        task.started_at = Some(Utc::now());
        self.repos.tasks.update(&mut task).await?;
        info!(
            job.name = %jobs::name(&template),
            task.id = task.id,
            job.id = job.id,
            revision = %task.revision,
            "build job created"
        );

        if job.github_status {
            self.report_status(repository, &task, StatusState::Pending)
                .await;
        }
        Ok(task)
    }

    /// Best-effort commit status for a task.
    async fn report_status(&self, repository: &Repository, task: &Task, state: StatusState) {
        let Some(github) = &self.github else {
            return;
        };
        if task.revision.is_empty() {
            return;
        }
        let Some((owner, name)) = repository.github_owner_and_name() else {
            return;
        };

        let target_url = match state {
            StatusState::Success | StatusState::Failure => task.log_file.as_ref().map(|key| {
                format!("{}/logs/{}", self.options.dashboard_url.trim_end_matches('/'), key)
            }),
            _ => None,
        };
        let description = match state {
            StatusState::Pending => "Build started",
            StatusState::Success => "Build succeeded",
            StatusState::Failure => "Build failed",
            StatusState::Error => "Build timed out",
        };
        let status = CommitStatus {
            state,
            context: format!("{} {}", task.command, task.target),
            description: description.to_string(),
            target_url,
        };
        if let Err(e) = github
            .create_status(&owner, &name, &task.revision, &status)
            .await
        {
            warn!(task.id = task.id, state = state.as_str(), error = %e, "failed to report commit status");
        }
    }

    /// Drive the task behind `job` forward from the job's observed state.
    pub async fn sync(&self, job: &Job) -> Result<()> {
        if jobs::is_deleted(job) {
            debug!(job.name = %jobs::name(job), "job is being deleted");
            return Ok(());
        }
        let Some(raw) = jobs::label(job, TASK_ID_LABEL) else {
            return Ok(());
        };
        let task_id: i32 = raw
            .parse()
            .map_err(|_| Error::MalformedInput(format!("task id label: {}", raw)))?;
        let Some(_claim) = self.in_flight.claim(task_id) else {
            debug!(job.name = %jobs::name(job), task.id = task_id, "task is already being synced");
            return Ok(());
        };

        let mut task = match self.repos.tasks.get(task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                debug!(job.name = %jobs::name(job), task.id = task_id, "task not found");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if task.is_finished() {
            return Ok(());
        }
        let definition = self.repos.jobs.get(task.job_id).await?;

        let age = jobs::created_at(job).map(|created| Utc::now() - created);
        let timeout = chrono::Duration::from_std(self.options.timeout)
            .map_err(|e| Error::Internal(e.to_string()))?;
        if age.is_some_and(|age| age > timeout) {
            return self.time_out(job, &definition, task).await;
        }

        let success = match jobs::outcome(job) {
            JobOutcome::Pending | JobOutcome::Running => return Ok(()),
            JobOutcome::Complete => true,
            JobOutcome::Failed => false,
        };

        let repository = self.repos.repositories.get(definition.repository_id).await?;
        self.finalize(job, &repository, &definition, &mut task, success)
            .await?;
        gantry_cluster::teardown(self.cluster.as_ref(), job).await?;
        self.repos.tasks.update(&mut task).await?;

        info!(
            job.name = %jobs::name(job),
            task.id = task.id,
            job.id = definition.id,
            success,
            elapsed_secs = age.map(|a| a.num_seconds()).unwrap_or_default(),
            "task finished"
        );
        self.dequeue(definition.id).await;
        Ok(())
    }

    /// Store the job's logs and report the outcome. Runs once per task.
    async fn finalize(
        &self,
        job: &Job,
        repository: &Repository,
        definition: &JobDefinition,
        task: &mut Task,
        success: bool,
    ) -> Result<()> {
        let pod = gantry_cluster::single_pod(self.cluster.as_ref(), job).await?;
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let pre_process = self
            .cluster
            .pod_logs(pod_name, Some("pre-process"))
            .await?;
        let main = self.cluster.pod_logs(pod_name, Some("main")).await?;

        let key = jobs::name(job).to_string();
        self.logs
            .put(&key, Bytes::from(compose_build_log(&pre_process, &main)))
            .await?;
        task.log_file = Some(key);
        task.finish(success);

        if definition.github_status {
            let state = if success {
                StatusState::Success
            } else {
                StatusState::Failure
            };
            self.report_status(repository, task, state).await;
        }
        Ok(())
    }

    async fn time_out(&self, job: &Job, definition: &JobDefinition, mut task: Task) -> Result<()> {
        gantry_cluster::teardown(self.cluster.as_ref(), job).await?;
        task.finish(false);
        self.repos.tasks.update(&mut task).await?;

        info!(
            job.name = %jobs::name(job),
            task.id = task.id,
            job.id = definition.id,
            timeout_secs = self.options.timeout.as_secs(),
            "task timed out"
        );
        if definition.github_status {
            match self.repos.repositories.get(definition.repository_id).await {
                Ok(repository) => {
                    self.report_status(&repository, &task, StatusState::Error)
                        .await
                }
                Err(e) => warn!(job.id = definition.id, error = %e, "failed to load repository"),
            }
        }
        self.dequeue(definition.id).await;
        Ok(())
    }

    /// Launch the next queued task of a definition, skipping tasks whose
    /// launch fails. Holds the trigger lock so a concurrent `build` of the
    /// same definition cannot start beside it.
    async fn dequeue(&self, job_id: i32) {
        let _guard = self.trigger_lock.lock().await;
        let definition = match self.repos.jobs.get(job_id).await {
            Ok(definition) => definition,
            Err(e) => {
                warn!(job.id = job_id, error = %e, "failed to load queued job");
                return;
            }
        };
        if definition.exclusive && self.is_running_job(&definition).await {
            debug!(job.id = job_id, "exclusive job still busy");
            return;
        }
        while let Some(task) = self.queue.pop(job_id) {
            let task_id = task.id;
            match self.launch_queued(&definition, task).await {
                Ok(_) => return,
                Err(e) => warn!(task.id = task_id, error = %e, "failed to launch queued task"),
            }
        }
    }

    async fn launch_queued(&self, definition: &JobDefinition, task: Task) -> Result<Task> {
        let repository = self.repos.repositories.get(definition.repository_id).await?;
        self.launch(definition, &repository, task).await
    }

    /// Re-queue tasks that were created but never started, then start the
    /// head of every queue whose definition is idle.
    pub async fn restore_queue(&self) -> Result<()> {
        let pending = self.repos.tasks.list_pending().await?;
        let count = pending.len();
        for task in pending {
            self.queue.push(task);
        }

        for job_id in self.queue.job_ids() {
            self.dequeue(job_id).await;
        }
        if count > 0 {
            info!(count, "restored pending tasks");
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for BazelBuilder {
    async fn build(
        &self,
        job: &JobDefinition,
        revision: &str,
        via: TriggerSource,
    ) -> Result<Task> {
        let _guard = self.trigger_lock.lock().await;

        if !revision.is_empty() {
            if let Some(existing) = self.repos.tasks.find_unfinished(job.id, revision, via).await? {
                info!(
                    task.id = existing.id,
                    job.id = job.id,
                    revision = %revision,
                    "build already in progress"
                );
                return Ok(existing);
            }
        }

        let repository = self.repos.repositories.get(job.repository_id).await?;
        let task = self
            .repos
            .tasks
            .create(&Task::new(job.id, revision, via, job.command, &job.target))
            .await?;

        if job.exclusive && self.is_running_job(job).await {
            info!(task.id = task.id, job.id = job.id, "exclusive job busy, task queued");
            self.queue.push(task.clone());
            return Ok(task);
        }
        self.launch(job, &repository, task).await
    }
}

#[async_trait]
impl JobHandler for BazelBuilder {
    fn name(&self) -> &'static str {
        "bazel-builder"
    }

    async fn sync_job(&self, job: &Job) -> Result<()> {
        self.sync(job).await
    }
}
