//! Cluster plumbing for gantry.
//!
//! Provides:
//! - The `Cluster` seam over Kubernetes jobs, pods and cron jobs, and its kube implementation
//! - Job label conventions and status helpers
//! - The event router dispatching job changes by type label, and the watch loop feeding it
//! - Lease-based leader election

pub mod jobs;
pub mod kubernetes;
pub mod lease;
pub mod router;
pub mod watcher;

use async_trait::async_trait;
use gantry_core::{Error, Result};

pub use k8s_openapi::api::batch::v1::{CronJob, Job};
pub use k8s_openapi::api::core::v1::Pod;
pub use kubernetes::KubeCluster;
pub use lease::LeaderElector;
pub use router::{JobHandler, Router, RouterBuilder};
pub use watcher::JobWatcher;

/// Operations on the namespace gantry schedules its jobs in.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Delete a job. Deleting a missing job is not an error.
    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Delete a pod. Deleting a missing pod is not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Logs of a pod's container; the pod's default container when `None`.
    async fn pod_logs(&self, pod: &str, container: Option<&str>) -> Result<String>;

    async fn list_cron_jobs(&self, label_selector: &str) -> Result<Vec<CronJob>>;

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob>;

    /// Overwrite an existing cron job. The object must carry the resource
    /// version it was read with.
    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob>;

    /// Delete a cron job. Deleting a missing cron job is not an error.
    async fn delete_cron_job(&self, name: &str) -> Result<()>;
}

/// The single pod backing a job. Zero or several matches is an error.
pub async fn single_pod(cluster: &dyn Cluster, job: &Job) -> Result<Pod> {
    let mut pods = cluster.list_pods(&jobs::pod_selector(job)).await?;
    if pods.len() != 1 {
        return Err(Error::Internal(format!(
            "expected exactly one pod for job {}, found {}",
            jobs::name(job),
            pods.len()
        )));
    }
    pods.pop()
        .ok_or_else(|| Error::Internal(format!("no pod for job {}", jobs::name(job))))
}

/// Delete a job and every pod it created.
pub async fn teardown(cluster: &dyn Cluster, job: &Job) -> Result<()> {
    cluster.delete_job(jobs::name(job)).await?;

    let selector = jobs::pod_selector(job);
    if selector.is_empty() {
        return Ok(());
    }
    for pod in cluster.list_pods(&selector).await? {
        if let Some(name) = pod.metadata.name.as_deref() {
            cluster.delete_pod(name).await?;
        }
    }
    Ok(())
}
