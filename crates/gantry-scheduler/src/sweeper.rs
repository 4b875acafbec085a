//! Periodic resync of live jobs, so timeouts fire without watch events.

use std::sync::Arc;
use std::time::Duration;

use gantry_cluster::jobs::{self, TYPE_LABEL};
use chrono::Utc;
use gantry_cluster::{Cluster, JobHandler};
use gantry_core::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TimeoutSweeper {
    cluster: Arc<dyn Cluster>,
    handler: Arc<dyn JobHandler>,
    job_type: &'static str,
    interval: Duration,
    timeout: Duration,
}

impl TimeoutSweeper {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        handler: Arc<dyn JobHandler>,
        job_type: &'static str,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            handler,
            job_type,
            interval,
            timeout,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("timeout sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
    }

    /// Resync the jobs of the sweeper's type that have outlived the timeout.
    /// Younger jobs are left to the watcher. Returns the number resynced.
    pub async fn sweep(&self) -> Result<usize> {
        let selector = format!("{}={}", TYPE_LABEL, self.job_type);
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| gantry_core::Error::Internal(e.to_string()))?;
        let now = Utc::now();
        let overdue: Vec<_> = self
            .cluster
            .list_jobs(&selector)
            .await?
            .into_iter()
            .filter(|job| jobs::created_at(job).is_some_and(|created| now - created > timeout))
            .collect();
        for job in &overdue {
            if let Err(e) = self.handler.sync_job(job).await {
                warn!(job.name = %jobs::name(job), error = %e, "failed to resync job");
            }
        }
        Ok(overdue.len())
    }
}
