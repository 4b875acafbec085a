//! Read model of repositories with a discovery job in flight.

use std::collections::BTreeSet;
use std::sync::RwLock;

use async_trait::async_trait;
use gantry_cluster::jobs::{self, REPOSITORY_ID_LABEL};
use gantry_cluster::{Job, JobHandler};
use gantry_core::Result;

#[derive(Default)]
pub struct DiscoveryViewer {
    running: RwLock<BTreeSet<i32>>,
}

impl DiscoveryViewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> Vec<i32> {
        self.running
            .read()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    fn observe(&self, job: &Job) {
        let Some(id) = jobs::label(job, REPOSITORY_ID_LABEL).and_then(|v| v.parse().ok()) else {
            return;
        };
        let Ok(mut running) = self.running.write() else {
            return;
        };
        if jobs::is_deleted(job) || jobs::is_completed(job) {
            running.remove(&id);
        } else {
            running.insert(id);
        }
    }
}

#[async_trait]
impl JobHandler for DiscoveryViewer {
    fn name(&self) -> &'static str {
        "discovery-viewer"
    }

    async fn sync_job(&self, job: &Job) -> Result<()> {
        self.observe(job);
        Ok(())
    }
}
