//! The set of background loops a leader runs.

use std::sync::Arc;

use gantry_cluster::{Job, JobWatcher, Router};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coordinator::BazelBuilder;
use crate::gc::GarbageCollector;
use crate::sweeper::TimeoutSweeper;

/// Runs the job watcher, garbage collector and timeout sweeper together.
#[derive(Clone)]
pub struct Controller {
    jobs: Api<Job>,
    router: Arc<Router>,
    builder: Arc<BazelBuilder>,
    gc: Arc<GarbageCollector>,
    sweeper: Arc<TimeoutSweeper>,
}

impl Controller {
    pub fn new(
        jobs: Api<Job>,
        router: Arc<Router>,
        builder: Arc<BazelBuilder>,
        gc: Arc<GarbageCollector>,
        sweeper: Arc<TimeoutSweeper>,
    ) -> Self {
        Self {
            jobs,
            router,
            builder,
            gc,
            sweeper,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("controller started");
        if let Err(e) = self.builder.restore_queue().await {
            warn!(error = %e, "failed to restore pending tasks");
        }

        let watcher = JobWatcher::new(self.jobs.clone(), self.router.clone());
        let watch = async {
            if let Err(e) = watcher.run(cancel.clone()).await {
                error!(error = %e, "job watcher exited");
                cancel.cancel();
            }
        };
        tokio::join!(
            watch,
            self.gc.run(cancel.clone()),
            self.sweeper.run(cancel.clone()),
        );
        info!("controller stopped");
    }
}
