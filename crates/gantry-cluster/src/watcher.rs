//! Watch loop feeding the event router.

use std::sync::Arc;

use futures::{StreamExt, pin_mut};
use gantry_core::{Error, Result};
use k8s_openapi::api::batch::v1::Job;
use kube::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{self, TYPE_LABEL};
use crate::router::Router;

/// Watches typed jobs in one namespace and dispatches each change serially.
pub struct JobWatcher {
    api: Api<Job>,
    router: Arc<Router>,
}

impl JobWatcher {
    pub fn new(api: Api<Job>, router: Arc<Router>) -> Self {
        Self { api, router }
    }

    /// Run until `cancel` fires or the stream ends.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = watcher::Config::default().labels(TYPE_LABEL);
        let stream = watcher::watcher(self.api, config).default_backoff();
        pin_mut!(stream);

        info!("job watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("job watcher stopped");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => handle_event(&self.router, event).await,
                    Some(Err(e)) => warn!(error = %e, "job watch stream error"),
                    None => return Err(Error::Cluster("job watch stream ended".to_string())),
                },
            }
        }
    }
}

/// Dispatch one watch event. Deletions are delivered marked as deleted.
pub async fn handle_event(router: &Router, event: Event<Job>) {
    match event {
        Event::Apply(job) | Event::InitApply(job) => {
            router.dispatch(&job).await;
        }
        Event::Delete(mut job) => {
            debug!(job.name = %jobs::name(&job), "job deleted");
            jobs::mark_deleted(&mut job);
            router.dispatch(&job).await;
        }
        Event::Init | Event::InitDone => {}
    }
}
