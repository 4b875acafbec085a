//! Event router dispatching job changes to the subsystem owning the job.
//!
//! Handlers are registered per type key on a `RouterBuilder` before the watch
//! loop starts. The built `Router` is immutable; every handler registered for
//! a key is invoked, in registration order, for each change of a job whose
//! type label carries that key. Jobs of unknown types are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::Result;
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, warn};

use crate::jobs::{self, TYPE_LABEL};

/// Receives state changes of jobs carrying a given type label.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Reconcile against the observed job. Errors are logged by the router
    /// and the job is retried on its next change.
    async fn sync_job(&self, job: &Job) -> Result<()>;
}

#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<String, Vec<Arc<dyn JobHandler>>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers
            .entry(job_type.into())
            .or_default()
            .push(handler);
        self
    }

    pub fn build(self) -> Router {
        Router {
            handlers: self.handlers,
        }
    }
}

pub struct Router {
    handlers: HashMap<String, Vec<Arc<dyn JobHandler>>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn handler_count(&self, job_type: &str) -> usize {
        self.handlers.get(job_type).map_or(0, Vec::len)
    }

    /// Deliver a job change to every handler registered for its type.
    ///
    /// Returns the number of handlers that failed.
    pub async fn dispatch(&self, job: &Job) -> usize {
        let Some(job_type) = jobs::label(job, TYPE_LABEL) else {
            return 0;
        };
        let Some(handlers) = self.handlers.get(job_type) else {
            debug!(job.name = %jobs::name(job), job_type = %job_type, "no handler for job type");
            return 0;
        };

        let mut failures = 0;
        for handler in handlers {
            if let Err(e) = handler.sync_job(job).await {
                failures += 1;
                warn!(
                    handler = handler.name(),
                    job.name = %jobs::name(job),
                    error = %e,
                    "failed to sync job"
                );
            }
        }
        failures
    }
}
