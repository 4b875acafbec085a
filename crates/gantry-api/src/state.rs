//! Application state.

use std::sync::Arc;

use gantry_core::githost::GitHost;
use gantry_db::{Repos, SchemaCheck};
use gantry_scheduler::{Builder, Discoverer, DiscoveryViewer};

use crate::admission::Admission;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub repos: Repos,
    pub builder: Arc<dyn Builder>,
    pub discoverer: Arc<dyn Discoverer>,
    pub github: Option<Arc<dyn GitHost>>,
    pub viewer: Arc<DiscoveryViewer>,
    pub admission: Arc<Admission>,
    pub schema: Arc<dyn SchemaCheck>,
    /// Secret webhook payloads are signed with. Signatures are not checked when unset.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        repos: Repos,
        builder: Arc<dyn Builder>,
        discoverer: Arc<dyn Discoverer>,
        github: Option<Arc<dyn GitHost>>,
        viewer: Arc<DiscoveryViewer>,
        schema: Arc<dyn SchemaCheck>,
    ) -> Self {
        let admission = Arc::new(Admission::new(
            repos.clone(),
            builder.clone(),
            discoverer.clone(),
            github.clone(),
        ));
        Self {
            repos,
            builder,
            discoverer,
            github,
            viewer,
            admission,
            schema,
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }
}
