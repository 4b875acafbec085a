//! Kubernetes implementation of the `Cluster` seam.

use async_trait::async_trait;
use gantry_core::{Error, Result};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::Cluster;

/// Namespaced job, pod and cron job operations through the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cron_jobs(&self) -> Api<CronJob> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn cluster_error(e: kube::Error) -> Error {
    Error::Cluster(e.to_string())
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        self.jobs()
            .create(&PostParams::default(), job)
            .await
            .map_err(cluster_error)
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        match self.jobs().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(job.name = %name, "job already deleted");
                Ok(())
            }
            Err(e) => Err(cluster_error(e)),
        }
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<Job>> {
        let list = self
            .jobs()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(cluster_error)?;
        Ok(list.items)
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(cluster_error)?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(cluster_error(e)),
        }
    }

    async fn pod_logs(&self, pod: &str, container: Option<&str>) -> Result<String> {
        let params = LogParams {
            container: container.map(str::to_string),
            ..Default::default()
        };
        self.pods().logs(pod, &params).await.map_err(cluster_error)
    }

    async fn list_cron_jobs(&self, label_selector: &str) -> Result<Vec<CronJob>> {
        let list = self
            .cron_jobs()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(cluster_error)?;
        Ok(list.items)
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob> {
        self.cron_jobs()
            .create(&PostParams::default(), cron_job)
            .await
            .map_err(cluster_error)
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob> {
        let name = cron_job.metadata.name.as_deref().unwrap_or_default();
        self.cron_jobs()
            .replace(name, &PostParams::default(), cron_job)
            .await
            .map_err(cluster_error)
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        match self.cron_jobs().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(cluster_error(e)),
        }
    }
}
