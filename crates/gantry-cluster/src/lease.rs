//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! The holder renews the lease periodically. Another candidate takes it over
//! once `renewTime + leaseDurationSeconds` has passed. Updates carry the
//! observed resourceVersion, so two candidates racing for the same lease
//! cannot both win.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_core::{Error, Result};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        namespace: &str,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Campaign for the lease until `shutdown` fires.
    ///
    /// While leading, `lead` runs with a child token that is cancelled as
    /// soon as the lease cannot be renewed or shutdown is requested.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, lead: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.lease_name, identity = %self.identity, "acquired leadership");
                    self.lead(&shutdown, &lead).await;
                    info!(lease = %self.lease_name, identity = %self.identity, "lost leadership");
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, lease = %self.lease_name, "failed to acquire lease"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    async fn lead<F, Fut>(&self, shutdown: &CancellationToken, lead: &F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = shutdown.child_token();
        let mut work = tokio::spawn(lead(token.clone()));
        let mut last_renewed = Utc::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = &mut work => {
                    token.cancel();
                    return;
                }
                _ = tokio::time::sleep(self.renew_interval) => {
                    match self.try_acquire_or_renew().await {
                        Ok(true) => last_renewed = Utc::now(),
                        Ok(false) => break,
                        Err(e) => {
                            warn!(error = %e, "failed to renew lease");
                            if expired(Some(last_renewed), self.lease_duration, Utc::now()) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        token.cancel();
        if let Err(e) = work.await {
            warn!(error = %e, "leader task panicked");
        }
    }

    /// Take or renew the lease. `Ok(false)` when another holder owns it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = self
            .api
            .get_opt(&self.lease_name)
            .await
            .map_err(|e| Error::Cluster(e.to_string()))?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(self.spec_for(now, 0)),
            };
            return self.write(self.api.create(&PostParams::default(), &lease).await);
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.as_deref();
        if holder == Some(self.identity.as_str()) {
            let mut renewed = spec;
            renewed.renew_time = Some(MicroTime(now));
            lease.spec = Some(renewed);
        } else {
            let duration = spec
                .lease_duration_seconds
                .map(|s| Duration::from_secs(s.max(0) as u64))
                .unwrap_or(self.lease_duration);
            if holder.is_some() && !expired(spec.renew_time.map(|t| t.0), duration, now) {
                return Ok(false);
            }
            lease.spec = Some(self.spec_for(now, spec.lease_transitions.unwrap_or(0) + 1));
        }

        self.write(
            self.api
                .replace(&self.lease_name, &PostParams::default(), &lease)
                .await,
        )
    }

    fn spec_for(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    fn write(&self, result: std::result::Result<Lease, kube::Error>) -> Result<bool> {
        match result {
            Ok(_) => Ok(true),
            // Lost a race with another candidate.
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
            Err(e) => Err(Error::Cluster(e.to_string())),
        }
    }
}

fn expired(renewed: Option<DateTime<Utc>>, duration: Duration, now: DateTime<Utc>) -> bool {
    match renewed {
        Some(t) => {
            let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
            t + duration < now
        }
        None => true,
    }
}
