//! CronJobs that start scheduled builds by posting to `/run` with `via=cron`.

use std::collections::{BTreeMap, HashMap};

use gantry_cluster::jobs::{
    BAZEL_VERSION_LABEL, JOB_ID_LABEL, REPO_NAME_LABEL, REPOSITORY_ID_LABEL, TYPE_LABEL,
};
use gantry_cluster::{Cluster, CronJob};
use gantry_core::{JobDefinition, Repository, Result, TriggerSource};
use k8s_openapi::api::batch::v1::{CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::coordinator::BuilderOptions;

/// Type label value of schedule cron jobs.
pub const CRON_TYPE: &str = "bazelSchedule";

/// What a schedule sync changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleChanges {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub fn cron_job_name(repository: &Repository, job: &JobDefinition) -> String {
    format!("{}-{}", repository.name, job.id)
}

/// Arguments of the trigger container.
pub fn trigger_args(options: &BuilderOptions, job: &JobDefinition) -> Vec<String> {
    vec![
        "--fail".to_string(),
        "--silent".to_string(),
        "--show-error".to_string(),
        "-X".to_string(),
        "POST".to_string(),
        "--data-urlencode".to_string(),
        format!("job_id={}", job.id),
        "--data-urlencode".to_string(),
        format!("via={}", TriggerSource::Cron),
        format!("{}/run", options.api_url.trim_end_matches('/')),
    ]
}

pub fn cron_job_template(
    options: &BuilderOptions,
    repository: &Repository,
    job: &JobDefinition,
    schedule: &str,
) -> CronJob {
    let labels = BTreeMap::from([
        (TYPE_LABEL.to_string(), CRON_TYPE.to_string()),
        (REPO_NAME_LABEL.to_string(), repository.name.clone()),
        (REPOSITORY_ID_LABEL.to_string(), repository.id.to_string()),
        (JOB_ID_LABEL.to_string(), job.id.to_string()),
        (
            BAZEL_VERSION_LABEL.to_string(),
            job.bazel_version
                .clone()
                .unwrap_or_else(|| options.default_bazel_version.clone()),
        ),
    ]);
    // Jobs spawned by the cron job must not look like build jobs to the watcher.
    let job_labels = BTreeMap::from([(REPO_NAME_LABEL.to_string(), repository.name.clone())]);

    CronJob {
        metadata: ObjectMeta {
            name: Some(cron_job_name(repository, job)),
            namespace: Some(options.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(1),
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".to_string()),
                            containers: vec![Container {
                                name: "trigger".to_string(),
                                image: Some(options.trigger_image.clone()),
                                image_pull_policy: Some("IfNotPresent".to_string()),
                                args: Some(trigger_args(options, job)),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn schedule_of(job: &JobDefinition) -> Option<&str> {
    job.schedule.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Make the repository's cron jobs match `definitions`: one per active
/// definition with a schedule, none for anything else.
pub async fn sync_schedules(
    cluster: &dyn Cluster,
    options: &BuilderOptions,
    repository: &Repository,
    definitions: &[JobDefinition],
) -> Result<ScheduleChanges> {
    let selector = format!(
        "{}={},{}={}",
        TYPE_LABEL, CRON_TYPE, REPOSITORY_ID_LABEL, repository.id
    );
    let mut existing: HashMap<String, CronJob> = cluster
        .list_cron_jobs(&selector)
        .await?
        .into_iter()
        .filter_map(|c| c.metadata.name.clone().map(|name| (name, c)))
        .collect();

    let mut changes = ScheduleChanges::default();
    for job in definitions.iter().filter(|j| j.active) {
        let Some(schedule) = schedule_of(job) else {
            continue;
        };
        let name = cron_job_name(repository, job);
        match existing.remove(&name) {
            None => {
                cluster
                    .create_cron_job(&cron_job_template(options, repository, job, schedule))
                    .await?;
                debug!(cron_job.name = %name, schedule, "cron job created");
                changes.created += 1;
            }
            Some(mut current) => {
                let Some(spec) = current.spec.as_mut() else {
                    continue;
                };
                if spec.schedule == schedule {
                    continue;
                }
                spec.schedule = schedule.to_string();
                cluster.replace_cron_job(&current).await?;
                debug!(cron_job.name = %name, schedule, "cron job updated");
                changes.updated += 1;
            }
        }
    }

    for name in existing.keys() {
        cluster.delete_cron_job(name).await?;
        debug!(cron_job.name = %name, "cron job deleted");
        changes.deleted += 1;
    }

    if changes != ScheduleChanges::default() {
        info!(
            repository.id = repository.id,
            created = changes.created,
            updated = changes.updated,
            deleted = changes.deleted,
            "schedules synced"
        );
    }
    Ok(changes)
}
