//! Discovery engine: finds `job` targets in a repository and reconciles them
//! with the stored job definitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use gantry_cluster::jobs::{
    self, BAZEL_VERSION_LABEL, JobOutcome, REPO_NAME_LABEL, REPOSITORY_ID_LABEL, REVISION_LABEL,
    TYPE_LABEL,
};
use gantry_cluster::{Cluster, Job, JobHandler};
use gantry_core::githost::GitHost;
use gantry_core::{Error, JobDefinition, Repository, Result, TriggerSource};
use gantry_db::Repos;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::coordinator::{self, Builder, BuilderOptions};
use crate::query::{self, TargetDescriptor};
use crate::schedule;

/// Router type key of discovery jobs.
pub const JOB_TYPE: &str = "bazelDiscovery";

/// File pinning a repository's bazel version.
pub const BAZEL_VERSION_FILE: &str = ".bazelversion";

const DISCOVERY_SCRIPT: &str = r#"bazel cquery 'kind(job, //...)' --output jsonproto > /tmp/out.log 2> /tmp/err.log
status=$?
if [ $status -eq "0" ]; then
	cat /tmp/out.log
else
	cat /tmp/err.log
fi
exit $status"#;

/// Starts discovery of a repository's build targets.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Launch a discovery job. When `revision` is not empty, builds of the
    /// discovered targets are triggered at that revision once it completes.
    async fn find_out(&self, repository: &Repository, revision: &str) -> Result<()>;
}

/// Cluster job querying the build graph of `repository` with bazel
/// `bazel_version`.
pub fn discovery_job_template(
    options: &BuilderOptions,
    repository: &Repository,
    revision: &str,
    bazel_version: &str,
) -> Job {
    let labels = BTreeMap::from([
        (TYPE_LABEL.to_string(), JOB_TYPE.to_string()),
        (REPO_NAME_LABEL.to_string(), repository.name.clone()),
        (REPOSITORY_ID_LABEL.to_string(), repository.id.to_string()),
        (REVISION_LABEL.to_string(), revision.to_string()),
        (BAZEL_VERSION_LABEL.to_string(), bazel_version.to_string()),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-discovery", repository.name)),
            namespace: Some(options.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([(
                        REPO_NAME_LABEL.to_string(),
                        repository.name.clone(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![coordinator::clone_container(
                        options,
                        &repository.clone_url,
                        revision,
                    )]),
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some(format!("{}:{}", options.bazel_image, bazel_version)),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            DISCOVERY_SCRIPT.to_string(),
                        ]),
                        working_dir: Some("/work".to_string()),
                        volume_mounts: Some(vec![coordinator::work_mount()]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![coordinator::work_volume()]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Outcome of diffing discovered targets against stored definitions.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Every previously stored definition, reactivated or deactivated.
    pub updates: Vec<JobDefinition>,
    /// Definitions for targets seen for the first time.
    pub inserts: Vec<JobDefinition>,
}

/// Deactivate every stored definition, then reactivate and refresh those
/// still discovered. Unknown targets become new active definitions.
pub fn reconcile(
    mut current: Vec<JobDefinition>,
    descriptors: &[TargetDescriptor],
    repository_id: i32,
    bazel_version: Option<&str>,
) -> Reconciliation {
    for job in current.iter_mut() {
        job.active = false;
    }
    let index: HashMap<String, usize> = current
        .iter()
        .enumerate()
        .map(|(i, job)| (job.reconcile_key(), i))
        .collect();

    let mut inserts = Vec::new();
    for descriptor in descriptors {
        let job = match index.get(&descriptor.reconcile_key()) {
            Some(&i) => &mut current[i],
            None => {
                inserts.push(JobDefinition::new(
                    repository_id,
                    descriptor.command,
                    &descriptor.target,
                ));
                let last = inserts.len() - 1;
                &mut inserts[last]
            }
        };
        job.active = true;
        descriptor.apply(job);
        if let Some(version) = bazel_version {
            job.bazel_version = Some(version.to_string());
        }
    }

    Reconciliation {
        updates: current,
        inserts,
    }
}

pub struct Discovery {
    options: BuilderOptions,
    cluster: Arc<dyn Cluster>,
    repos: Repos,
    builder: Arc<dyn Builder>,
    github: Option<Arc<dyn GitHost>>,
}

impl Discovery {
    pub fn new(
        options: BuilderOptions,
        cluster: Arc<dyn Cluster>,
        repos: Repos,
        builder: Arc<dyn Builder>,
        github: Option<Arc<dyn GitHost>>,
    ) -> Self {
        Self {
            options,
            cluster,
            repos,
            builder,
            github,
        }
    }

    /// Version pinned by the repository's `.bazelversion` at `revision`, or
    /// the configured default when the file is missing or unreadable.
    async fn bazel_version(&self, repository: &Repository, revision: &str) -> String {
        let default = self.options.default_bazel_version.clone();
        let (Some(github), Some((owner, name))) =
            (&self.github, repository.github_owner_and_name())
        else {
            return default;
        };
        match github
            .file_content(&owner, &name, BAZEL_VERSION_FILE, revision)
            .await
        {
            Ok(Some(content)) => match content.trim() {
                "" => default,
                version => version.to_string(),
            },
            Ok(None) => default,
            Err(e) => {
                warn!(repository.id = repository.id, error = %e, "failed to read {}", BAZEL_VERSION_FILE);
                default
            }
        }
    }

    async fn sync_schedules(&self, repository_id: i32, active: &[JobDefinition]) {
        let repository = match self.repos.repositories.get(repository_id).await {
            Ok(repository) => repository,
            Err(e) => {
                warn!(repository.id = repository_id, error = %e, "failed to load repository");
                return;
            }
        };
        if let Err(e) =
            schedule::sync_schedules(self.cluster.as_ref(), &self.options, &repository, active).await
        {
            warn!(repository.id = repository_id, error = %e, "failed to sync schedules");
        }
    }

    pub async fn sync(&self, job: &Job) -> Result<()> {
        if jobs::is_deleted(job) {
            debug!(job.name = %jobs::name(job), "discovery job is being deleted");
            return Ok(());
        }
        let Some(raw) = jobs::label(job, REPOSITORY_ID_LABEL) else {
            return Ok(());
        };
        let repository_id: i32 = raw
            .parse()
            .map_err(|_| Error::MalformedInput(format!("repository id label: {}", raw)))?;

        match jobs::outcome(job) {
            JobOutcome::Pending | JobOutcome::Running => return Ok(()),
            JobOutcome::Failed => {
                warn!(job.name = %jobs::name(job), repository.id = repository_id, "discovery failed");
                return gantry_cluster::teardown(self.cluster.as_ref(), job).await;
            }
            JobOutcome::Complete => {}
        }

        let pod = gantry_cluster::single_pod(self.cluster.as_ref(), job).await?;
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let output = self.cluster.pod_logs(pod_name, Some("main")).await?;
        let descriptors = query::parse_query_output(&output)?;

        let current = self.repos.jobs.list_by_repository(repository_id).await?;
        let Reconciliation {
            mut updates,
            inserts,
        } = reconcile(
            current,
            &descriptors,
            repository_id,
            jobs::label(job, BAZEL_VERSION_LABEL).filter(|v| !v.is_empty()),
        );

        for definition in updates.iter_mut() {
            self.repos.jobs.update(definition).await?;
        }
        let mut active: Vec<JobDefinition> =
            updates.into_iter().filter(|j| j.active).collect();
        for definition in &inserts {
            active.push(self.repos.jobs.create(definition).await?);
        }
        info!(
            job.name = %jobs::name(job),
            repository.id = repository_id,
            discovered = descriptors.len(),
            created = inserts.len(),
            "discovery finished"
        );

        self.sync_schedules(repository_id, &active).await;
        gantry_cluster::teardown(self.cluster.as_ref(), job).await?;

        let revision = jobs::label(job, REVISION_LABEL).unwrap_or_default();
        if revision.is_empty() {
            return Ok(());
        }
        for definition in active.iter().filter(|j| j.is_triggered_by_events()) {
            if let Err(e) = self
                .builder
                .build(definition, revision, TriggerSource::Push)
                .await
            {
                warn!(job.id = definition.id, revision = %revision, error = %e, "failed to start build");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Discoverer for Discovery {
    async fn find_out(&self, repository: &Repository, revision: &str) -> Result<()> {
        let version = self.bazel_version(repository, revision).await;
        let job = discovery_job_template(&self.options, repository, revision, &version);
        self.cluster.create_job(&job).await?;
        info!(
            job.name = %jobs::name(&job),
            repository.id = repository.id,
            revision = %revision,
            bazel_version = %version,
            "discovery job created"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Discovery {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn sync_job(&self, job: &Job) -> Result<()> {
        self.sync(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, FakeGitHost, observed};
    use gantry_core::{Command, Task};
    use gantry_db::memory::MemoryDb;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBuilder {
        builds: Mutex<Vec<(String, String, TriggerSource)>>,
    }

    #[async_trait]
    impl Builder for RecordingBuilder {
        async fn build(
            &self,
            job: &JobDefinition,
            revision: &str,
            via: TriggerSource,
        ) -> Result<Task> {
            self.builds
                .lock()
                .unwrap()
                .push((job.reconcile_key(), revision.to_string(), via));
            Ok(Task::new(job.id, revision, via, job.command, &job.target))
        }
    }

    fn descriptor(command: Command, target: &str) -> TargetDescriptor {
        TargetDescriptor {
            name: format!("{}_job", target),
            package: target.split(':').next().unwrap().to_string(),
            target: target.to_string(),
            command,
            all_revision: false,
            github_status: true,
            cpu_limit: None,
            memory_limit: Some("2Gi".to_string()),
            exclusive: false,
            config_name: None,
            schedule: None,
        }
    }

    fn stored(id: i32, command: Command, target: &str) -> JobDefinition {
        let mut job = JobDefinition::new(1, command, target);
        job.id = id;
        job
    }

    #[test]
    fn test_reconcile_deactivates_missing_and_stages_new() {
        let current = vec![
            stored(1, Command::Test, "//a:test"),
            stored(2, Command::Build, "//gone:bin"),
        ];
        let descriptors = vec![
            descriptor(Command::Test, "//a:test"),
            descriptor(Command::Build, "//new:bin"),
        ];

        let result = reconcile(current, &descriptors, 1, Some("4.0.0"));

        assert_eq!(result.updates.len(), 2);
        let kept = &result.updates[0];
        assert!(kept.active);
        assert!(kept.github_status);
        assert_eq!(kept.memory_limit.as_deref(), Some("2Gi"));
        assert_eq!(kept.bazel_version.as_deref(), Some("4.0.0"));
        assert!(!result.updates[1].active);

        assert_eq!(result.inserts.len(), 1);
        assert_eq!(result.inserts[0].reconcile_key(), "build///new:bin");
        assert!(result.inserts[0].active);
        assert_eq!(result.inserts[0].repository_id, 1);
    }

    #[test]
    fn test_same_target_with_other_command_is_distinct() {
        let result = reconcile(
            vec![stored(1, Command::Build, "//a:a")],
            &[descriptor(Command::Test, "//a:a")],
            1,
            None,
        );
        assert!(!result.updates[0].active);
        assert_eq!(result.inserts.len(), 1);
    }

    #[test]
    fn test_discovery_job_template() {
        let mut repository = Repository::new("ops", "https://github.com/f110/ops", "https://github.com/f110/ops.git", false);
        repository.id = 5;
        let job = discovery_job_template(&BuilderOptions::default(), &repository, "abc", "6.4.0");

        assert_eq!(jobs::name(&job), "ops-discovery");
        assert_eq!(jobs::label(&job, BAZEL_VERSION_LABEL), Some("6.4.0"));
        assert_eq!(jobs::label(&job, TYPE_LABEL), Some(JOB_TYPE));
        assert_eq!(jobs::label(&job, REPOSITORY_ID_LABEL), Some("5"));
        assert_eq!(jobs::label(&job, REVISION_LABEL), Some("abc"));
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("l.gcr.io/google/bazel:6.4.0"));
        let script = &pod.containers[0].command.clone().unwrap()[2];
        assert!(script.contains("kind(job, //...)"));
        assert!(script.contains("--output jsonproto"));
    }

    const OUTPUT: &str = r#"{"results": [
        {"target": {"rule": {"name": "//a:test_job", "attribute": [
            {"name": "command", "stringValue": "test"},
            {"name": "target", "stringValue": "//a:test"}]}}, "configuration": {"checksum": "x"}},
        {"target": {"rule": {"name": "//a:test_job", "attribute": [
            {"name": "command", "stringValue": "test"},
            {"name": "target", "stringValue": "//a:test"}]}}, "configuration": {"checksum": "y"}},
        {"target": {"rule": {"name": "//a:run_job", "attribute": [
            {"name": "command", "stringValue": "run"},
            {"name": "target", "stringValue": "//a:deploy"}]}}, "configuration": {"checksum": "x"}}
    ]}"#;

    struct Fixture {
        db: MemoryDb,
        cluster: Arc<FakeCluster>,
        builder: Arc<RecordingBuilder>,
        github: Arc<FakeGitHost>,
        discovery: Discovery,
        repository: Repository,
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeGitHost::new()).await
    }

    async fn fixture_with(github: FakeGitHost) -> Fixture {
        let db = MemoryDb::new();
        let repos = db.repos();
        let repository = repos
            .repositories
            .create(&Repository::new("ops", "https://github.com/f110/ops", "https://github.com/f110/ops.git", false))
            .await
            .unwrap();
        let cluster = Arc::new(FakeCluster::new());
        let builder = Arc::new(RecordingBuilder::default());
        let github = Arc::new(github);
        let discovery = Discovery::new(
            BuilderOptions::default(),
            cluster.clone(),
            repos,
            builder.clone(),
            Some(github.clone()),
        );
        Fixture {
            db,
            cluster,
            builder,
            github,
            discovery,
            repository,
        }
    }

    async fn complete(f: &Fixture, revision: &str) {
        complete_with(f, revision, OUTPUT).await;
    }

    async fn complete_with(f: &Fixture, revision: &str, output: &str) {
        f.discovery.find_out(&f.repository, revision).await.unwrap();
        let job = observed(f.cluster.state().created[0].clone(), Some("Complete"), 30);
        f.cluster.add_pod("ops-discovery-pod");
        f.cluster.set_log("ops-discovery-pod", "main", output);
        f.discovery.sync(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_discovery_persists_and_triggers() {
        let f = fixture().await;
        let mut old = JobDefinition::new(f.repository.id, Command::Build, "//old:bin");
        old.active = true;
        let old = f.db.repos().jobs.create(&old).await.unwrap();

        complete(&f, "abc").await;

        let stored = f.db.repos().jobs.list_by_repository(f.repository.id).await.unwrap();
        assert_eq!(stored.len(), 3);
        let old = stored.iter().find(|j| j.id == old.id).unwrap();
        assert!(!old.active);
        assert!(stored.iter().filter(|j| j.id != old.id).all(|j| j.active));

        assert_eq!(f.cluster.state().deleted_jobs, vec!["ops-discovery".to_string()]);
        assert_eq!(
            *f.builder.builds.lock().unwrap(),
            vec![("test///a:test".to_string(), "abc".to_string(), TriggerSource::Push)]
        );
    }

    #[tokio::test]
    async fn test_discovery_without_revision_triggers_nothing() {
        let f = fixture().await;

        complete(&f, "").await;

        assert_eq!(
            f.db.repos().jobs.list_by_repository(f.repository.id).await.unwrap().len(),
            2
        );
        assert!(f.builder.builds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_discovery_only_tears_down() {
        let f = fixture().await;
        f.discovery.find_out(&f.repository, "abc").await.unwrap();
        let job = observed(f.cluster.state().created[0].clone(), Some("Failed"), 30);

        let writes = f.db.write_count();
        f.discovery.sync(&job).await.unwrap();

        assert_eq!(f.db.write_count(), writes);
        assert_eq!(f.cluster.state().deleted_jobs, vec!["ops-discovery".to_string()]);
        assert!(f.builder.builds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pinned_bazel_version_flows_into_definitions() {
        let github = FakeGitHost::new();
        github.set_file(BAZEL_VERSION_FILE, "abc", "5.1.1\n");
        let f = fixture_with(github).await;

        complete(&f, "abc").await;

        let created = f.cluster.state().created[0].clone();
        assert_eq!(jobs::label(&created, BAZEL_VERSION_LABEL), Some("5.1.1"));
        let stored = f.db.repos().jobs.list_by_repository(f.repository.id).await.unwrap();
        assert!(stored.iter().all(|j| j.bazel_version.as_deref() == Some("5.1.1")));
        assert_eq!(
            f.github.lookups(),
            vec![(BAZEL_VERSION_FILE.to_string(), "abc".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unreadable_version_file_uses_default() {
        let f = fixture_with(FakeGitHost {
            fail_files: true,
            ..Default::default()
        })
        .await;

        f.discovery.find_out(&f.repository, "").await.unwrap();

        let created = f.cluster.state().created[0].clone();
        assert_eq!(
            jobs::label(&created, BAZEL_VERSION_LABEL),
            Some(BuilderOptions::default().default_bazel_version.as_str())
        );
    }

    #[tokio::test]
    async fn test_discovery_syncs_schedules() {
        let f = fixture().await;
        let output = r#"{"results": [
            {"target": {"rule": {"name": "//a:nightly_job", "attribute": [
                {"name": "command", "stringValue": "run"},
                {"name": "target", "stringValue": "//a:report"},
                {"name": "schedule", "stringValue": "0 3 * * *"}]}}, "configuration": {"checksum": "x"}},
            {"target": {"rule": {"name": "//a:test_job", "attribute": [
                {"name": "command", "stringValue": "test"},
                {"name": "target", "stringValue": "//a:test"}]}}, "configuration": {"checksum": "x"}}
        ]}"#;

        complete_with(&f, "", output).await;

        let stored = f.db.repos().jobs.list_by_repository(f.repository.id).await.unwrap();
        let nightly = stored.iter().find(|j| j.target == "//a:report").unwrap();
        let cron_jobs = f.cluster.state().cron_jobs.clone();
        assert_eq!(cron_jobs.len(), 1);
        assert_eq!(
            cron_jobs[0].metadata.name.clone().unwrap(),
            format!("ops-{}", nightly.id)
        );
        assert_eq!(cron_jobs[0].spec.as_ref().unwrap().schedule, "0 3 * * *");
    }
}
