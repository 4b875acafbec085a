//! Job definition persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{Command, JobDefinition, Tracked};
use sqlx::PgPool;

use crate::tracked::update_tracked;
use crate::{DbError, DbResult};

/// Database row for job definitions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i32,
    pub repository_id: i32,
    pub command: String,
    pub target: String,
    pub active: bool,
    pub all_revision: bool,
    pub github_status: bool,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub exclusive: bool,
    pub config_name: Option<String>,
    pub bazel_version: Option<String>,
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobDefinition {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let command: Command = row.command.parse().map_err(DbError::InvalidData)?;

        let mut job = JobDefinition::new(row.repository_id, command, row.target);
        job.id = row.id;
        job.active = row.active;
        job.all_revision = row.all_revision;
        job.github_status = row.github_status;
        job.cpu_limit = row.cpu_limit;
        job.memory_limit = row.memory_limit;
        job.exclusive = row.exclusive;
        job.config_name = row.config_name;
        job.bazel_version = row.bazel_version;
        job.schedule = row.schedule;
        job.created_at = row.created_at;
        job.updated_at = row.updated_at;
        job.reset_mark();
        Ok(job)
    }
}

fn rows_into_jobs(rows: Vec<JobRow>) -> DbResult<Vec<JobDefinition>> {
    rows.into_iter().map(TryInto::try_into).collect()
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a job definition, returning a marked copy carrying the new id.
    async fn create(&self, job: &JobDefinition) -> DbResult<JobDefinition>;

    async fn get(&self, id: i32) -> DbResult<JobDefinition>;

    async fn list(&self) -> DbResult<Vec<JobDefinition>>;

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<JobDefinition>>;

    async fn update(&self, job: &mut JobDefinition) -> DbResult<()>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: &JobDefinition) -> DbResult<JobDefinition> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO job (
                repository_id, command, target, active, all_revision, github_status,
                cpu_limit, memory_limit, exclusive, config_name, bazel_version, schedule,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            RETURNING *
            "#,
        )
        .bind(job.repository_id)
        .bind(job.command.as_str())
        .bind(&job.target)
        .bind(job.active)
        .bind(job.all_revision)
        .bind(job.github_status)
        .bind(&job.cpu_limit)
        .bind(&job.memory_limit)
        .bind(job.exclusive)
        .bind(&job.config_name)
        .bind(&job.bazel_version)
        .bind(&job.schedule)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::on_insert(e, format!("job {}", job.reconcile_key())))?;
        row.try_into()
    }

    async fn get(&self, id: i32) -> DbResult<JobDefinition> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn list(&self) -> DbResult<Vec<JobDefinition>> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM job ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows_into_jobs(rows)
    }

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<JobDefinition>> {
        let rows =
            sqlx::query_as::<_, JobRow>("SELECT * FROM job WHERE repository_id = $1 ORDER BY id")
                .bind(repository_id)
                .fetch_all(&self.pool)
                .await?;
        rows_into_jobs(rows)
    }

    async fn update(&self, job: &mut JobDefinition) -> DbResult<()> {
        update_tracked(&self.pool, job).await
    }
}
