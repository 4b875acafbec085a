//! Task persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{Command, Task, Tracked, TriggerSource};
use sqlx::PgPool;

use crate::tracked::update_tracked;
use crate::{DbError, DbResult};

/// Database row for tasks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i32,
    pub job_id: i32,
    pub revision: String,
    pub success: bool,
    pub log_file: Option<String>,
    pub via: String,
    pub command: String,
    pub target: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let via: TriggerSource = row.via.parse().map_err(DbError::InvalidData)?;
        let command: Command = row.command.parse().map_err(DbError::InvalidData)?;

        let mut task = Task::new(row.job_id, row.revision, via, command, row.target);
        task.id = row.id;
        task.success = row.success;
        task.log_file = row.log_file;
        task.started_at = row.started_at;
        task.finished_at = row.finished_at;
        task.created_at = row.created_at;
        task.updated_at = row.updated_at;
        task.reset_mark();
        Ok(task)
    }
}

fn rows_into_tasks(rows: Vec<TaskRow>) -> DbResult<Vec<Task>> {
    rows.into_iter().map(TryInto::try_into).collect()
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Insert a task, returning a marked copy carrying the new id.
    async fn create(&self, task: &Task) -> DbResult<Task>;

    async fn get(&self, id: i32) -> DbResult<Task>;

    /// Tasks of a job definition, most recent first.
    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>>;

    /// Tasks that were queued but never started nor finished, oldest first.
    async fn list_pending(&self) -> DbResult<Vec<Task>>;

    /// A non-terminal task for the same job, revision and trigger source.
    async fn find_unfinished(
        &self,
        job_id: i32,
        revision: &str,
        via: TriggerSource,
    ) -> DbResult<Option<Task>>;

    async fn update(&self, task: &mut Task) -> DbResult<()>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation of TaskRepo.
pub struct PgTaskRepo {
    pool: PgPool,
}

impl PgTaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepo for PgTaskRepo {
    async fn create(&self, task: &Task) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO task (
                job_id, revision, success, log_file, via, command, target,
                started_at, finished_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            RETURNING *
            "#,
        )
        .bind(task.job_id)
        .bind(&task.revision)
        .bind(task.success)
        .bind(&task.log_file)
        .bind(task.via.as_str())
        .bind(task.command.as_str())
        .bind(&task.target)
        .bind(task.started_at)
        .bind(task.finished_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get(&self, id: i32) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM task WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        row.try_into()
    }

    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>> {
        let rows =
            sqlx::query_as::<_, TaskRow>("SELECT * FROM task WHERE job_id = $1 ORDER BY id DESC")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        rows_into_tasks(rows)
    }

    async fn list_pending(&self) -> DbResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM task WHERE started_at IS NULL AND finished_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows_into_tasks(rows)
    }

    async fn find_unfinished(
        &self,
        job_id: i32,
        revision: &str,
        via: TriggerSource,
    ) -> DbResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM task
            WHERE job_id = $1 AND revision = $2 AND via = $3 AND finished_at IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(revision)
        .bind(via.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, task: &mut Task) -> DbResult<()> {
        update_tracked(&self.pool, task).await
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM task WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }
}
