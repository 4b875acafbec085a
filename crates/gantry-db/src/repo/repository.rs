//! Source repository persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{Repository, Tracked};
use sqlx::PgPool;

use crate::tracked::update_tracked;
use crate::{DbError, DbResult};

/// Database row for source repositories.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub clone_url: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        let mut repo = Repository::new(row.name, row.url, row.clone_url, row.private);
        repo.id = row.id;
        repo.created_at = row.created_at;
        repo.updated_at = row.updated_at;
        repo.reset_mark();
        repo
    }
}

#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    /// Insert a repository, returning a marked copy carrying the new id.
    async fn create(&self, repo: &Repository) -> DbResult<Repository>;

    async fn get(&self, id: i32) -> DbResult<Repository>;

    async fn list(&self) -> DbResult<Vec<Repository>>;

    /// Repositories whose canonical URL equals `url`.
    async fn list_by_url(&self, url: &str) -> DbResult<Vec<Repository>>;

    async fn update(&self, repo: &mut Repository) -> DbResult<()>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation of RepositoryRepo.
pub struct PgRepositoryRepo {
    pool: PgPool,
}

impl PgRepositoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryRepo for PgRepositoryRepo {
    async fn create(&self, repo: &Repository) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO source_repository (name, url, clone_url, private, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(&repo.name)
        .bind(&repo.url)
        .bind(&repo.clone_url)
        .bind(repo.private)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::on_insert(e, format!("repository {}", repo.url)))?;
        Ok(row.into())
    }

    async fn get(&self, id: i32) -> DbResult<Repository> {
        let row =
            sqlx::query_as::<_, RepositoryRow>("SELECT * FROM source_repository WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        Ok(row.into())
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM source_repository ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_by_url(&self, url: &str) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM source_repository WHERE url = $1 ORDER BY id",
        )
        .bind(url)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update(&self, repo: &mut Repository) -> DbResult<()> {
        update_tracked(&self.pool, repo).await
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM source_repository WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", id)));
        }
        Ok(())
    }
}
