//! Trusted users and pull request permits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{PullRequestPermit, Tracked, TrustedUser};
use sqlx::PgPool;

use crate::tracked::update_tracked;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrustedUserRow {
    pub id: i32,
    pub github_id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl From<TrustedUserRow> for TrustedUser {
    fn from(row: TrustedUserRow) -> Self {
        let mut user = TrustedUser::new(row.github_id, row.username);
        user.id = row.id;
        user.created_at = row.created_at;
        user.reset_mark();
        user
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PermitRow {
    pub id: i32,
    pub repository: String,
    pub number: i32,
    pub created_at: DateTime<Utc>,
}

impl From<PermitRow> for PullRequestPermit {
    fn from(row: PermitRow) -> Self {
        let mut permit = PullRequestPermit::new(row.repository, row.number);
        permit.id = row.id;
        permit.created_at = row.created_at;
        permit.reset_mark();
        permit
    }
}

#[async_trait]
pub trait TrustedUserRepo: Send + Sync {
    async fn create(&self, user: &TrustedUser) -> DbResult<TrustedUser>;

    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>>;

    async fn list(&self) -> DbResult<Vec<TrustedUser>>;

    async fn update(&self, user: &mut TrustedUser) -> DbResult<()>;
}

#[async_trait]
pub trait PermitRepo: Send + Sync {
    async fn create(&self, permit: &PullRequestPermit) -> DbResult<PullRequestPermit>;

    /// Permit for a pull request, if one was granted.
    async fn find(&self, repository: &str, number: i32) -> DbResult<Option<PullRequestPermit>>;

    async fn update(&self, permit: &mut PullRequestPermit) -> DbResult<()>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation of TrustedUserRepo.
pub struct PgTrustedUserRepo {
    pool: PgPool,
}

impl PgTrustedUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustedUserRepo for PgTrustedUserRepo {
    async fn create(&self, user: &TrustedUser) -> DbResult<TrustedUser> {
        let row = sqlx::query_as::<_, TrustedUserRow>(
            r#"
            INSERT INTO trusted_user (github_id, username, created_at)
            VALUES ($1, $2, NOW())
            RETURNING *
            "#,
        )
        .bind(user.github_id)
        .bind(&user.username)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::on_insert(e, format!("trusted user {}", user.github_id)))?;
        Ok(row.into())
    }

    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>> {
        let row = sqlx::query_as::<_, TrustedUserRow>(
            "SELECT * FROM trusted_user WHERE github_id = $1",
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self) -> DbResult<Vec<TrustedUser>> {
        let rows = sqlx::query_as::<_, TrustedUserRow>("SELECT * FROM trusted_user ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update(&self, user: &mut TrustedUser) -> DbResult<()> {
        update_tracked(&self.pool, user).await
    }
}

/// PostgreSQL implementation of PermitRepo.
pub struct PgPermitRepo {
    pool: PgPool,
}

impl PgPermitRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermitRepo for PgPermitRepo {
    async fn create(&self, permit: &PullRequestPermit) -> DbResult<PullRequestPermit> {
        let row = sqlx::query_as::<_, PermitRow>(
            r#"
            INSERT INTO permit_pull_request (repository, number, created_at)
            VALUES ($1, $2, NOW())
            RETURNING *
            "#,
        )
        .bind(&permit.repository)
        .bind(permit.number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DbError::on_insert(e, format!("permit {}#{}", permit.repository, permit.number))
        })?;
        Ok(row.into())
    }

    async fn find(&self, repository: &str, number: i32) -> DbResult<Option<PullRequestPermit>> {
        let row = sqlx::query_as::<_, PermitRow>(
            "SELECT * FROM permit_pull_request WHERE repository = $1 AND number = $2",
        )
        .bind(repository)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update(&self, permit: &mut PullRequestPermit) -> DbResult<()> {
        update_tracked(&self.pool, permit).await
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM permit_pull_request WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("permit {}", id)));
        }
        Ok(())
    }
}
