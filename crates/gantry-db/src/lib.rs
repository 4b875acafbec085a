//! Database layer for gantry.
//!
//! Provides repository traits, PostgreSQL implementations backed by change
//! tracked partial updates, a schema readiness check, and an in-memory store
//! honoring the same contract.

pub mod error;
pub mod memory;
pub mod readiness;
pub mod repo;
pub mod tracked;

pub use error::{DbError, DbResult};
pub use readiness::{PgSchemaCheck, SchemaCheck};
pub use repo::*;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

/// Migrations embedded at build time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}
