//! Schema readiness check.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::DbResult;
use crate::MIGRATOR;

/// Answers whether the database schema matches the one this binary embeds.
#[async_trait]
pub trait SchemaCheck: Send + Sync {
    async fn ready(&self) -> bool;
}

/// Hex checksum of the newest embedded migration.
pub fn expected_schema_hash() -> Option<String> {
    MIGRATOR
        .iter()
        .filter(|m| m.migration_type.is_up_migration())
        .max_by_key(|m| m.version)
        .map(|m| hex::encode(&m.checksum))
}

/// Compares the newest applied migration with the embedded one.
pub struct PgSchemaCheck {
    pool: PgPool,
}

impl PgSchemaCheck {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn applied_schema_hash(&self) -> DbResult<Option<String>> {
        let checksum: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT checksum FROM _sqlx_migrations WHERE success ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(checksum.map(hex::encode))
    }
}

#[async_trait]
impl SchemaCheck for PgSchemaCheck {
    async fn ready(&self) -> bool {
        match self.applied_schema_hash().await {
            Ok(Some(applied)) => Some(applied) == expected_schema_hash(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read schema version");
                false
            }
        }
    }
}
