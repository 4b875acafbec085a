//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// Row does not exist, or an update matched zero rows.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    /// Map an insert failure, turning unique violations into `Duplicate`.
    pub(crate) fn on_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => DbError::Duplicate(what.into()),
            _ => DbError::Database(err),
        }
    }
}

impl From<DbError> for gantry_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => gantry_core::Error::NotFound(what),
            DbError::InvalidData(msg) => gantry_core::Error::Internal(msg),
            other => gantry_core::Error::Persistence(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
