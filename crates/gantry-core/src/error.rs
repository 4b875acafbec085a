//! Error types for gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A referenced entity is absent, or an update matched zero rows.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cluster api error: {0}")]
    Cluster(String),

    /// Git hosting API or object store failure.
    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
