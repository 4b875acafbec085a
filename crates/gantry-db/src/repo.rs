//! Repository traits and implementations.

pub mod job;
pub mod repository;
pub mod task;
pub mod trust;

use std::sync::Arc;

use sqlx::PgPool;

pub use job::{JobRepo, PgJobRepo};
pub use repository::{PgRepositoryRepo, RepositoryRepo};
pub use task::{PgTaskRepo, TaskRepo};
pub use trust::{PermitRepo, PgPermitRepo, PgTrustedUserRepo, TrustedUserRepo};

/// Every persistence seam, shared by the scheduler and the API.
#[derive(Clone)]
pub struct Repos {
    pub repositories: Arc<dyn RepositoryRepo>,
    pub jobs: Arc<dyn JobRepo>,
    pub tasks: Arc<dyn TaskRepo>,
    pub trusted_users: Arc<dyn TrustedUserRepo>,
    pub permits: Arc<dyn PermitRepo>,
}

impl Repos {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            repositories: Arc::new(PgRepositoryRepo::new(pool.clone())),
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            tasks: Arc::new(PgTaskRepo::new(pool.clone())),
            trusted_users: Arc::new(PgTrustedUserRepo::new(pool.clone())),
            permits: Arc::new(PgPermitRepo::new(pool)),
        }
    }
}
