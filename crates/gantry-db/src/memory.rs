//! In-memory store implementing every repository trait.
//!
//! Mirrors the PostgreSQL contract: creates return marked copies with fresh
//! ids, unchanged updates write nothing, and updates of missing rows fail
//! with `DbError::NotFound`. Every write bumps a counter tests can inspect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::{
    JobDefinition, PullRequestPermit, Repository, Task, Tracked, TriggerSource, TrustedUser,
};

use crate::readiness::SchemaCheck;
use crate::repo::{JobRepo, PermitRepo, Repos, RepositoryRepo, TaskRepo, TrustedUserRepo};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    next_id: i32,
    repositories: BTreeMap<i32, Repository>,
    jobs: BTreeMap<i32, JobDefinition>,
    tasks: BTreeMap<i32, Task>,
    trusted_users: BTreeMap<i32, TrustedUser>,
    permits: BTreeMap<i32, PullRequestPermit>,
}

impl State {
    fn allocate_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// All repository seams backed by this store.
    pub fn repos(&self) -> Repos {
        Repos {
            repositories: Arc::new(self.clone()),
            jobs: Arc::new(self.clone()),
            tasks: Arc::new(self.clone()),
            trusted_users: Arc::new(self.clone()),
            permits: Arc::new(self.clone()),
        }
    }

    /// Number of inserts, updates and deletes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| DbError::InvalidData("memory store lock poisoned".to_string()))
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn insert<T: Tracked>(
    db: &MemoryDb,
    table: impl FnOnce(&mut State) -> &mut BTreeMap<i32, T>,
    entity: &T,
    assign: impl FnOnce(&mut T, i32),
) -> DbResult<T> {
    let mut state = db.lock()?;
    let id = state.allocate_id();
    let mut created = entity.clone();
    assign(&mut created, id);
    created.reset_mark();
    table(&mut *state).insert(id, created.clone());
    db.wrote();
    Ok(created)
}

fn update<T: Tracked>(
    db: &MemoryDb,
    table: impl FnOnce(&mut State) -> &mut BTreeMap<i32, T>,
    entity: &mut T,
    touch: impl FnOnce(&mut T),
) -> DbResult<()> {
    if !entity.is_changed() {
        return Ok(());
    }
    let mut state = db.lock()?;
    let rows = table(&mut *state);
    let stored = rows
        .get_mut(&entity.id())
        .ok_or_else(|| DbError::NotFound(format!("{} {}", T::TABLE, entity.id())))?;
    touch(entity);
    entity.reset_mark();
    *stored = entity.clone();
    db.wrote();
    Ok(())
}

fn delete<T: Tracked>(
    db: &MemoryDb,
    table: impl FnOnce(&mut State) -> &mut BTreeMap<i32, T>,
    id: i32,
) -> DbResult<()> {
    let mut state = db.lock()?;
    table(&mut *state)
        .remove(&id)
        .ok_or_else(|| DbError::NotFound(format!("{} {}", T::TABLE, id)))?;
    db.wrote();
    Ok(())
}

fn get<T: Tracked>(
    db: &MemoryDb,
    table: impl FnOnce(&State) -> &BTreeMap<i32, T>,
    id: i32,
) -> DbResult<T> {
    let state = db.lock()?;
    table(&*state)
        .get(&id)
        .cloned()
        .ok_or_else(|| DbError::NotFound(format!("{} {}", T::TABLE, id)))
}

#[async_trait]
impl RepositoryRepo for MemoryDb {
    async fn create(&self, repo: &Repository) -> DbResult<Repository> {
        insert(self, |s| &mut s.repositories, repo, |r, id| {
            r.id = id;
            r.created_at = Utc::now();
        })
    }

    async fn get(&self, id: i32) -> DbResult<Repository> {
        get(self, |s| &s.repositories, id)
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        Ok(self.lock()?.repositories.values().cloned().collect())
    }

    async fn list_by_url(&self, url: &str) -> DbResult<Vec<Repository>> {
        Ok(self
            .lock()?
            .repositories
            .values()
            .filter(|r| r.url == url)
            .cloned()
            .collect())
    }

    async fn update(&self, repo: &mut Repository) -> DbResult<()> {
        update(self, |s| &mut s.repositories, repo, |r| {
            r.updated_at = Some(Utc::now())
        })
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        delete(self, |s| &mut s.repositories, id)
    }
}

#[async_trait]
impl JobRepo for MemoryDb {
    async fn create(&self, job: &JobDefinition) -> DbResult<JobDefinition> {
        {
            let state = self.lock()?;
            let duplicate = state.jobs.values().any(|j| {
                j.repository_id == job.repository_id
                    && j.command == job.command
                    && j.target == job.target
            });
            if duplicate {
                return Err(DbError::Duplicate(format!("job {}", job.reconcile_key())));
            }
        }
        insert(self, |s| &mut s.jobs, job, |j, id| {
            j.id = id;
            j.created_at = Utc::now();
        })
    }

    async fn get(&self, id: i32) -> DbResult<JobDefinition> {
        get(self, |s| &s.jobs, id)
    }

    async fn list(&self) -> DbResult<Vec<JobDefinition>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<JobDefinition>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| j.repository_id == repository_id)
            .cloned()
            .collect())
    }

    async fn update(&self, job: &mut JobDefinition) -> DbResult<()> {
        update(self, |s| &mut s.jobs, job, |j| j.updated_at = Some(Utc::now()))
    }
}

#[async_trait]
impl TaskRepo for MemoryDb {
    async fn create(&self, task: &Task) -> DbResult<Task> {
        insert(self, |s| &mut s.tasks, task, |t, id| {
            t.id = id;
            t.created_at = Utc::now();
        })
    }

    async fn get(&self, id: i32) -> DbResult<Task> {
        get(self, |s| &s.tasks, id)
    }

    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .rev()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_pending(&self) -> DbResult<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .filter(|t| t.started_at.is_none() && t.finished_at.is_none())
            .cloned()
            .collect())
    }

    async fn find_unfinished(
        &self,
        job_id: i32,
        revision: &str,
        via: TriggerSource,
    ) -> DbResult<Option<Task>> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .rev()
            .find(|t| {
                t.job_id == job_id && t.revision == revision && t.via == via && !t.is_finished()
            })
            .cloned())
    }

    async fn update(&self, task: &mut Task) -> DbResult<()> {
        update(self, |s| &mut s.tasks, task, |t| t.updated_at = Some(Utc::now()))
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        delete(self, |s| &mut s.tasks, id)
    }
}

#[async_trait]
impl TrustedUserRepo for MemoryDb {
    async fn create(&self, user: &TrustedUser) -> DbResult<TrustedUser> {
        if self.get_by_github_id(user.github_id).await?.is_some() {
            return Err(DbError::Duplicate(format!("trusted user {}", user.github_id)));
        }
        insert(self, |s| &mut s.trusted_users, user, |u, id| u.id = id)
    }

    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>> {
        Ok(self
            .lock()?
            .trusted_users
            .values()
            .find(|u| u.github_id == github_id)
            .cloned())
    }

    async fn list(&self) -> DbResult<Vec<TrustedUser>> {
        Ok(self.lock()?.trusted_users.values().cloned().collect())
    }

    async fn update(&self, user: &mut TrustedUser) -> DbResult<()> {
        update(self, |s| &mut s.trusted_users, user, |_| {})
    }
}

#[async_trait]
impl PermitRepo for MemoryDb {
    async fn create(&self, permit: &PullRequestPermit) -> DbResult<PullRequestPermit> {
        if self.find(&permit.repository, permit.number).await?.is_some() {
            return Err(DbError::Duplicate(format!(
                "permit {}#{}",
                permit.repository, permit.number
            )));
        }
        insert(self, |s| &mut s.permits, permit, |p, id| p.id = id)
    }

    async fn find(&self, repository: &str, number: i32) -> DbResult<Option<PullRequestPermit>> {
        Ok(self
            .lock()?
            .permits
            .values()
            .find(|p| p.repository == repository && p.number == number)
            .cloned())
    }

    async fn update(&self, permit: &mut PullRequestPermit) -> DbResult<()> {
        update(self, |s| &mut s.permits, permit, |_| {})
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        delete(self, |s| &mut s.permits, id)
    }
}

/// Schema check with a fixed answer.
pub struct StaticSchemaCheck(pub bool);

#[async_trait]
impl SchemaCheck for StaticSchemaCheck {
    async fn ready(&self) -> bool {
        self.0
    }
}
