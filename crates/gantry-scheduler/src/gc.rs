//! Garbage collector keeping the newest tasks of every job definition.

use std::sync::Arc;
use std::time::Duration;

use gantry_core::Result;
use gantry_core::artifact::LogStore;
use gantry_db::Repos;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct GarbageCollector {
    repos: Repos,
    logs: Arc<dyn LogStore>,
    retain: usize,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(repos: Repos, logs: Arc<dyn LogStore>, retain: usize, interval: Duration) -> Self {
        Self {
            repos,
            logs,
            retain,
            interval,
        }
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "garbage collection failed");
                    }
                }
            }
        }
    }

    /// Delete finished tasks outside the retained window, and their logs.
    /// Unfinished tasks are skipped and collected on a later sweep.
    pub async fn sweep(&self) -> Result<usize> {
        let mut deleted = 0;
        for job in self.repos.jobs.list().await? {
            let tasks = match self.repos.tasks.list_by_job(job.id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(job.id = job.id, error = %e, "failed to list tasks");
                    continue;
                }
            };

            for task in tasks.iter().skip(self.retain).filter(|t| t.is_finished()) {
                if let Some(key) = &task.log_file {
                    if let Err(e) = self.logs.delete(key).await {
                        warn!(task.id = task.id, log = %key, error = %e, "failed to delete log");
                        continue;
                    }
                }
                match self.repos.tasks.delete(task.id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(task.id = task.id, error = %e, "failed to delete task"),
                }
            }
        }
        if deleted > 0 {
            info!(deleted, "garbage collected tasks");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use gantry_core::artifact::MemoryLogStore;
    use gantry_core::{Command, Error, JobDefinition, Repository, Task, TriggerSource};
    use gantry_db::memory::MemoryDb;
    use gantry_db::{DbError, DbResult, TaskRepo};

    /// Log store refusing to delete one key.
    struct RefusingLogs {
        inner: MemoryLogStore,
        refused: String,
    }

    #[async_trait]
    impl LogStore for RefusingLogs {
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            self.inner.put(key, data).await
        }

        async fn get(&self, key: &str) -> Result<Bytes> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            if key == self.refused {
                return Err(Error::ExternalService(format!("cannot delete {}", key)));
            }
            self.inner.delete(key).await
        }
    }

    /// Task store refusing to delete one row.
    struct RefusingTasks {
        inner: MemoryDb,
        refused: i32,
    }

    #[async_trait]
    impl TaskRepo for RefusingTasks {
        async fn create(&self, task: &Task) -> DbResult<Task> {
            self.inner.repos().tasks.create(task).await
        }

        async fn get(&self, id: i32) -> DbResult<Task> {
            self.inner.repos().tasks.get(id).await
        }

        async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>> {
            self.inner.repos().tasks.list_by_job(job_id).await
        }

        async fn list_pending(&self) -> DbResult<Vec<Task>> {
            self.inner.repos().tasks.list_pending().await
        }

        async fn find_unfinished(
            &self,
            job_id: i32,
            revision: &str,
            via: TriggerSource,
        ) -> DbResult<Option<Task>> {
            self.inner
                .repos()
                .tasks
                .find_unfinished(job_id, revision, via)
                .await
        }

        async fn update(&self, task: &mut Task) -> DbResult<()> {
            self.inner.repos().tasks.update(task).await
        }

        async fn delete(&self, id: i32) -> DbResult<()> {
            if id == self.refused {
                return Err(DbError::InvalidData(format!("cannot delete task {}", id)));
            }
            self.inner.repos().tasks.delete(id).await
        }
    }

    async fn remaining(db: &MemoryDb, job_id: i32) -> Vec<i32> {
        db.repos()
            .tasks
            .list_by_job(job_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect()
    }

    async fn seed(db: &MemoryDb, logs: &MemoryLogStore, finished: &[bool]) -> Vec<Task> {
        let repos = db.repos();
        let repository = repos
            .repositories
            .create(&Repository::new("ops", "https://github.com/f110/ops", "https://github.com/f110/ops.git", false))
            .await
            .unwrap();
        let job = repos
            .jobs
            .create(&JobDefinition::new(repository.id, Command::Build, "//a:b"))
            .await
            .unwrap();

        let mut created = Vec::new();
        for (i, done) in finished.iter().enumerate() {
            let mut task = repos
                .tasks
                .create(&Task::new(job.id, format!("rev{}", i), TriggerSource::Push, Command::Build, "//a:b"))
                .await
                .unwrap();
            if *done {
                let key = format!("ops-{}", task.id);
                logs.put(&key, Bytes::from("log")).await.unwrap();
                task.log_file = Some(key);
                task.finish(true);
                repos.tasks.update(&mut task).await.unwrap();
            }
            created.push(task);
        }
        created
    }

    #[tokio::test]
    async fn test_keeps_newest_finished_tasks() {
        let db = MemoryDb::new();
        let logs = Arc::new(MemoryLogStore::new());
        // Oldest first: the oldest task is still running.
        let tasks = seed(&db, &logs, &[false, true, true, true, true]).await;
        let gc = GarbageCollector::new(db.repos(), logs.clone(), 2, Duration::from_secs(60));

        let deleted = gc.sweep().await.unwrap();

        assert_eq!(deleted, 2);
        let remaining: Vec<i32> = db
            .repos()
            .tasks
            .list_by_job(tasks[0].job_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(remaining, vec![tasks[4].id, tasks[3].id, tasks[0].id]);
        assert_eq!(logs.keys().len(), 2);

        // Nothing left to collect until the running task finishes.
        assert_eq!(gc.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_log_delete_keeps_task_and_continues() {
        let db = MemoryDb::new();
        let memory = MemoryLogStore::new();
        let tasks = seed(&db, &memory, &[true, true, true, true]).await;
        let logs = Arc::new(RefusingLogs {
            inner: memory.clone(),
            refused: tasks[0].log_file.clone().unwrap(),
        });
        let gc = GarbageCollector::new(db.repos(), logs, 1, Duration::from_secs(60));

        let deleted = gc.sweep().await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(remaining(&db, tasks[0].job_id).await, vec![tasks[3].id, tasks[0].id]);
        let mut keys = memory.keys();
        keys.sort();
        let mut expected = vec![
            tasks[0].log_file.clone().unwrap(),
            tasks[3].log_file.clone().unwrap(),
        ];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_failed_record_delete_continues() {
        let db = MemoryDb::new();
        let logs = Arc::new(MemoryLogStore::new());
        let tasks = seed(&db, &logs, &[true, true, true, true]).await;
        let mut repos = db.repos();
        repos.tasks = Arc::new(RefusingTasks {
            inner: db.clone(),
            refused: tasks[1].id,
        });
        let gc = GarbageCollector::new(repos, logs, 1, Duration::from_secs(60));

        let deleted = gc.sweep().await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(remaining(&db, tasks[0].job_id).await, vec![tasks[3].id, tasks[1].id]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let db = MemoryDb::new();
        let gc = GarbageCollector::new(
            db.repos(),
            Arc::new(MemoryLogStore::new()),
            10,
            Duration::from_secs(3600),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        gc.run(cancel).await;
    }
}
