//! In-process queue of tasks waiting for an exclusive job definition to free up.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use gantry_core::Task;

/// FIFO queues of unstarted tasks, one per job definition.
#[derive(Default)]
pub struct TaskQueue {
    queues: Mutex<HashMap<i32, VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task unless a task with the same id is already queued.
    pub fn push(&self, task: Task) -> bool {
        let Ok(mut queues) = self.queues.lock() else {
            return false;
        };
        let queue = queues.entry(task.job_id).or_default();
        if queue.iter().any(|t| t.id == task.id) {
            return false;
        }
        queue.push_back(task);
        true
    }

    /// Next task for a job definition.
    pub fn pop(&self, job_id: i32) -> Option<Task> {
        let mut queues = self.queues.lock().ok()?;
        let queue = queues.get_mut(&job_id)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&job_id);
        }
        task
    }

    pub fn len(&self, job_id: i32) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(&job_id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Job definitions with at least one queued task.
    pub fn job_ids(&self) -> Vec<i32> {
        self.queues
            .lock()
            .map(|q| q.keys().copied().collect())
            .unwrap_or_default()
    }
}
