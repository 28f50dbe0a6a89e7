//! Item registry: the single owner of task records and status transitions
//!
//! The registry is plain synchronous state. It is owned by the queue's control
//! loop, which is what serializes access to it; nothing here does I/O or spawns.

use crate::queue::retry::{RetryDecision, RetryPolicy};
use crate::queue::task::{Metadata, ResultMetadata, Task, TaskId, TaskStatus};
use std::collections::HashMap;
use tracing::warn;

/// Task set keyed by id, remembering insertion order for FIFO admission
#[derive(Debug)]
pub struct Registry {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    max_concurrent: usize,
    retry: RetryPolicy,
    completion_announced: bool,
}

impl Registry {
    pub fn new(max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            max_concurrent,
            retry,
            completion_announced: false,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Register a new task at the back of the admission order
    pub fn insert(&mut self, task: Task) -> TaskId {
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        self.completion_announced = false;
        id
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Snapshot of every task in insertion order
    pub fn list(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }

    /// Remove every completed task, returning how many were dropped
    pub fn clear_completed(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| t.status != TaskStatus::Completed);
        let tasks = &self.tasks;
        self.order.retain(|id| tasks.contains_key(id));
        before - self.tasks.len()
    }

    /// Earliest-inserted pending task, if the concurrency ceiling leaves room for it
    pub fn next_admission(&self) -> Option<TaskId> {
        if self.active_count() >= self.max_concurrent {
            return None;
        }
        self.order
            .iter()
            .find(|id| {
                self.tasks
                    .get(*id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .copied()
    }

    /// Pending -> Downloading
    pub fn mark_downloading(&mut self, id: &TaskId) -> bool {
        if self.active_count() >= self.max_concurrent {
            return false;
        }
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Downloading;
                true
            }
            _ => false,
        }
    }

    /// Record worker progress for a downloading task
    pub fn record_progress(&mut self, id: &TaskId, percent: u8) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Downloading => {
                task.progress = percent.min(100);
                true
            }
            _ => false,
        }
    }

    /// Downloading -> Completed, returning the merged metadata
    pub fn complete(&mut self, id: &TaskId, result: &ResultMetadata) -> Option<Metadata> {
        let task = self.tasks.get_mut(id)?;
        if task.status != TaskStatus::Downloading {
            return None;
        }
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.merge_result(result);
        Some(task.metadata.clone())
    }

    /// Downloading -> Pending or Failed depending on the retry policy
    pub fn fail(&mut self, id: &TaskId, error: &str) -> Option<RetryDecision> {
        let max_retries = self.retry.max_retries;
        let task = self.tasks.get_mut(id)?;
        if task.status != TaskStatus::Downloading {
            return None;
        }

        // Saturate so the count never exceeds the limit, even with a limit of zero
        task.retry_count = (task.retry_count + 1).min(max_retries);
        task.last_error = Some(error.to_string());

        let decision = self.retry.decide(task.retry_count);
        match decision {
            RetryDecision::Requeue => {
                task.progress = 0;
                task.status = TaskStatus::Pending;
            }
            RetryDecision::GiveUp => {
                task.status = TaskStatus::Failed;
            }
        }
        Some(decision)
    }

    /// Downloading -> Paused. Only call once the worker has stopped.
    pub fn pause(&mut self, id: &TaskId) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Downloading => {
                task.status = TaskStatus::Paused;
                true
            }
            _ => false,
        }
    }

    /// Paused -> Pending
    pub fn resume(&mut self, id: &TaskId) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Paused => {
                task.status = TaskStatus::Pending;
                self.completion_announced = false;
                true
            }
            _ => false,
        }
    }

    /// Ids of every paused task, in admission order
    pub fn paused_ids(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.status(id) == Some(TaskStatus::Paused))
            .copied()
            .collect()
    }

    /// Any non-terminal status -> Canceled, returning the status it left
    pub fn cancel(&mut self, id: &TaskId) -> Option<TaskStatus> {
        let task = self.tasks.get_mut(id)?;
        if task.status.is_terminal() {
            return None;
        }
        let previous = task.status;
        task.status = TaskStatus::Canceled;
        Some(previous)
    }

    /// Tasks eligible for persistence: everything that is not downloading
    pub fn persistable(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status != TaskStatus::Downloading)
            .cloned()
            .collect()
    }

    /// Merge loaded tasks by id. Returns how many were merged.
    ///
    /// Entries colliding with a task that is currently downloading are skipped,
    /// and a stored `Downloading` status comes back as `Paused`.
    pub fn merge(&mut self, tasks: Vec<Task>) -> usize {
        let mut merged = 0;
        for mut task in tasks {
            if self.status(&task.id) == Some(TaskStatus::Downloading) {
                warn!("Skipping loaded task {}: it is currently downloading", task.id);
                continue;
            }
            if task.status == TaskStatus::Downloading {
                task.status = TaskStatus::Paused;
            }
            task.progress = task.progress.min(100);
            task.retry_count = task.retry_count.min(self.retry.max_retries);
            self.insert(task);
            merged += 1;
        }
        merged
    }

    /// True exactly once per episode in which every task has reached a terminal state
    pub fn take_queue_completed(&mut self) -> bool {
        let all_terminal = self.tasks.values().all(|t| t.status.is_terminal());
        if self.tasks.is_empty() || !all_terminal {
            self.completion_announced = false;
            return false;
        }
        if self.completion_announced {
            return false;
        }
        self.completion_announced = true;
        true
    }
}
