//! Task instance storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use enforcement_core::{Entity, TaskId};

use super::types::{DeadLetterEntry, ScheduledTask, TaskStatus};

/// Task store abstraction.
pub trait TaskStore: Send + Sync {
    /// Insert unless a live task with the same id exists. Returns `false` for a duplicate.
    fn insert_if_absent(&self, task: ScheduledTask) -> Result<bool, TaskStoreError>;

    fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, TaskStoreError>;

    fn update(&self, task: &ScheduledTask) -> Result<(), TaskStoreError>;

    /// Swap in a new instance under an existing id, returning the old one.
    fn replace(&self, task: ScheduledTask) -> Result<ScheduledTask, TaskStoreError>;

    fn remove(&self, id: TaskId) -> Result<bool, TaskStoreError>;

    /// Claim the earliest due task, marking it running.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTask>, TaskStoreError>;

    fn dead_letter(&self, task: ScheduledTask, reason: String) -> Result<(), TaskStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError>;

    /// Move a dead-lettered task back to the queue with a fresh attempt count.
    fn retry_dead_letter(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, TaskStoreError>;

    fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<PoisonError<T>> for TaskStoreError {
    fn from(_: PoisonError<T>) -> Self {
        TaskStoreError::Storage("task store lock poisoned".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl TaskStats {
    /// Tasks that will still run.
    pub fn live(&self) -> usize {
        self.pending + self.running + self.failed
    }
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, ScheduledTask>>,
    dead_letters: RwLock<HashMap<TaskId, DeadLetterEntry>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert_if_absent(&self, task: ScheduledTask) -> Result<bool, TaskStoreError> {
        let id = *task.id();
        let mut tasks = self.tasks.write()?;
        if tasks.contains_key(&id) {
            return Ok(false);
        }
        tasks.insert(id, task);
        Ok(true)
    }

    fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, TaskStoreError> {
        Ok(self.tasks.read()?.get(&id).cloned())
    }

    fn update(&self, task: &ScheduledTask) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write()?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(TaskStoreError::NotFound(task.id)),
        }
    }

    fn replace(&self, task: ScheduledTask) -> Result<ScheduledTask, TaskStoreError> {
        let mut tasks = self.tasks.write()?;
        match tasks.get_mut(&task.id) {
            Some(slot) => Ok(std::mem::replace(slot, task)),
            None => Err(TaskStoreError::NotFound(task.id)),
        }
    }

    fn remove(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        Ok(self.tasks.write()?.remove(&id).is_some())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTask>, TaskStoreError> {
        let mut tasks = self.tasks.write()?;

        let next = tasks
            .values()
            .filter(|t| t.is_due(now))
            .min_by_key(|t| (t.execute_at, t.created_at))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            tasks.get_mut(&id).map(|task| {
                task.mark_running(now);
                task.clone()
            })
        }))
    }

    fn dead_letter(&self, task: ScheduledTask, reason: String) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write()?;
        let mut dls = self.dead_letters.write()?;

        tasks.remove(&task.id);
        dls.insert(task.id, task.into_dead_letter(reason, Utc::now()));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError> {
        let dls = self.dead_letters.read()?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, TaskStoreError> {
        let mut tasks = self.tasks.write()?;
        let mut dls = self.dead_letters.write()?;

        if tasks.contains_key(&id) {
            return Err(TaskStoreError::AlreadyExists(id));
        }
        let entry = dls.remove(&id).ok_or(TaskStoreError::NotFound(id))?;

        let mut task = entry.task;
        task.requeue(now);

        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = self.tasks.read()?;
        let dls = self.dead_letters.read()?;

        let mut stats = TaskStats {
            dead_lettered: dls.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn insert_if_absent(&self, task: ScheduledTask) -> Result<bool, TaskStoreError> {
        (**self).insert_if_absent(task)
    }

    fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, TaskStoreError> {
        (**self).get(id)
    }

    fn update(&self, task: &ScheduledTask) -> Result<(), TaskStoreError> {
        (**self).update(task)
    }

    fn replace(&self, task: ScheduledTask) -> Result<ScheduledTask, TaskStoreError> {
        (**self).replace(task)
    }

    fn remove(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        (**self).remove(id)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ScheduledTask>, TaskStoreError> {
        (**self).claim_next(now)
    }

    fn dead_letter(&self, task: ScheduledTask, reason: String) -> Result<(), TaskStoreError> {
        (**self).dead_letter(task, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, TaskStoreError> {
        (**self).retry_dead_letter(id, now)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        (**self).stats()
    }
}
