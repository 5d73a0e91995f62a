//! [`TaskEngine`] backed by a [`TaskStore`].

use chrono::{DateTime, Utc};
use tracing::debug;

use enforcement_core::TaskId;
use enforcement_notify::{EmailTaskState, EngineError, TaskDescriptors, TaskEngine, TaskKind};

use super::store::{TaskStore, TaskStoreError};
use super::types::{RetryPolicy, ScheduledTask};

pub struct InProcessTaskEngine<S: TaskStore> {
    store: S,
    descriptors: TaskDescriptors,
}

impl<S: TaskStore> InProcessTaskEngine<S> {
    pub fn new(store: S, descriptors: TaskDescriptors) -> Self {
        Self { store, descriptors }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn policy_for(&self, kind: TaskKind) -> RetryPolicy {
        RetryPolicy::from_descriptor(self.descriptors.for_kind(kind))
    }
}

impl From<TaskStoreError> for EngineError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Unavailable(other.to_string()),
        }
    }
}

fn payload_error(e: serde_json::Error) -> EngineError {
    EngineError::Payload(e.to_string())
}

impl<S: TaskStore> TaskEngine for InProcessTaskEngine<S> {
    fn enqueue_if_absent(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let task = ScheduledTask::new(
            task_id,
            kind,
            payload,
            execute_at,
            self.policy_for(kind),
            Utc::now(),
        )
        .map_err(payload_error)?;

        let inserted = self.store.insert_if_absent(task)?;
        debug!(task_id = %task_id, kind = %kind, inserted, "enqueue");
        Ok(inserted)
    }

    fn schedule_replacement(
        &self,
        task_id: TaskId,
        kind: TaskKind,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut task = self
            .store
            .get(task_id)?
            .ok_or(EngineError::NotFound(task_id))?;
        let encoded = serde_json::to_value(payload).map_err(payload_error)?;

        task.replace_with(kind, encoded, execute_at, self.policy_for(kind), Utc::now());
        self.store.replace(task)?;
        debug!(task_id = %task_id, kind = %kind, %execute_at, "task replaced");
        Ok(())
    }
}
