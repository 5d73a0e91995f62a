//! Deterministic fakes for the provider and engine capabilities.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use enforcement_core::TaskId;

use crate::provider::{
    EmailProvider, ProviderError, ProviderNotification, ProviderNotificationId, SendEmailResponse,
};
use crate::task::{EmailTaskState, EngineError, TaskEngine, TaskKind};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider that replays queued outcomes.
///
/// With nothing queued, sends succeed with ids `P1`, `P2`, ... and status
/// lookups for unknown ids return 404.
#[derive(Debug, Default)]
pub struct ScriptedEmailProvider {
    sends: Mutex<VecDeque<Result<SendEmailResponse, ProviderError>>>,
    statuses: Mutex<HashMap<String, Result<String, ProviderError>>>,
    references: Mutex<Vec<String>>,
    status_calls: AtomicUsize,
    generated: AtomicUsize,
}

impl ScriptedEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_send(&self, outcome: Result<SendEmailResponse, ProviderError>) {
        lock(&self.sends).push_back(outcome);
    }

    pub fn push_send_ok(&self, provider_id: &str) {
        let id = ProviderNotificationId::new(provider_id).ok();
        self.push_send(Ok(SendEmailResponse {
            notification_id: id,
        }));
    }

    pub fn push_send_err(&self, status_code: u16, message: &str) {
        self.push_send(Err(ProviderError::new(status_code, message)));
    }

    pub fn set_status(&self, provider_id: &str, outcome: Result<String, ProviderError>) {
        lock(&self.statuses).insert(provider_id.to_string(), outcome);
    }

    /// References passed to `send_email`, in call order.
    pub fn sent_references(&self) -> Vec<String> {
        lock(&self.references).clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl EmailProvider for ScriptedEmailProvider {
    fn send_email(
        &self,
        _template_id: &str,
        _email_address: &str,
        _personalisation: &BTreeMap<String, serde_json::Value>,
        reference: &str,
    ) -> Result<SendEmailResponse, ProviderError> {
        lock(&self.references).push(reference.to_string());
        if let Some(outcome) = lock(&self.sends).pop_front() {
            return outcome;
        }
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendEmailResponse {
            notification_id: ProviderNotificationId::new(format!("P{n}")).ok(),
        })
    }

    fn get_status(
        &self,
        notification_id: &ProviderNotificationId,
    ) -> Result<ProviderNotification, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.statuses).get(notification_id.as_str()) {
            Some(Ok(status)) => Ok(ProviderNotification {
                id: notification_id.clone(),
                status: status.clone(),
            }),
            Some(Err(e)) => Err(e.clone()),
            None => Err(ProviderError::new(404, "notification not found")),
        }
    }
}

pub type EnqueuedTask = (TaskKind, TaskId, EmailTaskState, DateTime<Utc>);

/// Engine that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingTaskEngine {
    enqueued: Mutex<Vec<EnqueuedTask>>,
    replaced: Mutex<Vec<EnqueuedTask>>,
    seen: Mutex<HashSet<TaskId>>,
    fail_next: AtomicBool,
    duplicates: AtomicBool,
}

impl RecordingTaskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> Vec<EnqueuedTask> {
        lock(&self.enqueued).clone()
    }

    pub fn replaced(&self) -> Vec<EnqueuedTask> {
        lock(&self.replaced).clone()
    }

    pub fn fail_next_enqueue(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make every enqueue look like a duplicate.
    pub fn report_duplicates(&self) {
        self.duplicates.store(true, Ordering::SeqCst);
    }
}

impl TaskEngine for RecordingTaskEngine {
    fn enqueue_if_absent(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Unavailable("scripted failure".into()));
        }
        if self.duplicates.load(Ordering::SeqCst) || !lock(&self.seen).insert(task_id) {
            return Ok(false);
        }
        lock(&self.enqueued).push((kind, task_id, payload.clone(), execute_at));
        Ok(true)
    }

    fn schedule_replacement(
        &self,
        task_id: TaskId,
        kind: TaskKind,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !lock(&self.seen).contains(&task_id) {
            return Err(EngineError::NotFound(task_id));
        }
        lock(&self.replaced).push((kind, task_id, payload.clone(), execute_at));
        Ok(())
    }
}
