//! Task payloads, completion directives and the engine capability.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use enforcement_core::{NotificationId, TaskId};

use crate::classify::ErrorCategory;
use crate::provider::ProviderNotificationId;

/// The two stages a logical notification passes through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "send-email-task")]
    SendEmail,
    #[serde(rename = "verify-email-task")]
    VerifyEmail,
}

impl TaskKind {
    /// Name used in the engine's dispatch table.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::SendEmail => "send-email-task",
            TaskKind::VerifyEmail => "verify-email-task",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "send-email-task" => Some(TaskKind::SendEmail),
            "verify-email-task" => Some(TaskKind::VerifyEmail),
            _ => None,
        }
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload carried by both send and verify tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTaskState {
    pub task_id: TaskId,
    pub record_id: NotificationId,
    pub template_id: String,
    pub recipient_address: String,
    #[serde(default)]
    pub personalisation: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_notification_id: Option<ProviderNotificationId>,
}

impl EmailTaskState {
    /// Copy of this payload for the verify stage.
    pub fn with_provider_id(&self, id: Option<ProviderNotificationId>) -> Self {
        Self {
            provider_notification_id: id,
            ..self.clone()
        }
    }
}

/// Why a task body gave up on this invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category} task failure: {message}")]
pub struct TaskFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn retryable(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable: false,
        }
    }
}

/// What the engine should do with a task instance once its body returns.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    Remove,
    ReplaceWith {
        kind: TaskKind,
        payload: EmailTaskState,
        execute_at: DateTime<Utc>,
    },
    Fail(TaskFailure),
}

/// Retry parameters for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub max_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptors {
    pub send: TaskDescriptor,
    pub verify: TaskDescriptor,
}

impl TaskDescriptors {
    pub fn for_kind(&self, kind: TaskKind) -> &TaskDescriptor {
        match kind {
            TaskKind::SendEmail => &self.send,
            TaskKind::VerifyEmail => &self.verify,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task engine unavailable: {0}")]
    Unavailable(String),

    #[error("payload could not be encoded: {0}")]
    Payload(String),
}

/// Durable scheduler the orchestrator hands work to.
pub trait TaskEngine: Send + Sync {
    /// Enqueue a task unless one with the same id already exists.
    ///
    /// Returns `false` for a duplicate id.
    fn enqueue_if_absent(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;

    /// Swap an existing task instance for a new kind and payload, keeping its id.
    fn schedule_replacement(
        &self,
        task_id: TaskId,
        kind: TaskKind,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;
}

/// Runs a task body for the engine.
pub trait TaskRunner: Send + Sync {
    fn run(&self, kind: TaskKind, payload: &EmailTaskState) -> NextAction;
}
