//! `enforcement-notify`: email notification delivery pipeline.
//!
//! A logical notification is one [`NotificationRecord`] plus the task instance
//! that drives it: a send task, which on success is replaced (same task id) by
//! a verify task. Provider and task engine are capabilities supplied by the
//! caller; nothing here performs I/O on its own.

pub mod classify;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod record;
pub mod send;
pub mod settings;
pub mod status;
pub mod store;
pub mod task;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use classify::{ErrorCategory, classify};
pub use error::NotifyError;
pub use model::{EmailNotificationRequest, EmailNotificationResponse};
pub use orchestrator::NotificationOrchestrator;
pub use pipeline::NotificationTasks;
pub use provider::{
    EmailProvider, ProviderError, ProviderNotification, ProviderNotificationId, SendEmailResponse,
};
pub use record::{NotificationRecord, NotificationType, TransitionError};
pub use send::SendEmailTask;
pub use settings::{NotifySettings, PermanentFailureAction, delayed};
pub use status::NotificationStatus;
pub use store::{InMemoryNotificationStore, NotificationStore, StoreError};
pub use task::{
    EmailTaskState, EngineError, NextAction, TaskDescriptor, TaskDescriptors, TaskEngine,
    TaskFailure, TaskKind, TaskRunner,
};
pub use verify::VerifyEmailTask;
