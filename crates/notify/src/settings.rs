//! Pipeline tuning values.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskDescriptor, TaskDescriptors, TaskKind};

/// What the send task does after a permanent provider rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentFailureAction {
    /// Drop the task; the record already carries its final status.
    #[default]
    Remove,
    /// Hand over to a verify task with no provider id so it is accounted for downstream.
    Verify,
}

impl PermanentFailureAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remove" => Some(Self::Remove),
            "verify" => Some(Self::Verify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySettings {
    pub send_max_retries: u32,
    pub send_backoff: Duration,
    pub verify_max_retries: u32,
    pub verify_backoff: Duration,
    /// Wait before the first send attempt.
    pub processing_delay: Duration,
    /// Wait between a successful send and the first verification.
    pub verify_delay: Duration,
    pub on_permanent_failure: PermanentFailureAction,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            send_max_retries: 5,
            send_backoff: Duration::from_secs(300),
            verify_max_retries: 5,
            verify_backoff: Duration::from_secs(3600),
            processing_delay: Duration::from_secs(2),
            verify_delay: Duration::from_secs(60),
            on_permanent_failure: PermanentFailureAction::Remove,
        }
    }
}

impl NotifySettings {
    pub fn descriptors(&self) -> TaskDescriptors {
        TaskDescriptors {
            send: TaskDescriptor {
                kind: TaskKind::SendEmail,
                max_retries: self.send_max_retries,
                backoff: self.send_backoff,
            },
            verify: TaskDescriptor {
                kind: TaskKind::VerifyEmail,
                max_retries: self.verify_max_retries,
                backoff: self.verify_backoff,
            },
        }
    }
}

/// `at` moved forward by `delay`, pinned to the latest representable instant
/// when the sum does not fit.
pub fn delayed(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
