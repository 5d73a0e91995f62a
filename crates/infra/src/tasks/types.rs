//! Scheduled task instances and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enforcement_core::{Entity, TaskId};
use enforcement_notify::{EmailTaskState, TaskDescriptor, TaskKind, delayed};

/// Task execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `execute_at`
    Pending,
    /// Claimed by a worker
    Running,
    /// Failed, will be retried at `execute_at`
    Failed { error: String, attempt: u32 },
    /// Given up on; kept for inspection only
    DeadLettered { error: String, attempts: u32 },
}

impl TaskStatus {
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy for one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total runs allowed, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(6, Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Exponential backoff with delays capped at one day.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(24 * 60 * 60).max(base_delay),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// `max_retries` retries on top of the first run.
    pub fn from_descriptor(descriptor: &TaskDescriptor) -> Self {
        Self::exponential(descriptor.max_retries.saturating_add(1), descriptor.backoff)
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let spread = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One run of a task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// A task instance as the engine stores it. The payload is kept encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Runs started so far.
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execute_at: DateTime<Utc>,
    pub history: Vec<TaskAttemptRecord>,
}

impl ScheduledTask {
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        payload: &EmailTaskState,
        execute_at: DateTime<Utc>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id,
            kind,
            payload: serde_json::to_value(payload)?,
            status: TaskStatus::Pending,
            attempt: 0,
            retry_policy,
            created_at: now,
            updated_at: now,
            execute_at,
            history: Vec::new(),
        })
    }

    pub fn state(&self) -> Result<EmailTaskState, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.execute_at <= now
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
    }

    /// Record a failed run and schedule the next one, or dead-letter when the
    /// policy is exhausted or the failure is final.
    pub fn mark_failed(
        &mut self,
        error: String,
        retryable: bool,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.updated_at = now;
        self.history.push(TaskAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            error: Some(error.clone()),
        });

        if retryable && self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.execute_at = delayed(now, delay);
            self.status = TaskStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = TaskStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Turn this instance into the next stage. The id is kept, the attempt
    /// count and history start over.
    pub fn replace_with(
        &mut self,
        kind: TaskKind,
        payload: serde_json::Value,
        execute_at: DateTime<Utc>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) {
        self.kind = kind;
        self.payload = payload;
        self.execute_at = execute_at;
        self.retry_policy = retry_policy;
        self.status = TaskStatus::Pending;
        self.attempt = 0;
        self.history.clear();
        self.updated_at = now;
    }

    /// Wrap this instance as a dead letter, keeping an existing dead-letter status.
    pub fn into_dead_letter(mut self, reason: String, now: DateTime<Utc>) -> DeadLetterEntry {
        if !matches!(self.status, TaskStatus::DeadLettered { .. }) {
            self.status = TaskStatus::DeadLettered {
                error: reason.clone(),
                attempts: self.attempt,
            };
        }
        self.updated_at = now;
        DeadLetterEntry {
            task: self,
            dead_lettered_at: now,
            reason,
        }
    }

    /// Put a dead-lettered instance back in the queue with a fresh attempt count.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempt = 0;
        self.execute_at = now;
        self.updated_at = now;
        self.history.clear();
    }
}

impl Entity for ScheduledTask {
    type Id = TaskId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: ScheduledTask,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}
