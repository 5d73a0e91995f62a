//! In-process durable-task engine with retry, backoff and dead-letter handling.
//!
//! - `ScheduledTask`: one task instance, payload stored encoded
//! - `TaskStore`: persistence for task instances and dead letters, in memory or SQLite
//! - `InProcessTaskEngine`: the `TaskEngine` the orchestrator enqueues into
//! - `TaskExecutor`: claims due tasks, runs them, applies their `NextAction`

pub mod engine;
pub mod executor;
pub mod sqlite;
pub mod store;
pub mod types;

pub use engine::InProcessTaskEngine;
pub use executor::{ExecutorStats, TaskExecutor, TaskExecutorConfig, TaskExecutorHandle, TaskOutcome};
pub use sqlite::SqliteTaskStore;
pub use store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, RetryPolicy, ScheduledTask, TaskAttemptRecord, TaskStatus,
};
