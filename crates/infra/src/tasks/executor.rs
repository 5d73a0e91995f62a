//! Runs due tasks and applies the [`NextAction`] each one returns.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use enforcement_notify::{EngineError, NextAction, TaskDescriptors, TaskEngine, TaskRunner};

use super::engine::InProcessTaskEngine;
use super::store::{TaskStore, TaskStoreError};
use super::types::{ScheduledTask, TaskStatus};

#[derive(Debug, Clone)]
pub struct TaskExecutorConfig {
    /// How long an idle worker sleeps before polling again
    pub poll_interval: Duration,
    /// Worker threads
    pub workers: usize,
    /// Name for logging
    pub name: String,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 2,
            name: "notify-executor".to_string(),
        }
    }
}

impl TaskExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What happened to a task after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Removed,
    Replaced,
    Retrying,
    DeadLettered,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub tasks_processed: u64,
    pub tasks_removed: u64,
    pub tasks_replaced: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: TaskOutcome) {
        self.tasks_processed += 1;
        match outcome {
            TaskOutcome::Removed => self.tasks_removed += 1,
            TaskOutcome::Replaced => self.tasks_replaced += 1,
            TaskOutcome::Retrying => self.tasks_retried += 1,
            TaskOutcome::DeadLettered => self.tasks_dead_lettered += 1,
        }
    }
}

/// Handle to control running executor threads.
#[derive(Debug)]
pub struct TaskExecutorHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl TaskExecutorHandle {
    /// Stop all workers after their current task and wait for them.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Polls a task store and hands due tasks to a [`TaskRunner`].
pub struct TaskExecutor<S: TaskStore> {
    engine: InProcessTaskEngine<S>,
    runner: Arc<dyn TaskRunner>,
}

impl<S: TaskStore + 'static> TaskExecutor<S> {
    pub fn new(store: S, runner: Arc<dyn TaskRunner>, descriptors: TaskDescriptors) -> Self {
        Self {
            engine: InProcessTaskEngine::new(store, descriptors),
            runner,
        }
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    /// Run every task due at `now`, treating `now` as the current time.
    ///
    /// Replacements scheduled at or before `now` run in the same pass. Retry
    /// backoff is measured from `now`, so a failed task waits for a later pass.
    pub fn run_due(&self, now: DateTime<Utc>) -> Result<usize, TaskStoreError> {
        let mut ran = 0;
        while let Some(mut task) = self.store().claim_next(now)? {
            self.execute_one(&mut task, now)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Run a claimed task and persist the result.
    pub fn execute_one(
        &self,
        task: &mut ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome, TaskStoreError> {
        let started = Utc::now();

        let state = match task.state() {
            Ok(state) => state,
            Err(e) => {
                let reason = format!("undecodable payload: {e}");
                error!(task_id = %task.id, kind = %task.kind, error = %e, "dropping task with bad payload");
                task.mark_failed(reason.clone(), false, started, now);
                self.store().dead_letter(task.clone(), reason)?;
                return Ok(TaskOutcome::DeadLettered);
            }
        };

        match self.runner.run(task.kind, &state) {
            NextAction::Remove => {
                self.store().remove(task.id)?;
                debug!(task_id = %task.id, kind = %task.kind, "task completed");
                Ok(TaskOutcome::Removed)
            }
            NextAction::ReplaceWith {
                kind,
                payload,
                execute_at,
            } => match self
                .engine
                .schedule_replacement(task.id, kind, &payload, execute_at)
            {
                Ok(()) => {
                    if let Some(replaced) = self.store().get(task.id)? {
                        *task = replaced;
                    }
                    Ok(TaskOutcome::Replaced)
                }
                Err(EngineError::Payload(e)) => {
                    let reason = format!("replacement payload not encodable: {e}");
                    task.mark_failed(reason.clone(), false, started, now);
                    self.store().dead_letter(task.clone(), reason)?;
                    Ok(TaskOutcome::DeadLettered)
                }
                Err(EngineError::NotFound(id)) => Err(TaskStoreError::NotFound(id)),
                Err(EngineError::Unavailable(e)) => Err(TaskStoreError::Storage(e)),
            },
            NextAction::Fail(failure) => {
                task.mark_failed(failure.message.clone(), failure.retryable, started, now);

                if let TaskStatus::DeadLettered { attempts, .. } = task.status {
                    warn!(
                        task_id = %task.id,
                        kind = %task.kind,
                        attempts,
                        category = %failure.category,
                        error = %failure.message,
                        "task dead-lettered"
                    );
                    self.store().dead_letter(task.clone(), failure.message)?;
                    Ok(TaskOutcome::DeadLettered)
                } else {
                    debug!(
                        task_id = %task.id,
                        attempt = task.attempt,
                        retry_at = %task.execute_at,
                        "task will be retried"
                    );
                    self.store().update(task)?;
                    Ok(TaskOutcome::Retrying)
                }
            }
        }
    }

    /// Spawn `config.workers` background threads sharing this executor.
    pub fn spawn(self, config: TaskExecutorConfig) -> io::Result<TaskExecutorHandle>
    where
        S: Send + Sync,
    {
        let executor = Arc::new(self);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let mut shutdown = Vec::new();
        let mut joins = Vec::new();

        for n in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<()>();
            let executor = executor.clone();
            let stats = stats.clone();
            let config = config.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{n}", config.name))
                .spawn(move || executor_loop(&executor, &config, &rx, &stats))?;
            shutdown.push(tx);
            joins.push(join);
        }

        Ok(TaskExecutorHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

fn executor_loop<S: TaskStore + 'static>(
    executor: &TaskExecutor<S>,
    config: &TaskExecutorConfig,
    shutdown_rx: &mpsc::Receiver<()>,
    stats: &Mutex<ExecutorStats>,
) {
    info!(executor = %config.name, "task executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Utc::now();
        match executor.store().claim_next(now) {
            Ok(Some(mut task)) => {
                debug!(executor = %config.name, task_id = %task.id, kind = %task.kind, attempt = task.attempt, "claimed task");
                bump(stats, |s| s.current_running += 1);

                let result = executor.execute_one(&mut task, now);

                bump(stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.uptime_secs = start_time.elapsed().as_secs();
                    if let Ok(outcome) = &result {
                        s.record(*outcome);
                    }
                });

                if let Err(e) = result {
                    error!(executor = %config.name, task_id = %task.id, error = %e, "failed to persist task outcome");
                }
            }
            Ok(None) => {
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim task");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "task executor stopped");
}

fn bump(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}
