use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use enforcement_infra::config::WorkerConfig;
use enforcement_infra::external::DryRunEmailProvider;
use enforcement_infra::records::SqliteNotificationStore;
use enforcement_infra::tasks::{
    ExecutorStats, InProcessTaskEngine, SqliteTaskStore, TaskExecutor, TaskExecutorConfig,
    TaskExecutorHandle, TaskStore,
};
use enforcement_notify::{
    EmailNotificationRequest, EmailNotificationResponse, EmailProvider, NotificationOrchestrator,
    NotificationStore, NotificationTasks, NotifySettings,
};

/// A wired pipeline with its executor threads running.
pub struct Worker {
    orchestrator: Arc<NotificationOrchestrator>,
    tasks: Arc<dyn TaskStore>,
    executor: TaskExecutorHandle,
    poll_interval: Duration,
}

impl Worker {
    /// Open the database and start the executor. Tasks queued by an earlier
    /// run are picked up again.
    pub fn start(settings: NotifySettings, config: &WorkerConfig) -> anyhow::Result<Self> {
        let records = SqliteNotificationStore::open(&config.db_path)
            .with_context(|| format!("opening record database {}", config.db_path.display()))?;
        let tasks = SqliteTaskStore::open(&config.db_path)
            .with_context(|| format!("opening task database {}", config.db_path.display()))?;
        info!(
            db_path = %config.db_path.display(),
            queued = tasks.stats()?.live(),
            "database ready"
        );

        Self::with_parts(
            Arc::new(records),
            Arc::new(tasks),
            Arc::new(DryRunEmailProvider::new()),
            settings,
            config,
        )
    }

    pub fn with_parts(
        records: Arc<dyn NotificationStore>,
        tasks: Arc<dyn TaskStore>,
        provider: Arc<dyn EmailProvider>,
        settings: NotifySettings,
        config: &WorkerConfig,
    ) -> anyhow::Result<Self> {
        let descriptors = settings.descriptors();
        let engine = Arc::new(InProcessTaskEngine::new(tasks.clone(), descriptors));
        let orchestrator = Arc::new(NotificationOrchestrator::new(records, engine, settings));
        let runner = Arc::new(NotificationTasks::new(orchestrator.clone(), provider));

        let executor = TaskExecutor::new(tasks.clone(), runner, descriptors)
            .spawn(
                TaskExecutorConfig::default()
                    .with_workers(config.workers)
                    .with_poll_interval(config.poll_interval),
            )
            .context("spawning task executor")?;

        Ok(Self {
            orchestrator,
            tasks,
            executor,
            poll_interval: config.poll_interval,
        })
    }

    pub fn orchestrator(&self) -> &NotificationOrchestrator {
        &self.orchestrator
    }

    /// Schedule one JSON-encoded [`EmailNotificationRequest`].
    pub fn submit_line(&self, line: &str) -> anyhow::Result<EmailNotificationResponse> {
        let request: EmailNotificationRequest =
            serde_json::from_str(line).context("parsing notification request")?;
        Ok(self.orchestrator.schedule_email(request)?)
    }

    /// Read requests line by line, writing one JSON acknowledgement per request.
    /// Bad lines are logged and skipped.
    ///
    /// Each acknowledgement goes out in a single write and is flushed, so a
    /// shared handle such as `io::stdout()` is only locked per response.
    pub fn process<R: BufRead, W: Write>(&self, input: R, mut output: W) -> anyhow::Result<usize> {
        let mut scheduled = 0;
        for line in input.lines() {
            let line = line.context("reading input")?;
            if line.trim().is_empty() {
                continue;
            }
            match self.submit_line(&line) {
                Ok(resp) => {
                    let mut ack = serde_json::to_vec(&resp)?;
                    ack.push(b'\n');
                    output.write_all(&ack)?;
                    output.flush()?;
                    scheduled += 1;
                }
                Err(e) => warn!(error = %format!("{e:#}"), "rejected request"),
            }
        }
        Ok(scheduled)
    }

    /// Block until no task is waiting or running.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        while self.tasks.stats()?.live() > 0 {
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    pub fn shutdown(self) -> ExecutorStats {
        let stats = self.executor.stats();
        self.executor.shutdown();
        stats
    }
}
