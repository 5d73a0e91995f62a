use std::sync::Arc;

use crate::orchestrator::NotificationOrchestrator;
use crate::provider::EmailProvider;
use crate::send::SendEmailTask;
use crate::task::{EmailTaskState, NextAction, TaskKind, TaskRunner};
use crate::verify::VerifyEmailTask;

/// Dispatches engine invocations to the send and verify task bodies.
pub struct NotificationTasks {
    send: SendEmailTask,
    verify: VerifyEmailTask,
}

impl NotificationTasks {
    pub fn new(orchestrator: Arc<NotificationOrchestrator>, provider: Arc<dyn EmailProvider>) -> Self {
        Self {
            send: SendEmailTask::new(orchestrator.clone(), provider.clone()),
            verify: VerifyEmailTask::new(orchestrator, provider),
        }
    }
}

impl TaskRunner for NotificationTasks {
    fn run(&self, kind: TaskKind, payload: &EmailTaskState) -> NextAction {
        let _span = tracing::info_span!("task", kind = %kind, task_id = %payload.task_id).entered();
        match kind {
            TaskKind::SendEmail => self.send.execute(payload),
            TaskKind::VerifyEmail => self.verify.execute(payload),
        }
    }
}
