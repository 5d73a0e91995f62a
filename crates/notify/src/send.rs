//! First stage: hand the email to the provider.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::ErrorCategory;
use crate::orchestrator::NotificationOrchestrator;
use crate::provider::EmailProvider;
use crate::settings::{PermanentFailureAction, delayed};
use crate::status::NotificationStatus;
use crate::task::{EmailTaskState, NextAction, TaskFailure, TaskKind};

pub struct SendEmailTask {
    orchestrator: Arc<NotificationOrchestrator>,
    provider: Arc<dyn EmailProvider>,
}

impl SendEmailTask {
    pub fn new(orchestrator: Arc<NotificationOrchestrator>, provider: Arc<dyn EmailProvider>) -> Self {
        Self {
            orchestrator,
            provider,
        }
    }

    /// One send attempt. Makes at most one provider call.
    pub fn execute(&self, state: &EmailTaskState) -> NextAction {
        let record_id = state.record_id;

        match self.orchestrator.notification(record_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(record_id = %record_id, task_id = %state.task_id, "notification record missing; dropping send task");
                return NextAction::Remove;
            }
            Err(e) => {
                // Nothing has been sent yet, so another attempt is safe.
                error!(record_id = %record_id, error = %e, "could not load notification record");
                return NextAction::Fail(TaskFailure::retryable(
                    ErrorCategory::Technical,
                    format!("record lookup failed: {e}"),
                ));
            }
        }

        // Fresh per attempt so the provider never sees a repeated reference.
        let reference = Uuid::now_v7().to_string();

        let outcome = self.provider.send_email(
            &state.template_id,
            &state.recipient_address,
            &state.personalisation,
            &reference,
        );

        match outcome {
            Ok(response) => match response.notification_id {
                Some(provider_id) => {
                    info!(record_id = %record_id, provider_id = %provider_id, "email submitted to provider");
                    self.orchestrator.update_after_send(record_id, &provider_id);
                    NextAction::ReplaceWith {
                        kind: TaskKind::VerifyEmail,
                        payload: state.with_provider_id(Some(provider_id)),
                        execute_at: self.verify_at(),
                    }
                }
                None => {
                    error!(record_id = %record_id, "provider accepted the email but returned no notification id");
                    self.orchestrator
                        .set_status(record_id, NotificationStatus::PermanentFailure);
                    NextAction::Fail(TaskFailure::fatal(
                        ErrorCategory::Permanent,
                        "provider returned no notification id",
                    ))
                }
            },
            Err(err) => {
                let category = self.orchestrator.update_after_failure(record_id, &err);
                warn!(
                    record_id = %record_id,
                    status_code = err.status_code,
                    category = %category,
                    error = %err.message,
                    "email send failed"
                );

                match category {
                    ErrorCategory::Permanent => {
                        match self.orchestrator.settings().on_permanent_failure {
                            PermanentFailureAction::Remove => NextAction::Remove,
                            PermanentFailureAction::Verify => NextAction::ReplaceWith {
                                kind: TaskKind::VerifyEmail,
                                payload: state.with_provider_id(None),
                                execute_at: self.verify_at(),
                            },
                        }
                    }
                    ErrorCategory::Temporary => {
                        NextAction::Fail(TaskFailure::retryable(category, err.to_string()))
                    }
                    ErrorCategory::Technical => {
                        NextAction::Fail(TaskFailure::fatal(category, err.to_string()))
                    }
                }
            }
        }
    }

    fn verify_at(&self) -> chrono::DateTime<Utc> {
        delayed(Utc::now(), self.orchestrator.settings().verify_delay)
    }
}
