//! Second stage: confirm delivery with the provider.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::orchestrator::NotificationOrchestrator;
use crate::provider::EmailProvider;
use crate::status::NotificationStatus;
use crate::task::{EmailTaskState, NextAction};

pub struct VerifyEmailTask {
    orchestrator: Arc<NotificationOrchestrator>,
    provider: Arc<dyn EmailProvider>,
}

impl VerifyEmailTask {
    pub fn new(orchestrator: Arc<NotificationOrchestrator>, provider: Arc<dyn EmailProvider>) -> Self {
        Self {
            orchestrator,
            provider,
        }
    }

    /// A single status observation. Always completes with [`NextAction::Remove`].
    pub fn execute(&self, state: &EmailTaskState) -> NextAction {
        let record_id = state.record_id;

        let Some(provider_id) = &state.provider_notification_id else {
            warn!(record_id = %record_id, "no provider notification id; cannot verify");
            self.orchestrator
                .set_status(record_id, NotificationStatus::PermanentFailure);
            return NextAction::Remove;
        };

        match self.provider.get_status(provider_id) {
            Ok(notification) if notification.is_delivered() => {
                info!(record_id = %record_id, provider_id = %provider_id, "email delivered");
                self.orchestrator
                    .set_status(record_id, NotificationStatus::Delivered);
            }
            Ok(notification) => {
                warn!(
                    record_id = %record_id,
                    provider_id = %provider_id,
                    provider_status = %notification.status,
                    "email not delivered"
                );
                self.orchestrator
                    .set_status(record_id, NotificationStatus::PermanentFailure);
            }
            Err(err) if err.is_not_found() => {
                warn!(record_id = %record_id, provider_id = %provider_id, "provider has no such notification");
                self.orchestrator
                    .set_status(record_id, NotificationStatus::PermanentFailure);
            }
            Err(err) => {
                error!(
                    record_id = %record_id,
                    provider_id = %provider_id,
                    error = %err,
                    "delivery verification failed; giving up"
                );
            }
        }

        NextAction::Remove
    }
}
