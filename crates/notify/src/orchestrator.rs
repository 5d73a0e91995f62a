//! Entry point for scheduling emails and the single path for record updates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use enforcement_core::{CaseId, DomainError, NotificationId, TaskId};

use crate::classify::ErrorCategory;
use crate::error::NotifyError;
use crate::model::{EmailNotificationRequest, EmailNotificationResponse};
use crate::provider::{ProviderError, ProviderNotificationId};
use crate::record::NotificationRecord;
use crate::settings::{NotifySettings, delayed};
use crate::status::NotificationStatus;
use crate::store::{NotificationStore, StoreError};
use crate::task::{EmailTaskState, TaskDescriptors, TaskEngine, TaskKind};

pub struct NotificationOrchestrator {
    store: Arc<dyn NotificationStore>,
    engine: Arc<dyn TaskEngine>,
    settings: NotifySettings,
    descriptors: TaskDescriptors,
}

impl NotificationOrchestrator {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        engine: Arc<dyn TaskEngine>,
        settings: NotifySettings,
    ) -> Self {
        let descriptors = settings.descriptors();
        Self {
            store,
            engine,
            settings,
            descriptors,
        }
    }

    pub fn settings(&self) -> &NotifySettings {
        &self.settings
    }

    pub fn descriptors(&self) -> &TaskDescriptors {
        &self.descriptors
    }

    /// Schedule an email under a freshly generated case id.
    pub fn schedule_email(
        &self,
        request: EmailNotificationRequest,
    ) -> Result<EmailNotificationResponse, NotifyError> {
        self.schedule_email_for_case(CaseId::new(), request)
    }

    /// Create the record, mark it scheduled and enqueue its send task.
    ///
    /// Only validation and record creation fail the call. Once the record
    /// exists, enqueue problems are logged and the acknowledgement is still
    /// returned; the record's status tells the rest.
    pub fn schedule_email_for_case(
        &self,
        case_id: CaseId,
        request: EmailNotificationRequest,
    ) -> Result<EmailNotificationResponse, NotifyError> {
        validate(&request)?;

        let now = Utc::now();
        let record = NotificationRecord::new_email(case_id, request.email_address.clone(), now);
        self.store.create(&record).map_err(|e| {
            error!(record_id = %record.id, error = %e, "failed to create notification record");
            e
        })?;

        let task_id = TaskId::new();
        let state = EmailTaskState {
            task_id,
            record_id: record.id,
            template_id: request.template_id,
            recipient_address: request.email_address,
            personalisation: request.personalisation,
            reference: request.reference,
            reply_to_id: request.email_reply_to_id,
            provider_notification_id: None,
        };

        self.set_status(record.id, NotificationStatus::Scheduled);

        let execute_at = delayed(now, self.settings.processing_delay);
        match self
            .engine
            .enqueue_if_absent(TaskKind::SendEmail, task_id, &state, execute_at)
        {
            Ok(true) => {
                info!(record_id = %record.id, task_id = %task_id, %execute_at, "send task scheduled");
            }
            Ok(false) => {
                warn!(record_id = %record.id, task_id = %task_id, "send task already present; enqueue ignored");
            }
            Err(e) => {
                error!(record_id = %record.id, task_id = %task_id, error = %e, "failed to enqueue send task");
            }
        }

        Ok(EmailNotificationResponse {
            task_id,
            status: NotificationStatus::Scheduled,
            notification_id: record.id,
        })
    }

    /// Apply a wire status token. Unknown tokens are logged and ignored.
    pub fn update_status(&self, record_id: NotificationId, token: &str) {
        match token.parse::<NotificationStatus>() {
            Ok(status) => {
                self.set_status(record_id, status);
            }
            Err(e) => {
                warn!(record_id = %record_id, token, error = %e, "ignoring unknown status token");
            }
        }
    }

    pub fn set_status(
        &self,
        record_id: NotificationId,
        status: NotificationStatus,
    ) -> Option<NotificationRecord> {
        self.apply(record_id, status, None)
    }

    pub fn update_after_send(
        &self,
        record_id: NotificationId,
        provider_id: &ProviderNotificationId,
    ) -> Option<NotificationRecord> {
        self.apply(record_id, NotificationStatus::Submitted, Some(provider_id.clone()))
    }

    /// Record a provider failure and report how it was classified.
    pub fn update_after_failure(
        &self,
        record_id: NotificationId,
        err: &ProviderError,
    ) -> ErrorCategory {
        let category = err.category();
        let status = match category {
            ErrorCategory::Permanent => NotificationStatus::PermanentFailure,
            ErrorCategory::Temporary => NotificationStatus::TemporaryFailure,
            ErrorCategory::Technical => NotificationStatus::TechnicalFailure,
        };
        self.apply(record_id, status, None);
        category
    }

    pub fn notification(
        &self,
        record_id: NotificationId,
    ) -> Result<Option<NotificationRecord>, NotifyError> {
        Ok(self.store.get(record_id)?)
    }

    pub fn notifications_for_case(
        &self,
        case_id: CaseId,
    ) -> Result<Vec<NotificationRecord>, NotifyError> {
        Ok(self.store.list_by_case(case_id)?)
    }

    // Every record mutation goes through here. Failures never reach the caller.
    fn apply(
        &self,
        record_id: NotificationId,
        status: NotificationStatus,
        provider_id: Option<ProviderNotificationId>,
    ) -> Option<NotificationRecord> {
        let now = Utc::now();
        let result = self.store.update_with(record_id, &mut |record| {
            record.transition(status, provider_id.clone(), now)
        });

        match result {
            Ok(record) => {
                debug!(record_id = %record_id, status = %record.status, "notification status updated");
                Some(record)
            }
            Err(StoreError::Rejected(e)) => {
                warn!(record_id = %record_id, from = %e.from, to = %e.to, "status change rejected");
                None
            }
            Err(e) => {
                error!(record_id = %record_id, status = %status, error = %e, "failed to update notification status");
                None
            }
        }
    }
}

fn validate(request: &EmailNotificationRequest) -> Result<(), DomainError> {
    if request.template_id.trim().is_empty() {
        return Err(DomainError::validation("templateId must not be empty"));
    }
    if request.email_address.trim().is_empty() {
        return Err(DomainError::validation("emailAddress must not be empty"));
    }
    Ok(())
}
