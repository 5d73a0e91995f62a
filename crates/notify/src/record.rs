//! Persisted state of one logical notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use enforcement_core::{CaseId, Entity, NotificationId};

use crate::provider::ProviderNotificationId;
use crate::status::NotificationStatus;

/// Delivery channel. Only email is sent today.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Email,
    TextMessage,
    Letter,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "Email",
            NotificationType::TextMessage => "Text Message",
            NotificationType::Letter => "Letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Email" => Some(NotificationType::Email),
            "Text Message" => Some(NotificationType::TextMessage),
            "Letter" => Some(NotificationType::Letter),
            _ => None,
        }
    }
}

impl core::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot move notification {id} from {from} to {to}")]
pub struct TransitionError {
    pub id: NotificationId,
    pub from: NotificationStatus,
    pub to: NotificationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub case_id: CaseId,
    pub provider_notification_id: Option<ProviderNotificationId>,
    pub status: NotificationStatus,
    pub notification_type: NotificationType,
    pub recipient: String,
    pub scheduled_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// A new email record awaiting its first scheduled task.
    pub fn new_email(case_id: CaseId, recipient: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            case_id,
            provider_notification_id: None,
            status: NotificationStatus::PendingSchedule,
            notification_type: NotificationType::Email,
            recipient: recipient.into(),
            scheduled_at: now,
            submitted_at: None,
            last_updated_at: now,
        }
    }

    /// Apply a status change.
    ///
    /// `provider_id` is recorded only if none is stored yet; an existing id is
    /// never replaced or cleared.
    pub fn transition(
        &mut self,
        to: NotificationStatus,
        provider_id: Option<ProviderNotificationId>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }

        self.status = to;
        self.last_updated_at = at;

        if to.is_in_flight() && self.submitted_at.is_none() {
            self.submitted_at = Some(at);
        }

        if let Some(provider_id) = provider_id {
            match &self.provider_notification_id {
                None => self.provider_notification_id = Some(provider_id),
                Some(existing) if *existing != provider_id => {
                    tracing::warn!(
                        record_id = %self.id,
                        existing = %existing,
                        ignored = %provider_id,
                        "provider notification id already set; keeping the original"
                    );
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

impl Entity for NotificationRecord {
    type Id = NotificationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> NotificationRecord {
        NotificationRecord::new_email(CaseId::new(), "someone@example.com", Utc::now())
    }

    #[test]
    fn new_record_is_pending_schedule() {
        let r = record();
        assert_eq!(r.status, NotificationStatus::PendingSchedule);
        assert_eq!(r.notification_type, NotificationType::Email);
        assert!(r.submitted_at.is_none());
        assert!(r.provider_notification_id.is_none());
    }

    #[test]
    fn submitted_at_is_stamped_once() {
        let mut r = record();
        let first = Utc::now();
        r.transition(NotificationStatus::Sending, None, first).unwrap();
        r.transition(NotificationStatus::Submitted, None, first + Duration::seconds(5))
            .unwrap();

        assert_eq!(r.submitted_at, Some(first));
        assert_eq!(r.last_updated_at, first + Duration::seconds(5));
    }

    #[test]
    fn provider_id_is_set_at_most_once() {
        let mut r = record();
        let now = Utc::now();
        let p1 = ProviderNotificationId::new("P1").unwrap();
        let p2 = ProviderNotificationId::new("P2").unwrap();

        r.transition(NotificationStatus::Submitted, Some(p1.clone()), now).unwrap();
        r.transition(NotificationStatus::Submitted, Some(p2), now).unwrap();
        r.transition(NotificationStatus::Delivered, None, now).unwrap();

        assert_eq!(r.provider_notification_id, Some(p1));
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let mut r = record();
        let now = Utc::now();
        r.transition(NotificationStatus::PermanentFailure, None, now).unwrap();
        let before = r.clone();

        let err = r
            .transition(NotificationStatus::Submitted, None, now + Duration::seconds(1))
            .unwrap_err();

        assert_eq!(err.from, NotificationStatus::PermanentFailure);
        assert_eq!(err.to, NotificationStatus::Submitted);
        assert_eq!(r, before);
    }

    #[test]
    fn notification_type_display_names() {
        for ty in [
            NotificationType::Email,
            NotificationType::TextMessage,
            NotificationType::Letter,
        ] {
            assert_eq!(NotificationType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(NotificationType::TextMessage.to_string(), "Text Message");
    }
}
