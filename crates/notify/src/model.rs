//! Request and response shapes at the scheduling boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use enforcement_core::{NotificationId, TaskId};

use crate::status::NotificationStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailNotificationRequest {
    pub template_id: String,
    pub email_address: String,
    #[serde(default)]
    pub personalisation: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub email_reply_to_id: Option<String>,
}

impl EmailNotificationRequest {
    pub fn new(template_id: impl Into<String>, email_address: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            email_address: email_address.into(),
            personalisation: BTreeMap::new(),
            reference: None,
            email_reply_to_id: None,
        }
    }

    pub fn with_personalisation(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.personalisation.insert(key.into(), value);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Acknowledgement returned once the send task is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailNotificationResponse {
    pub task_id: TaskId,
    pub status: NotificationStatus,
    pub notification_id: NotificationId,
}
