//! Capability surface of the third-party email provider.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use enforcement_core::{DomainError, DomainResult};

use crate::classify::{self, ErrorCategory};

/// Identifier the provider assigns to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderNotificationId(String);

impl ProviderNotificationId {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id(
                "ProviderNotificationId: must not be blank",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ProviderNotificationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider returned {status_code}: {message}")]
pub struct ProviderError {
    pub status_code: u16,
    pub message: String,
}

impl ProviderError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        classify::classify(self.status_code)
    }

    pub fn is_not_found(&self) -> bool {
        classify::is_not_found(self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendEmailResponse {
    /// `None` means the provider accepted the call but returned no id.
    pub notification_id: Option<ProviderNotificationId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderNotification {
    pub id: ProviderNotificationId,
    pub status: String,
}

impl ProviderNotification {
    pub fn is_delivered(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("delivered")
    }
}

pub trait EmailProvider: Send + Sync {
    fn send_email(
        &self,
        template_id: &str,
        email_address: &str,
        personalisation: &BTreeMap<String, serde_json::Value>,
        reference: &str,
    ) -> Result<SendEmailResponse, ProviderError>;

    fn get_status(
        &self,
        notification_id: &ProviderNotificationId,
    ) -> Result<ProviderNotification, ProviderError>;
}
