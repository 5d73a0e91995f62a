//! Email provider adapters.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use tracing::info;
use uuid::Uuid;

use enforcement_notify::{
    EmailProvider, ProviderError, ProviderNotification, ProviderNotificationId, SendEmailResponse,
};

/// Provider for development and test environments: nothing leaves the process.
///
/// Every send is accepted and logged. Ids it handed out report `delivered`;
/// any other id is unknown (404).
#[derive(Debug, Default)]
pub struct DryRunEmailProvider {
    issued: RwLock<HashSet<ProviderNotificationId>>,
}

impl DryRunEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unavailable() -> ProviderError {
    ProviderError::new(500, "dry-run provider state unavailable")
}

impl EmailProvider for DryRunEmailProvider {
    fn send_email(
        &self,
        template_id: &str,
        email_address: &str,
        personalisation: &BTreeMap<String, serde_json::Value>,
        reference: &str,
    ) -> Result<SendEmailResponse, ProviderError> {
        let id = ProviderNotificationId::new(Uuid::now_v7().to_string())
            .map_err(|e| ProviderError::new(500, e.to_string()))?;

        info!(
            template_id,
            email_address,
            reference,
            fields = personalisation.len(),
            provider_id = %id,
            "dry-run email accepted"
        );

        self.issued.write().map_err(|_| unavailable())?.insert(id.clone());
        Ok(SendEmailResponse {
            notification_id: Some(id),
        })
    }

    fn get_status(
        &self,
        notification_id: &ProviderNotificationId,
    ) -> Result<ProviderNotification, ProviderError> {
        let known = self
            .issued
            .read()
            .map_err(|_| unavailable())?
            .contains(notification_id);

        if known {
            Ok(ProviderNotification {
                id: notification_id.clone(),
                status: "delivered".to_string(),
            })
        } else {
            Err(ProviderError::new(404, format!("no notification {notification_id}")))
        }
    }
}
