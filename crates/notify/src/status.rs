//! Notification status state machine.
//!
//! Statuses are grouped into pipeline stages. A record may stay in its stage or
//! move forward, never back, and nothing leaves a terminal status:
//!
//! ```text
//! stage 0  Created, PendingSchedule
//! stage 1  Scheduled
//! stage 2  Sending, Submitted, TemporaryFailure
//! stage 3  Delivered, PermanentFailure, TechnicalFailure   (terminal)
//! ```
//!
//! `TemporaryFailure` shares stage 2 with `Submitted` because a retried send
//! that later succeeds must be able to move the record to `Submitted`.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationStatus {
    Created,
    PendingSchedule,
    Scheduled,
    Sending,
    Submitted,
    TemporaryFailure,
    Delivered,
    PermanentFailure,
    TechnicalFailure,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 9] = [
        NotificationStatus::Created,
        NotificationStatus::PendingSchedule,
        NotificationStatus::Scheduled,
        NotificationStatus::Sending,
        NotificationStatus::Submitted,
        NotificationStatus::TemporaryFailure,
        NotificationStatus::Delivered,
        NotificationStatus::PermanentFailure,
        NotificationStatus::TechnicalFailure,
    ];

    /// Wire token (lowercase, hyphenated).
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Created => "created",
            NotificationStatus::PendingSchedule => "pending-schedule",
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Submitted => "submitted",
            NotificationStatus::TemporaryFailure => "temporary-failure",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::PermanentFailure => "permanent-failure",
            NotificationStatus::TechnicalFailure => "technical-failure",
        }
    }

    fn stage(&self) -> u8 {
        match self {
            NotificationStatus::Created | NotificationStatus::PendingSchedule => 0,
            NotificationStatus::Scheduled => 1,
            NotificationStatus::Sending
            | NotificationStatus::Submitted
            | NotificationStatus::TemporaryFailure => 2,
            NotificationStatus::Delivered
            | NotificationStatus::PermanentFailure
            | NotificationStatus::TechnicalFailure => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::PermanentFailure
                | NotificationStatus::TechnicalFailure
        )
    }

    /// Statuses that stamp `submitted_at` the first time they are entered.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NotificationStatus::Sending | NotificationStatus::Submitted)
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown notification status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for NotificationStatus {
    type Err = UnknownStatus;

    /// Tokens are matched case-insensitively; providers are not consistent
    /// about casing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
