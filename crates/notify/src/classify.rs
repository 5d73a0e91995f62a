//! Maps provider HTTP status codes to a failure category.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The request can never succeed (bad template, rejected recipient).
    Permanent,
    /// Rate limiting or a provider-side fault; worth retrying later.
    Temporary,
    /// Anything we cannot account for.
    ///
    /// Not retried: the record moves to a terminal status, so another run
    /// could not change it. The task goes straight to dead letters.
    Technical,
}

impl core::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Technical => "technical",
        })
    }
}

pub fn classify(status_code: u16) -> ErrorCategory {
    match status_code {
        400 | 403 => ErrorCategory::Permanent,
        429 | 500 => ErrorCategory::Temporary,
        _ => ErrorCategory::Technical,
    }
}

pub fn is_not_found(status_code: u16) -> bool {
    status_code == 404
}
