//! Environment-based configuration.
//!
//! Every value has a default; a variable that is set but unparseable is an
//! error rather than a silent fallback.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use enforcement_notify::{NotifySettings, PermanentFailureAction};

pub const SEND_MAX_RETRIES: &str = "NOTIFY_SEND_EMAIL_MAX_RETRIES";
pub const SEND_BACKOFF_SECONDS: &str = "NOTIFY_SEND_EMAIL_BACKOFF_SECONDS";
pub const VERIFY_MAX_RETRIES: &str = "NOTIFY_CHECK_STATUS_MAX_RETRIES";
pub const VERIFY_BACKOFF_SECONDS: &str = "NOTIFY_CHECK_STATUS_BACKOFF_SECONDS";
pub const PROCESSING_DELAY_SECONDS: &str = "NOTIFY_TASK_PROCESSING_DELAY_SECONDS";
pub const VERIFY_DELAY_SECONDS: &str = "NOTIFY_CHECK_STATUS_TASK_DELAY_SECONDS";
pub const ON_PERMANENT_FAILURE: &str = "NOTIFY_ON_PERMANENT_FAILURE";

/// Upper bound for any configured delay or backoff.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub const DB_PATH: &str = "NOTIFY_DB_PATH";
pub const WORKER_POLL_MS: &str = "NOTIFY_WORKER_POLL_MS";
pub const WORKER_THREADS: &str = "NOTIFY_WORKER_THREADS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker process settings on top of [`NotifySettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("notifications.db"),
            poll_interval: Duration::from_millis(100),
            workers: 2,
        }
    }
}

/// Load pipeline settings from the process environment.
pub fn load_settings() -> Result<NotifySettings, ConfigError> {
    settings_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_worker_config() -> Result<WorkerConfig, ConfigError> {
    worker_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn settings_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<NotifySettings, ConfigError> {
    let defaults = NotifySettings::default();

    Ok(NotifySettings {
        send_max_retries: parsed(&lookup, SEND_MAX_RETRIES, defaults.send_max_retries)?,
        send_backoff: seconds(&lookup, SEND_BACKOFF_SECONDS, defaults.send_backoff)?,
        verify_max_retries: parsed(&lookup, VERIFY_MAX_RETRIES, defaults.verify_max_retries)?,
        verify_backoff: seconds(&lookup, VERIFY_BACKOFF_SECONDS, defaults.verify_backoff)?,
        processing_delay: seconds(&lookup, PROCESSING_DELAY_SECONDS, defaults.processing_delay)?,
        verify_delay: seconds(&lookup, VERIFY_DELAY_SECONDS, defaults.verify_delay)?,
        on_permanent_failure: match lookup(ON_PERMANENT_FAILURE) {
            None => defaults.on_permanent_failure,
            Some(raw) => PermanentFailureAction::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: ON_PERMANENT_FAILURE,
                value: raw.clone(),
                reason: "expected `remove` or `verify`".to_string(),
            })?,
        },
    })
}

pub fn worker_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<WorkerConfig, ConfigError> {
    let defaults = WorkerConfig::default();

    let workers: usize = parsed(&lookup, WORKER_THREADS, defaults.workers)?;
    if workers == 0 {
        return Err(ConfigError::Invalid {
            key: WORKER_THREADS,
            value: "0".to_string(),
            reason: "at least one worker is required".to_string(),
        });
    }

    Ok(WorkerConfig {
        db_path: lookup(DB_PATH)
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path),
        poll_interval: Duration::from_millis(parsed(
            &lookup,
            WORKER_POLL_MS,
            defaults.poll_interval.as_millis() as u64,
        )?),
        workers,
    })
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => {
            debug!(key, ?default, "using default");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let value = Duration::from_secs(parsed(lookup, key, default.as_secs())?);
    if value > MAX_DELAY {
        return Err(ConfigError::Invalid {
            key,
            value: value.as_secs().to_string(),
            reason: format!("must not exceed {} seconds", MAX_DELAY.as_secs()),
        });
    }
    Ok(value)
}
