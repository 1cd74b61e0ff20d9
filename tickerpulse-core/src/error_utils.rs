//! Retry classification and log formatting for [`CoreError`].
//!
//! Ingestion never aborts on a remote failure: the classifier degrades to
//! keyword scoring and storage errors are reported and skipped. These helpers
//! decide which failures are worth another attempt and how each one reads in
//! the logs and in API responses.

use crate::error::*;
use std::time::Duration;
use tracing::{error, info, warn};

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    fn is_retryable(&self) -> bool;
    /// Suggested wait before the next attempt; `None` for permanent failures.
    fn retry_after(&self) -> Option<Duration>;
    fn user_friendly_message(&self) -> String;
    fn error_code(&self) -> &'static str;
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!(code = self.error_code(), "{}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!(code = self.error_code(), "{}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::SocialApi(e) => source_backoff(e),
            CoreError::Llm(e) => classifier_backoff(e),
            CoreError::Database(DatabaseError::DatabaseLocked) => Some(Duration::from_millis(100)),
            CoreError::Database(DatabaseError::ConnectionFailed { .. }) => {
                Some(Duration::from_secs(1))
            }
            CoreError::Network(e) if e.is_timeout() || e.is_connect() => {
                Some(Duration::from_secs(5))
            }
            CoreError::Timeout { seconds } => Some(Duration::from_secs(*seconds)),
            CoreError::RequestFailed {
                status_code: Some(429 | 500..=599),
                ..
            } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::SocialApi(e) => source_message(e),
            CoreError::Llm(e) => classifier_message(e),
            CoreError::Database(DatabaseError::DatabaseLocked) => {
                "Storage is busy with another write. Try again shortly.".to_string()
            }
            CoreError::Database(DatabaseError::ConstraintViolation { .. }) => {
                "That record is already stored.".to_string()
            }
            CoreError::Database(_) => "Stored sentiment data could not be read or written.".to_string(),
            CoreError::Config(e) => format!("Configuration problem: {}", e),
            CoreError::Network(_) => "Could not reach the remote service.".to_string(),
            CoreError::InvalidInput { message } => message.clone(),
            CoreError::Timeout { seconds } => {
                format!("No response within {} seconds.", seconds)
            }
            CoreError::NotFound { resource } => format!("{} not found", resource),
            CoreError::RequestFailed { status_code, .. } => match status_code {
                Some(code) => format!("The server answered with status {}.", code),
                None => "The request did not complete.".to_string(),
            },
            CoreError::CircuitOpen { operation } => format!(
                "{} is paused after repeated failures and will be retried later.",
                operation
            ),
            CoreError::Conflict { message } => message.clone(),
            CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal { .. } => {
                "An unexpected error occurred.".to_string()
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            CoreError::SocialApi(SocialApiError::RateLimitExceeded { .. }) => "SOURCE_RATE_LIMITED",
            CoreError::SocialApi(
                SocialApiError::AuthenticationFailed { .. } | SocialApiError::InvalidToken,
            ) => "SOURCE_AUTH",
            CoreError::SocialApi(
                SocialApiError::ChannelNotFound { .. } | SocialApiError::Forbidden { .. },
            ) => "SOURCE_CHANNEL_UNAVAILABLE",
            CoreError::SocialApi(_) => "SOURCE_FETCH",
            CoreError::Llm(
                LlmError::AuthenticationFailed { .. }
                | LlmError::InvalidApiKey { .. }
                | LlmError::InsufficientCredits { .. },
            ) => "CLASSIFIER_CREDENTIALS",
            CoreError::Llm(LlmError::RateLimitExceeded { .. }) => "CLASSIFIER_RATE_LIMITED",
            CoreError::Llm(
                LlmError::InvalidResponseFormat { .. } | LlmError::ContentFiltered { .. },
            ) => "CLASSIFIER_BAD_REPLY",
            CoreError::Llm(_) => "CLASSIFIER_UNAVAILABLE",
            CoreError::Database(DatabaseError::DatabaseLocked) => "STORAGE_LOCKED",
            CoreError::Database(DatabaseError::ConstraintViolation { .. }) => "STORAGE_DUPLICATE",
            CoreError::Database(DatabaseError::MigrationFailed { .. }) => "STORAGE_MIGRATION",
            CoreError::Database(_) => "STORAGE",
            CoreError::Config(_) => "CONFIG",
            CoreError::Io(_) => "IO",
            CoreError::Serialization(_) => "SERIALIZATION",
            CoreError::Network(_) => "NETWORK",
            CoreError::InvalidInput { .. } => "INVALID_INPUT",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Internal { .. } => "INTERNAL",
            CoreError::RequestFailed { .. } => "REQUEST_FAILED",
            CoreError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            CoreError::Conflict { .. } => "CONFLICT",
        }
    }
}

fn source_backoff(error: &SocialApiError) -> Option<Duration> {
    match error {
        SocialApiError::RateLimitExceeded { retry_after } => Some(Duration::from_secs(*retry_after)),
        SocialApiError::RequestTimeout | SocialApiError::InvalidResponse { .. } => {
            Some(Duration::from_secs(30))
        }
        SocialApiError::ServerError { status_code } if *status_code >= 500 => {
            Some(Duration::from_secs(30))
        }
        _ => None,
    }
}

// A malformed or refused reply will not improve on a resend, so only
// capacity problems are retried before falling back to keyword scoring.
fn classifier_backoff(error: &LlmError) -> Option<Duration> {
    match error {
        LlmError::RateLimitExceeded { retry_after, .. } => Some(Duration::from_secs(*retry_after)),
        LlmError::ServiceUnavailable { .. }
        | LlmError::ServerError { .. }
        | LlmError::RequestTimeout { .. } => Some(Duration::from_secs(10)),
        _ => None,
    }
}

fn source_message(error: &SocialApiError) -> String {
    match error {
        SocialApiError::RateLimitExceeded { retry_after } => format!(
            "The post source is throttling requests; the next fetch waits {} seconds.",
            retry_after
        ),
        SocialApiError::AuthenticationFailed { .. } | SocialApiError::InvalidToken => {
            "The post source rejected our credentials; check the Reddit client id and secret."
                .to_string()
        }
        SocialApiError::ChannelNotFound { channel } => {
            format!("r/{} does not exist or is private; it was skipped.", channel)
        }
        SocialApiError::Forbidden { resource } => {
            format!("{} is not readable; it was skipped.", resource)
        }
        _ => "The post source is unavailable; this fetch was skipped.".to_string(),
    }
}

fn classifier_message(error: &LlmError) -> String {
    match error {
        LlmError::AuthenticationFailed { provider }
        | LlmError::InvalidApiKey { provider }
        | LlmError::InsufficientCredits { provider } => format!(
            "{} rejected the API key; posts are scored by keywords until it is fixed.",
            provider
        ),
        LlmError::ModelNotAvailable { model } => format!(
            "Model '{}' is not available; posts are scored by keywords.",
            model
        ),
        LlmError::InvalidResponseFormat { .. } | LlmError::ContentFiltered { .. } => {
            "The sentiment model's reply was unusable; the batch was scored by keywords."
                .to_string()
        }
        _ => "The sentiment model is unavailable; posts were scored by keywords.".to_string(),
    }
}

/// Logs failures that a stage handles itself, such as a post that could not
/// be stored or folded into the ledger, instead of aborting the run.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    stage: &'static str,
}

impl ErrorReporter {
    pub fn new(stage: &'static str) -> Self {
        Self { stage }
    }

    pub fn report_error(&self, error: &CoreError) {
        error!(
            stage = self.stage,
            code = error.error_code(),
            "{}",
            error
        );
        match error.retry_after() {
            Some(delay) => info!(stage = self.stage, "Transient, next run may succeed (hint {:?})", delay),
            None => info!(stage = self.stage, "{}", error.user_friendly_message()),
        }
    }

    pub fn report_warning(&self, error: &CoreError) {
        warn!(
            stage = self.stage,
            code = error.error_code(),
            "{}",
            error
        );
    }
}
