//! Failure taxonomy for calls to the embedding and completion services.
//!
//! Job code works in `anyhow`; only the service boundary uses
//! [`ServiceError`], because the retry policy has to know which failures
//! are worth repeating.

use thiserror::Error;

/// Coarse category used by [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    RateLimit,
    Transient,
    Client,
    Schema,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient service error: {0}")]
    Transient(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("model refused: {0}")]
    Refusal(String),

    #[error("response does not match schema: {0}")]
    Schema(String),

    #[error("embedding has {got} dimensions, expected {expected}")]
    Dimension { expected: usize, got: usize },
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::MissingCredential(_) => ErrorClass::Config,
            ServiceError::RateLimited(_) => ErrorClass::RateLimit,
            ServiceError::Transient(_) => ErrorClass::Transient,
            ServiceError::Api { .. } => ErrorClass::Client,
            ServiceError::Refusal(_) | ServiceError::Schema(_) | ServiceError::Dimension { .. } => {
                ErrorClass::Schema
            }
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ServiceError::RateLimited(body),
            500..=599 => ServiceError::Transient(format!("HTTP {}: {}", status, body)),
            _ => ServiceError::Api {
                status,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceError::Schema(e.to_string())
        } else {
            ServiceError::Transient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Schema(e.to_string())
    }
}

/// Shorten an error message for per-contact log lines and summaries.
pub fn truncate_message(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    let mut out: String = msg.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            ServiceError::from_status(429, String::new()).class(),
            ErrorClass::RateLimit
        );
        assert_eq!(
            ServiceError::from_status(503, String::new()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ServiceError::from_status(400, String::new()).class(),
            ErrorClass::Client
        );
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdefghij", 4), "abcd...");
    }
}
