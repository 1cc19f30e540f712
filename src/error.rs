//! Error types for key validation and limiter configuration.
//!
//! Nothing here is ever raised across the public accounting boundary:
//! [`UsageLimiter::check_and_increment_usage`](crate::UsageLimiter::check_and_increment_usage)
//! always answers with a decision, and [`KeyValidator`](crate::KeyValidator) answers with a
//! `Result<ApiKeyRecord, KeyError>` value. Store failures are folded into
//! [`KeyError::Service`] at the operation boundary.
use crate::record::ApiKeyRecord;
use thiserror::Error;

/// Why a key was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// Key string does not carry the configured prefix.
    #[error("Invalid API key format. Must start with \"{prefix}\"")]
    Format {
        /// Prefix the key was expected to start with.
        prefix: String,
    },
    /// No record exists for the key. Deliberately indistinguishable from a bad credential.
    #[error("Invalid API key")]
    NotFound,
    /// The record exists but lacks at least one required capability.
    #[error("Insufficient permissions. Required: {}", required.join(", "))]
    Permission {
        /// Permissions the caller asked for.
        required: Vec<String>,
        /// The record that was found, so callers can report what it does grant.
        record: Box<ApiKeyRecord>,
    },
    /// The backing store failed.
    #[error("API key validation failed")]
    Service(String),
}

impl KeyError {
    /// HTTP-class status code a request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            KeyError::Format { .. } | KeyError::NotFound => 401,
            KeyError::Permission { .. } => 403,
            KeyError::Service(_) => 500,
        }
    }

    /// True for the credential-shaped failures (bad format or unknown key).
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, KeyError::Format { .. } | KeyError::NotFound)
    }

    /// Borrow the record attached to a permission failure.
    pub fn record(&self) -> Option<&ApiKeyRecord> {
        match self {
            KeyError::Permission { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Errors produced while building a [`LimiterConfig`](crate::LimiterConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `key_prefix` must not be empty.
    #[error("key_prefix must not be empty")]
    EmptyKeyPrefix,
    /// `default_usage_limit` must be > 0.
    #[error("default_usage_limit must be > 0 (got {0})")]
    InvalidUsageLimit(u64),
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_mentions_prefix() {
        let err = KeyError::Format { prefix: "api_".into() };
        assert_eq!(err.to_string(), "Invalid API key format. Must start with \"api_\"");
        assert_eq!(err.status_code(), 401);
        assert!(err.is_invalid_credential());
    }

    #[test]
    fn not_found_reads_like_a_bad_credential() {
        let err = KeyError::NotFound;
        assert_eq!(err.to_string(), "Invalid API key");
        assert_eq!(err.status_code(), 401);
        assert!(err.record().is_none());
    }

    #[test]
    fn permission_error_lists_requirements() {
        let err = KeyError::Permission {
            required: vec!["read".into(), "write".into()],
            record: Box::new(ApiKeyRecord::new("api_x")),
        };
        assert_eq!(err.to_string(), "Insufficient permissions. Required: read, write");
        assert_eq!(err.status_code(), 403);
        assert!(!err.is_invalid_credential());
        assert_eq!(err.record().map(|r| r.key.as_str()), Some("api_x"));
    }

    #[test]
    fn service_error_hides_the_cause() {
        let err = KeyError::Service("connection reset".into());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.to_string(), "API key validation failed");
        assert!(!err.is_invalid_credential());
    }

    #[test]
    fn config_error_display() {
        assert_eq!(ConfigError::InvalidMaxAttempts(0).to_string(), "max_attempts must be > 0 (got 0)");
        assert!(ConfigError::EmptyKeyPrefix.to_string().contains("key_prefix"));
    }
}
