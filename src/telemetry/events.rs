use crate::limiter::DenialReason;
use crate::window::RateLimitWindow;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Number of leading key characters kept when a key appears in logs or events.
const VISIBLE_KEY_CHARS: usize = 6;

/// Shorten a key for logs: `api_3f9c81...` becomes `api_3f…`.
pub fn mask_key(key: &str) -> String {
    let mut chars = key.chars();
    let visible: String = chars.by_ref().take(VISIBLE_KEY_CHARS).collect();
    if chars.next().is_some() {
        format!("{visible}…")
    } else {
        visible
    }
}

/// Which store primitive failed during accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Read,
    ConditionalUpdate,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Read => "read",
            StoreOperation::ConditionalUpdate => "conditional_update",
        };
        f.write_str(name)
    }
}

/// Events emitted while accounting usage. Keys are always masked.
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// Usage was committed.
    Allowed {
        key: String,
        increment: u64,
        current: u64,
        remaining: u64,
    },
    /// The request was refused without committing usage.
    Denied {
        key: String,
        reason: DenialReason,
        current: u64,
        limit: u64,
    },
    /// An expired window was rolled over.
    WindowReset {
        key: String,
        window: RateLimitWindow,
        reset_at: DateTime<Utc>,
    },
    /// A conditional write lost to a concurrent writer; the attempt will be repeated.
    Contention {
        key: String,
        /// The attempt that lost (1-indexed).
        attempt: usize,
        /// Pause before the next attempt.
        delay: Duration,
    },
    /// Every attempt lost its race.
    ContentionExhausted {
        key: String,
        attempts: usize,
    },
    /// The store returned an error.
    StoreFailure {
        key: String,
        operation: StoreOperation,
    },
}

impl LimiterEvent {
    /// Stable snake_case name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterEvent::Allowed { .. } => "allowed",
            LimiterEvent::Denied { .. } => "denied",
            LimiterEvent::WindowReset { .. } => "window_reset",
            LimiterEvent::Contention { .. } => "contention",
            LimiterEvent::ContentionExhausted { .. } => "contention_exhausted",
            LimiterEvent::StoreFailure { .. } => "store_failure",
        }
    }

    /// The masked key the event refers to.
    pub fn key(&self) -> &str {
        match self {
            LimiterEvent::Allowed { key, .. }
            | LimiterEvent::Denied { key, .. }
            | LimiterEvent::WindowReset { key, .. }
            | LimiterEvent::Contention { key, .. }
            | LimiterEvent::ContentionExhausted { key, .. }
            | LimiterEvent::StoreFailure { key, .. } => key,
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Allowed { key, increment, current, remaining } => write!(
                f,
                "Allowed({key}, +{increment}, current={current}, remaining={remaining})"
            ),
            LimiterEvent::Denied { key, reason, current, limit } => {
                write!(f, "Denied({key}, {reason}, {current}/{limit})")
            }
            LimiterEvent::WindowReset { key, window, reset_at } => {
                write!(f, "WindowReset({key}, {window}, until={})", reset_at.to_rfc3339())
            }
            LimiterEvent::Contention { key, attempt, delay } => {
                write!(f, "Contention({key}, attempt=#{attempt}, delay={delay:?})")
            }
            LimiterEvent::ContentionExhausted { key, attempts } => {
                write!(f, "ContentionExhausted({key}, attempts={attempts})")
            }
            LimiterEvent::StoreFailure { key, operation } => {
                write!(f, "StoreFailure({key}, op={operation})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys_only() {
        assert_eq!(mask_key("api_123456789"), "api_12…");
        assert_eq!(mask_key("api_1"), "api_1");
        assert_eq!(mask_key("api_12"), "api_12");
        assert_eq!(mask_key("ключ_ключ"), "ключ_к…");
    }

    #[test]
    fn display_and_kind() {
        let event = LimiterEvent::Denied {
            key: "api_ab…".into(),
            reason: DenialReason::RateLimitExceeded,
            current: 10,
            limit: 10,
        };
        assert_eq!(event.kind(), "denied");
        assert_eq!(event.key(), "api_ab…");
        assert_eq!(event.to_string(), "Denied(api_ab…, Rate limit exceeded, 10/10)");

        let event = LimiterEvent::StoreFailure { key: "k".into(), operation: StoreOperation::Read };
        assert_eq!(event.to_string(), "StoreFailure(k, op=read)");
    }

    #[test]
    fn contention_display_includes_attempt() {
        let event = LimiterEvent::Contention {
            key: "api_ab…".into(),
            attempt: 2,
            delay: Duration::from_millis(5),
        };
        assert_eq!(event.kind(), "contention");
        assert!(event.to_string().contains("attempt=#2"));
    }
}
