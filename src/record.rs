//! The persisted API key row and the fields the limiter writes back.

use crate::window::RateLimitWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Stored state for one API key.
///
/// Rows are created and deleted by the key-management surface. The limiter only ever
/// touches `usage`, `rate_limit_reset_at` and `last_used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Opaque key string, e.g. `api_3f9c...`.
    pub key: String,
    /// Units consumed in the current window.
    #[serde(default)]
    pub usage: u64,
    /// Ceiling per window. `None` (or zero) means "use the configured default".
    #[serde(default)]
    pub usage_limit: Option<u64>,
    #[serde(default)]
    pub rate_limit_window: RateLimitWindow,
    /// End of the current window. A key without a boundary is treated as expired.
    #[serde(default)]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type", alias = "key_type")]
    pub key_type: Option<String>,
}

impl ApiKeyRecord {
    /// A fresh record with zero usage, default window and no permissions.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            usage: 0,
            usage_limit: None,
            rate_limit_window: RateLimitWindow::default(),
            rate_limit_reset_at: None,
            last_used: None,
            permissions: Permissions::default(),
            name: None,
            description: None,
            key_type: None,
        }
    }

    pub fn with_usage(mut self, usage: u64) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_usage_limit(mut self, limit: u64) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    pub fn with_window(mut self, window: RateLimitWindow) -> Self {
        self.rate_limit_window = window;
        self
    }

    pub fn with_reset_at(mut self, reset_at: DateTime<Utc>) -> Self {
        self.rate_limit_reset_at = Some(reset_at);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().collect();
        self
    }

    /// Effective ceiling: the stored limit, or `default_limit` when absent or zero.
    pub fn effective_limit(&self, default_limit: u64) -> u64 {
        match self.usage_limit {
            Some(limit) if limit > 0 => limit,
            _ => default_limit,
        }
    }

    /// Whether the current window has elapsed at `now`.
    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        match self.rate_limit_reset_at {
            Some(reset_at) => reset_at <= now,
            None => true,
        }
    }

    /// Apply a limiter write to this record in place.
    pub fn apply(&mut self, update: &UsageUpdate) {
        self.usage = update.usage;
        if let Some(reset_at) = update.rate_limit_reset_at {
            self.rate_limit_reset_at = Some(reset_at);
        }
        self.last_used = Some(update.last_used);
    }
}

/// Fields written by the limiter. `rate_limit_reset_at` is only set by window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageUpdate {
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
}

impl UsageUpdate {
    /// Zero the counter and open a new window ending at `reset_at`.
    pub fn reset(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self { usage: 0, rate_limit_reset_at: Some(reset_at), last_used: now }
    }

    /// Record `usage` as the new counter value.
    pub fn increment(usage: u64, now: DateTime<Utc>) -> Self {
        Self { usage, rate_limit_reset_at: None, last_used: now }
    }
}

/// Row state a compare-and-swap expects to find.
///
/// Both columns take part: `usage` returns to the same values after every reset, while the
/// window boundary moves forward, so the pair identifies one window's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageGuard {
    pub usage: u64,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
}

impl UsageGuard {
    /// Guard on the state the caller just read.
    pub fn observed(record: &ApiKeyRecord) -> Self {
        Self { usage: record.usage, rate_limit_reset_at: record.rate_limit_reset_at }
    }

    pub fn matches(&self, record: &ApiKeyRecord) -> bool {
        record.usage == self.usage && record.rate_limit_reset_at == self.rate_limit_reset_at
    }
}

/// Capability set granted to a key (`read`, `write`, `delete`, ...).
///
/// Deserializes from a JSON array, from a string holding a JSON array, or from anything else
/// as the empty set. A malformed column never fails the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    /// Parse a serialized permissions column. Malformed input yields the empty set.
    pub fn parse_lenient(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::default(),
        }
    }

    fn from_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(items) => {
                items.iter().filter_map(|v| v.as_str()).map(str::to_owned).collect()
            }
            serde_json::Value::String(inner) => Self::parse_lenient(inner),
            _ => Self::default(),
        }
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    /// True when every required permission is granted.
    pub fn satisfies<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|p| self.contains(p.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}
