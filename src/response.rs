//! Turning a [`RateLimitInfo`] into something a transport can send.
//!
//! Every response carries the four `X-RateLimit-*` headers. Non-2xx responses also carry a
//! JSON body with a `retryAfter` hint in whole seconds. Shaping is a pure function of
//! `(info, status, now)`, so the same inputs always produce the same headers.
//!
//! ```rust
//! use chrono::{TimeDelta, TimeZone, Utc};
//! use keyquota::{RateLimitInfo, RateLimitResponse, RateLimitWindow};
//!
//! let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
//! let info = RateLimitInfo {
//!     limit: 10,
//!     remaining: 0,
//!     reset_at: Some(now + TimeDelta::milliseconds(1500)),
//!     window: Some(RateLimitWindow::Hourly),
//!     current: 10,
//!     error: None,
//! };
//! let shaped = RateLimitResponse::new(&info, 429, now);
//! assert_eq!(shaped.headers.remaining, "0");
//! assert_eq!(shaped.body.unwrap().rate_limit_info.retry_after, 2);
//! ```

use crate::limiter::RateLimitInfo;
use crate::window::RateLimitWindow;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// `retryAfter` used when the denial carries no reset time.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 3600;

/// Error text used when a denial does not name its own.
pub const DEFAULT_DENIAL_ERROR: &str = "Rate limit exceeded";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_WINDOW: &str = "X-RateLimit-Window";

/// RFC 3339 UTC with millisecond precision, e.g. `2025-01-01T00:00:00.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_timestamp<S: Serializer>(at: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
    match at {
        Some(at) => s.serialize_str(&format_timestamp(*at)),
        None => s.serialize_none(),
    }
}

/// Whole seconds until `reset_at`, rounded up and never negative.
pub fn retry_after_secs(reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    let Some(reset_at) = reset_at else {
        return DEFAULT_RETRY_AFTER_SECS;
    };
    let remaining = reset_at.signed_duration_since(now);
    if remaining <= TimeDelta::zero() {
        return 0;
    }
    let whole = remaining.num_seconds();
    let partial = remaining > TimeDelta::seconds(whole);
    whole as u64 + u64::from(partial)
}

/// The fixed rate-limit header set, rendered as header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
    pub window: String,
}

impl RateLimitHeaders {
    pub fn new(info: &RateLimitInfo, now: DateTime<Utc>) -> Self {
        Self {
            limit: info.limit.to_string(),
            remaining: info.remaining.to_string(),
            reset: format_timestamp(info.reset_at.unwrap_or(now)),
            window: info.window.unwrap_or_default().to_string(),
        }
    }

    /// `(name, value)` pairs in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (HEADER_LIMIT, self.limit.as_str()),
            (HEADER_REMAINING, self.remaining.as_str()),
            (HEADER_RESET, self.reset.as_str()),
            (HEADER_WINDOW, self.window.as_str()),
        ]
        .into_iter()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }
}

/// Accounting details included in a denial body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialInfo {
    pub limit: u64,
    pub remaining: u64,
    #[serde(serialize_with = "serialize_timestamp")]
    pub reset_at: Option<DateTime<Utc>>,
    pub window: Option<RateLimitWindow>,
    pub retry_after: u64,
}

/// JSON body sent with a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub success: bool,
    pub error: String,
    pub rate_limit_info: DenialInfo,
}

/// Transport-ready decision: status, headers, and a body for denials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResponse {
    pub status: u16,
    pub headers: RateLimitHeaders,
    pub body: Option<DenialBody>,
}

impl RateLimitResponse {
    pub fn new(info: &RateLimitInfo, status: u16, now: DateTime<Utc>) -> Self {
        let headers = RateLimitHeaders::new(info, now);
        let body = (!(200..300).contains(&status)).then(|| DenialBody {
            success: false,
            error: info
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| DEFAULT_DENIAL_ERROR.to_string()),
            rate_limit_info: DenialInfo {
                limit: info.limit,
                remaining: info.remaining,
                reset_at: info.reset_at,
                window: info.window,
                retry_after: retry_after_secs(info.reset_at, now),
            },
        });
        Self { status, headers, body }
    }

    pub fn is_denial(&self) -> bool {
        self.body.is_some()
    }

    /// The body as JSON, if this is a denial.
    pub fn body_json(&self) -> Option<serde_json::Value> {
        self.body.as_ref().and_then(|b| serde_json::to_value(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::DenialReason;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn exceeded() -> RateLimitInfo {
        RateLimitInfo {
            limit: 10,
            remaining: 0,
            reset_at: Some(now() + TimeDelta::minutes(30)),
            window: Some(RateLimitWindow::Hourly),
            current: 10,
            error: Some(DenialReason::RateLimitExceeded),
        }
    }

    #[test]
    fn headers_always_present() {
        let shaped = RateLimitResponse::new(&exceeded(), 200, now());
        let map = shaped.headers.to_map();
        assert_eq!(map.len(), 4);
        assert_eq!(map[HEADER_LIMIT], "10");
        assert_eq!(map[HEADER_REMAINING], "0");
        assert_eq!(map[HEADER_RESET], "2025-01-01T00:30:00.000Z");
        assert_eq!(map[HEADER_WINDOW], "hourly");
        assert!(!shaped.is_denial());
    }

    #[test]
    fn missing_fields_fall_back() {
        let info = RateLimitInfo::zeroed(DenialReason::ServiceError);
        let shaped = RateLimitResponse::new(&info, 500, now());
        assert_eq!(shaped.headers.reset, "2025-01-01T00:00:00.000Z");
        assert_eq!(shaped.headers.window, "monthly");
        assert_eq!(shaped.headers.limit, "0");
        let body = shaped.body.unwrap();
        assert_eq!(body.error, "Rate limiting service error");
        assert_eq!(body.rate_limit_info.retry_after, DEFAULT_RETRY_AFTER_SECS);
    }

    #[test]
    fn denial_body_serializes_camel_case() {
        let shaped = RateLimitResponse::new(&exceeded(), 429, now());
        let json = shaped.body_json().unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Rate limit exceeded");
        assert_eq!(json["rateLimitInfo"]["retryAfter"], 1800);
        assert_eq!(json["rateLimitInfo"]["resetAt"], "2025-01-01T00:30:00.000Z");
        assert_eq!(json["rateLimitInfo"]["window"], "hourly");
    }

    #[test]
    fn unnamed_denial_uses_default_error() {
        let mut info = exceeded();
        info.error = None;
        let body = RateLimitResponse::new(&info, 429, now()).body.unwrap();
        assert_eq!(body.error, DEFAULT_DENIAL_ERROR);
    }

    #[test]
    fn retry_after_rounds_up_and_clamps() {
        assert_eq!(retry_after_secs(None, now()), 3600);
        assert_eq!(retry_after_secs(Some(now() + TimeDelta::milliseconds(1)), now()), 1);
        assert_eq!(retry_after_secs(Some(now() + TimeDelta::milliseconds(1000)), now()), 1);
        assert_eq!(retry_after_secs(Some(now() + TimeDelta::milliseconds(1001)), now()), 2);
        assert_eq!(retry_after_secs(Some(now()), now()), 0);
        assert_eq!(retry_after_secs(Some(now() - TimeDelta::hours(1)), now()), 0);
    }

    #[test]
    fn sub_millisecond_remainders_still_wait_a_second() {
        assert_eq!(retry_after_secs(Some(now() + TimeDelta::microseconds(400)), now()), 1);
        assert_eq!(retry_after_secs(Some(now() + TimeDelta::nanoseconds(1)), now()), 1);
        let just_past_two = now() + TimeDelta::seconds(2) + TimeDelta::nanoseconds(1);
        assert_eq!(retry_after_secs(Some(just_past_two), now()), 3);
        assert_eq!(retry_after_secs(Some(now() - TimeDelta::microseconds(400)), now()), 0);
    }

    #[test]
    fn shaping_is_idempotent() {
        let info = RateLimitInfo::zeroed(DenialReason::InvalidKey);
        let a = RateLimitResponse::new(&info, 401, now());
        let b = RateLimitResponse::new(&info, 401, now());
        assert_eq!(a, b);
        assert_eq!(a.headers.to_map(), b.headers.to_map());
    }
}
