//! Accounting windows and the boundary calculator.
//!
//! A window reset always computes the next boundary from "now", never from the stale boundary,
//! so a key that sat idle for three hours on an hourly window gets a fresh hour starting at the
//! request that noticed the expiry.
//!
//! Calendar arithmetic for `Monthly`/`Yearly` uses [`chrono::Months`]: when the target month is
//! shorter, the day clamps to the last day of that month (Jan 31 + 1 month = Feb 28, or Feb 29
//! in a leap year).
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use keyquota::RateLimitWindow;
//!
//! let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
//! let next = RateLimitWindow::Monthly.next_reset(now);
//! assert_eq!(next, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
//! ```

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Period over which `usage` accumulates before it is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitWindow {
    Hourly,
    Daily,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl RateLimitWindow {
    /// All window kinds, shortest first.
    pub const ALL: [RateLimitWindow; 5] = [
        RateLimitWindow::Hourly,
        RateLimitWindow::Daily,
        RateLimitWindow::Weekly,
        RateLimitWindow::Monthly,
        RateLimitWindow::Yearly,
    ];

    /// Lowercase label as stored in the key table.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitWindow::Hourly => "hourly",
            RateLimitWindow::Daily => "daily",
            RateLimitWindow::Weekly => "weekly",
            RateLimitWindow::Monthly => "monthly",
            RateLimitWindow::Yearly => "yearly",
        }
    }

    /// Parse a stored label, falling back to `Monthly` for anything unrecognized.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }

    /// End of the window that starts at `now`.
    ///
    /// Saturates at [`DateTime::<Utc>::MAX_UTC`] if the arithmetic would leave chrono's range.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            RateLimitWindow::Hourly => now.checked_add_signed(TimeDelta::hours(1)),
            RateLimitWindow::Daily => now.checked_add_signed(TimeDelta::hours(24)),
            RateLimitWindow::Weekly => now.checked_add_signed(TimeDelta::days(7)),
            RateLimitWindow::Monthly => now.checked_add_months(Months::new(1)),
            RateLimitWindow::Yearly => now.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Returned by [`RateLimitWindow::from_str`] for labels outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWindow(pub String);

impl fmt::Display for UnknownWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown rate limit window: {:?}", self.0)
    }
}

impl std::error::Error for UnknownWindow {}

impl FromStr for RateLimitWindow {
    type Err = UnknownWindow;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(RateLimitWindow::Hourly),
            "daily" => Ok(RateLimitWindow::Daily),
            "weekly" => Ok(RateLimitWindow::Weekly),
            "monthly" => Ok(RateLimitWindow::Monthly),
            "yearly" => Ok(RateLimitWindow::Yearly),
            _ => Err(UnknownWindow(s.to_string())),
        }
    }
}

impl fmt::Display for RateLimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Rows written by other tools may carry null or free-form labels.
impl<'de> Deserialize<'de> for RateLimitWindow {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(RateLimitWindow::from_label).unwrap_or_default())
    }
}
