//! Rate-limited usage accounting.
//!
//! [`UsageLimiter::check_and_increment_usage`] spends `increment_by` units of a key's quota.
//! Each attempt runs the same sequence against the store:
//!
//! 1. read the row (absent ⇒ deny with [`DenialReason::InvalidKey`]);
//! 2. if the window has expired, zero the counter and open a new window from "now";
//! 3. deny with [`DenialReason::RateLimitExceeded`] if `usage + increment_by` would pass the limit;
//! 4. write the new usage with a compare-and-swap on the usage and window boundary read in
//!    step 1 (or written by the reset in step 2).
//!
//! A lost compare-and-swap (another request committed first) restarts the sequence, up to
//! `max_attempts` in total, after which the call is denied with [`DenialReason::Contention`].
//! Store errors become [`DenialReason::ServiceError`]. The operation never returns an error:
//! callers always get a [`UsageDecision`].
//!
//! The reset in step 2 is itself a compare-and-swap, so a caller holding a stale expired row
//! cannot wipe a window another caller already opened and spent from.
//!
//! Invariants, given a store whose `conditional_update` is a true compare-and-swap:
//! - committed `usage` never exceeds the effective limit of its window;
//! - committed `usage` equals the sum of `increment_by` over allowed calls in the window.
//!
//! Cancellation: dropping the future mid-retry leaves already committed writes in place. A caller
//! that cancels and then repeats a request may count it twice.
//!
//! ```rust
//! use keyquota::{ApiKeyRecord, InMemoryKeyStore, UsageLimiter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = InMemoryKeyStore::new();
//! store.insert(ApiKeyRecord::new("api_demo").with_usage_limit(10));
//! let limiter = UsageLimiter::new(store);
//!
//! let decision = limiter.check_and_increment_usage("api_demo", 1).await;
//! assert!(decision.allowed);
//! assert_eq!(decision.rate_limit_info.remaining, 9);
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{DynamicConfig, LimiterConfig};
use crate::error::KeyError;
use crate::record::{ApiKeyRecord, UsageGuard, UsageUpdate};
use crate::response::RateLimitResponse;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::KeyStore;
use crate::telemetry::{emit_best_effort, mask_key, LimiterEvent, NullSink, StoreOperation, TelemetrySink};
use crate::validator::KeyValidator;
use crate::window::RateLimitWindow;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Why a request was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// No record exists for the key.
    InvalidKey,
    /// Committing the increment would pass the window's limit.
    RateLimitExceeded,
    /// The store failed.
    ServiceError,
    /// Every attempt lost its compare-and-swap to a concurrent writer.
    Contention,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::InvalidKey => "Invalid API key",
            DenialReason::RateLimitExceeded => "Rate limit exceeded",
            DenialReason::ServiceError => "Rate limiting service error",
            DenialReason::Contention => "Rate limiting contention",
        }
    }

    /// HTTP-class status a request layer should answer a denial with.
    pub fn status_code(&self) -> u16 {
        match self {
            DenialReason::InvalidKey => 401,
            DenialReason::RateLimitExceeded => 429,
            DenialReason::ServiceError => 500,
            DenialReason::Contention => 503,
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DenialReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Per-call accounting snapshot. Computed fresh on every call, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub window: Option<RateLimitWindow>,
    pub current: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DenialReason>,
}

impl RateLimitInfo {
    /// All-zero info for denials that have no record to describe.
    pub fn zeroed(reason: DenialReason) -> Self {
        Self { limit: 0, remaining: 0, reset_at: None, window: None, current: 0, error: Some(reason) }
    }
}

/// Outcome of [`UsageLimiter::check_and_increment_usage`].
#[derive(Debug, Clone, PartialEq)]
pub struct UsageDecision {
    pub allowed: bool,
    pub rate_limit_info: RateLimitInfo,
    /// The row as last seen: post-write on success, as read on a quota denial.
    pub record: Option<ApiKeyRecord>,
}

impl UsageDecision {
    fn denied(info: RateLimitInfo, record: Option<ApiKeyRecord>) -> Self {
        Self { allowed: false, rate_limit_info: info, record }
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        self.rate_limit_info.error
    }
}

enum Attempt {
    Decided(UsageDecision),
    Conflict,
}

struct StoreFailure {
    operation: StoreOperation,
    message: String,
}

impl StoreFailure {
    fn new<E: std::error::Error>(operation: StoreOperation, error: &E) -> Self {
        Self { operation, message: error.to_string() }
    }
}

/// Spends per-key quota against a [`KeyStore`] with optimistic concurrency.
///
/// Holds no usage state of its own; every call re-reads the store. Cheap to share behind an
/// `Arc` across request handlers.
pub struct UsageLimiter<St, Sk = NullSink> {
    store: Arc<St>,
    config: DynamicConfig<LimiterConfig>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Sk,
}

impl<St, Sk> fmt::Debug for UsageLimiter<St, Sk> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageLimiter")
            .field("config", &self.config.get())
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("store", &"<store>")
            .field("sink", &"<sink>")
            .finish()
    }
}

impl<St> UsageLimiter<St, NullSink>
where
    St: KeyStore,
{
    /// Limiter with default configuration, system clock and no telemetry.
    pub fn new(store: St) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Limiter over a store that is also used elsewhere.
    pub fn from_shared(store: Arc<St>) -> Self {
        Self {
            store,
            config: DynamicConfig::new(LimiterConfig::default()),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        }
    }
}

impl<St, Sk> UsageLimiter<St, Sk>
where
    St: KeyStore,
    Sk: TelemetrySink,
    Sk::Future: Send + 'static,
{
    /// Replace the configuration.
    pub fn with_config(self, config: LimiterConfig) -> Self {
        self.with_dynamic_config(DynamicConfig::new(config))
    }

    /// Share a live configuration handle.
    pub fn with_dynamic_config(mut self, config: DynamicConfig<LimiterConfig>) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override how contention pauses are awaited.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Route events to `sink`.
    pub fn with_sink<NewSk>(self, sink: NewSk) -> UsageLimiter<St, NewSk>
    where
        NewSk: TelemetrySink,
    {
        UsageLimiter {
            store: self.store,
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            sink,
        }
    }

    /// Live configuration handle.
    pub fn config(&self) -> &DynamicConfig<LimiterConfig> {
        &self.config
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validator sharing this limiter's store and configuration.
    pub fn validator(&self) -> KeyValidator<St> {
        KeyValidator::from_shared(self.store.clone(), self.config.clone())
    }

    /// Check key format, existence and permissions. Never touches usage.
    pub async fn validate_key<P>(&self, key: &str, required: &[P]) -> Result<ApiKeyRecord, KeyError>
    where
        P: AsRef<str>,
    {
        self.validator().validate_key(key, required).await
    }

    /// Shape `info` into headers (and a denial body) using this limiter's clock.
    pub fn shape_response(&self, info: &RateLimitInfo, status: u16) -> RateLimitResponse {
        RateLimitResponse::new(info, status, self.clock.now())
    }

    /// Spend `increment_by` units of `key`'s quota, or explain why not.
    pub async fn check_and_increment_usage(&self, key: &str, increment_by: u64) -> UsageDecision {
        let cfg = self.config.get();
        let masked = mask_key(key);
        let max_attempts = cfg.max_attempts();

        for attempt in 0..max_attempts {
            match self.try_account(key, &masked, increment_by, &cfg).await {
                Ok(Attempt::Decided(decision)) => return decision,
                Ok(Attempt::Conflict) => {
                    let lost = attempt + 1;
                    if lost >= max_attempts {
                        break;
                    }
                    let delay = cfg.backoff().pause(lost);
                    tracing::warn!(key = %masked, attempt = lost, ?delay, "lost usage race, retrying");
                    self.emit(LimiterEvent::Contention { key: masked.clone(), attempt: lost, delay })
                        .await;
                    self.sleeper.sleep(delay).await;
                }
                Err(failure) => {
                    tracing::error!(
                        key = %masked,
                        op = %failure.operation,
                        error = %failure.message,
                        "key store failure during usage accounting"
                    );
                    self.emit(LimiterEvent::StoreFailure {
                        key: masked,
                        operation: failure.operation,
                    })
                    .await;
                    return UsageDecision::denied(
                        RateLimitInfo::zeroed(DenialReason::ServiceError),
                        None,
                    );
                }
            }
        }

        tracing::warn!(key = %masked, attempts = max_attempts, "usage accounting contention exhausted");
        self.emit(LimiterEvent::ContentionExhausted { key: masked, attempts: max_attempts }).await;
        UsageDecision::denied(RateLimitInfo::zeroed(DenialReason::Contention), None)
    }

    async fn try_account(
        &self,
        key: &str,
        masked: &str,
        increment_by: u64,
        cfg: &LimiterConfig,
    ) -> Result<Attempt, StoreFailure> {
        let now = self.clock.now();

        let Some(mut record) = self
            .store
            .read_by_key(key)
            .await
            .map_err(|e| StoreFailure::new(StoreOperation::Read, &e))?
        else {
            tracing::debug!(key = %masked, "usage check for unknown key");
            self.emit(LimiterEvent::Denied {
                key: masked.to_string(),
                reason: DenialReason::InvalidKey,
                current: 0,
                limit: 0,
            })
            .await;
            return Ok(Attempt::Decided(UsageDecision::denied(
                RateLimitInfo::zeroed(DenialReason::InvalidKey),
                None,
            )));
        };

        if record.window_expired(now) {
            let reset_at = record.rate_limit_window.next_reset(now);
            let reset = self
                .store
                .conditional_update(key, UsageGuard::observed(&record), UsageUpdate::reset(reset_at, now))
                .await
                .map_err(|e| StoreFailure::new(StoreOperation::ConditionalUpdate, &e))?;
            match reset {
                Some(row) => {
                    tracing::info!(
                        key = %masked,
                        window = %row.rate_limit_window,
                        reset_at = %reset_at.to_rfc3339(),
                        "usage window reset"
                    );
                    self.emit(LimiterEvent::WindowReset {
                        key: masked.to_string(),
                        window: row.rate_limit_window,
                        reset_at,
                    })
                    .await;
                    record = row;
                }
                None => return Ok(Attempt::Conflict),
            }
        }

        let limit = record.effective_limit(cfg.default_usage_limit());
        let current = record.usage;
        let prospective = current.saturating_add(increment_by);

        if prospective > limit {
            tracing::debug!(key = %masked, current, limit, increment_by, "usage limit reached");
            self.emit(LimiterEvent::Denied {
                key: masked.to_string(),
                reason: DenialReason::RateLimitExceeded,
                current,
                limit,
            })
            .await;
            let info = RateLimitInfo {
                limit,
                remaining: limit.saturating_sub(current),
                reset_at: record.rate_limit_reset_at,
                window: Some(record.rate_limit_window),
                current,
                error: Some(DenialReason::RateLimitExceeded),
            };
            return Ok(Attempt::Decided(UsageDecision::denied(info, Some(record))));
        }

        let updated = self
            .store
            .conditional_update(key, UsageGuard::observed(&record), UsageUpdate::increment(prospective, now))
            .await
            .map_err(|e| StoreFailure::new(StoreOperation::ConditionalUpdate, &e))?;
        let Some(updated) = updated else {
            return Ok(Attempt::Conflict);
        };

        let remaining = limit.saturating_sub(prospective);
        tracing::debug!(key = %masked, current = prospective, remaining, "usage committed");
        self.emit(LimiterEvent::Allowed {
            key: masked.to_string(),
            increment: increment_by,
            current: prospective,
            remaining,
        })
        .await;

        let info = RateLimitInfo {
            limit,
            remaining,
            reset_at: updated.rate_limit_reset_at,
            window: Some(updated.rate_limit_window),
            current: prospective,
            error: None,
        };
        Ok(Attempt::Decided(UsageDecision { allowed: true, rate_limit_info: info, record: Some(updated) }))
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
