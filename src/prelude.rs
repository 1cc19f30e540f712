//! Convenient re-exports for common keyquota types.
pub use crate::{
    backoff::{Backoff, MAX_CONTENTION_DELAY},
    clock::{Clock, ManualClock, SystemClock},
    config::{DynamicConfig, LimiterConfig, DEFAULT_KEY_PREFIX, DEFAULT_USAGE_LIMIT},
    error::{ConfigError, KeyError},
    limiter::{DenialReason, RateLimitInfo, UsageDecision, UsageLimiter},
    middleware::{ApiKeyLayer, ApiKeyRequest, GateError, Metered},
    record::{ApiKeyRecord, Permissions, UsageGuard, UsageUpdate},
    response::{RateLimitHeaders, RateLimitResponse},
    store::{InMemoryKeyStore, KeyStore},
    telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    validator::KeyValidator,
    window::RateLimitWindow,
};
