#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # keyquota
//!
//! Per-key API usage accounting for async Rust.
//!
//! Every API key carries a quota (`usage_limit`) that refills on a calendar window
//! (hourly, daily, weekly, monthly or yearly). This crate validates keys, spends quota with
//! optimistic concurrency against any [`KeyStore`], and shapes the outcome into rate-limit
//! headers and denial bodies.
//!
//! ## Features
//!
//! - **Key validation**: prefix check, existence, and permission sets
//! - **Usage accounting**: compare-and-swap increments that never overshoot the limit under
//!   concurrent load, with bounded retries
//! - **Calendar windows**: lazy resets, with month and year arithmetic clamped to real dates
//! - **Response shaping**: `X-RateLimit-*` headers and a JSON denial body with `retryAfter`
//! - **Tower integration**: [`ApiKeyLayer`] gates any service and telemetry sinks are services
//! - **Live configuration** through [`DynamicConfig`]
//!
//! ## Quick Start
//!
//! ```rust
//! use keyquota::{ApiKeyRecord, InMemoryKeyStore, RateLimitWindow, UsageLimiter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = InMemoryKeyStore::new();
//! store.insert(
//!     ApiKeyRecord::new("api_7f3a")
//!         .with_usage_limit(2)
//!         .with_window(RateLimitWindow::Daily)
//!         .with_permissions(["read"]),
//! );
//!
//! let limiter = UsageLimiter::new(store);
//! limiter.validate_key("api_7f3a", &["read"]).await.unwrap();
//!
//! assert!(limiter.check_and_increment_usage("api_7f3a", 1).await.allowed);
//! assert!(limiter.check_and_increment_usage("api_7f3a", 1).await.allowed);
//!
//! let denied = limiter.check_and_increment_usage("api_7f3a", 1).await;
//! assert!(!denied.allowed);
//! let shaped = limiter.shape_response(&denied.rate_limit_info, 429);
//! assert_eq!(shaped.headers.remaining, "0");
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod record;
pub mod response;
pub mod sleeper;
pub mod store;
pub mod telemetry;
pub mod validator;
pub mod window;

// Re-exports
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DynamicConfig, LimiterConfig, LimiterConfigBuilder};
pub use error::{ConfigError, KeyError};
pub use limiter::{DenialReason, RateLimitInfo, UsageDecision, UsageLimiter};
pub use middleware::{ApiKeyLayer, ApiKeyRequest, ApiKeyService, GateError, Metered};
pub use record::{ApiKeyRecord, Permissions, UsageGuard, UsageUpdate};
pub use response::{DenialBody, DenialInfo, RateLimitHeaders, RateLimitResponse};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{InMemoryKeyStore, KeyStore, StoreError};
pub use validator::KeyValidator;
pub use window::{RateLimitWindow, UnknownWindow};
