//! Limiter configuration and a live-swappable handle for it.
//!
//! `LimiterConfig` is validated once, at build time. The limiter and validator read it through
//! a [`DynamicConfig`], so operators can change default ceilings or retry bounds while the
//! service is running; every call takes one snapshot and uses it throughout.
//!
//! ```rust
//! use keyquota::{Backoff, LimiterConfig};
//! use std::time::Duration;
//!
//! let cfg = LimiterConfig::builder()
//!     .default_usage_limit(500)
//!     .max_attempts(5)
//!     .backoff(Backoff::exponential(Duration::from_millis(2)).with_full_jitter())
//!     .build()
//!     .unwrap();
//! assert_eq!(cfg.key_prefix(), "api_");
//! assert_eq!(cfg.default_usage_limit(), 500);
//! ```

use crate::backoff::Backoff;
use crate::error::ConfigError;
use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Prefix every issued key carries.
pub const DEFAULT_KEY_PREFIX: &str = "api_";
/// Ceiling applied to records without a positive `usage_limit`.
pub const DEFAULT_USAGE_LIMIT: u64 = 1000;
/// Total tries (first + retries) of the optimistic accounting loop.
pub const DEFAULT_MAX_ATTEMPTS: usize = 4;

/// Validated limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    key_prefix: String,
    default_usage_limit: u64,
    max_attempts: usize,
    backoff: Backoff,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_usage_limit: DEFAULT_USAGE_LIMIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::immediate(),
        }
    }
}

impl LimiterConfig {
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::new()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn default_usage_limit(&self) -> u64 {
        self.default_usage_limit
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::EmptyKeyPrefix);
        }
        if self.default_usage_limit == 0 {
            return Err(ConfigError::InvalidUsageLimit(self.default_usage_limit));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(self.max_attempts));
        }
        Ok(())
    }
}

/// Builder for [`LimiterConfig`].
#[derive(Debug, Clone, Default)]
pub struct LimiterConfigBuilder {
    cfg: LimiterConfig,
}

impl LimiterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cfg.key_prefix = prefix.into();
        self
    }

    pub fn default_usage_limit(mut self, limit: u64) -> Self {
        self.cfg.default_usage_limit = limit;
        self
    }

    /// Total tries of the accounting loop (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.cfg.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.cfg.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
///
/// Clones share the same value. Default backend is `ArcSwap`; feature `adaptive-rwlock`
/// switches to an `RwLock`.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(value);
        }
    }
}

impl DynamicConfig<LimiterConfig> {
    /// Change the default ceiling, keeping the rest of the configuration.
    pub fn set_default_usage_limit(&self, limit: u64) -> Result<(), ConfigError> {
        let mut next = (*self.get()).clone();
        next.default_usage_limit = limit;
        next.validate()?;
        self.set(next);
        Ok(())
    }

    /// Change the retry bound, keeping the rest of the configuration.
    pub fn set_max_attempts(&self, attempts: usize) -> Result<(), ConfigError> {
        let mut next = (*self.get()).clone();
        next.max_attempts = attempts;
        next.validate()?;
        self.set(next);
        Ok(())
    }
}
