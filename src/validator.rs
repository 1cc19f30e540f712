//! Cheap key checks that never touch usage.
//!
//! Validation runs before accounting: a malformed key is refused without a store round trip,
//! an unknown key is refused with the same message a bad credential gets, and a known key
//! must grant every required permission.

use crate::config::{DynamicConfig, LimiterConfig};
use crate::error::KeyError;
use crate::record::ApiKeyRecord;
use crate::store::KeyStore;
use crate::telemetry::mask_key;
use std::sync::Arc;

/// Permissions required when the caller does not name any.
pub const DEFAULT_REQUIRED_PERMISSIONS: [&str; 1] = ["read"];

/// Validates key format, existence and permissions. Performs reads only.
#[derive(Debug)]
pub struct KeyValidator<St> {
    store: Arc<St>,
    config: DynamicConfig<LimiterConfig>,
}

impl<St> Clone for KeyValidator<St> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), config: self.config.clone() }
    }
}

impl<St> KeyValidator<St>
where
    St: KeyStore,
{
    /// Validator with the default configuration.
    pub fn new(store: St) -> Self {
        Self::from_shared(Arc::new(store), DynamicConfig::new(LimiterConfig::default()))
    }

    /// Validator sharing a store and configuration handle with other components.
    pub fn from_shared(store: Arc<St>, config: DynamicConfig<LimiterConfig>) -> Self {
        Self { store, config }
    }

    /// Fail fast if `key` does not carry the configured prefix.
    pub fn check_format(&self, key: &str) -> Result<(), KeyError> {
        let cfg = self.config.get();
        if key.is_empty() || !key.starts_with(cfg.key_prefix()) {
            return Err(KeyError::Format { prefix: cfg.key_prefix().to_string() });
        }
        Ok(())
    }

    /// Check format, existence and permissions, returning the stored record.
    pub async fn validate_key<P>(&self, key: &str, required: &[P]) -> Result<ApiKeyRecord, KeyError>
    where
        P: AsRef<str>,
    {
        self.check_format(key)?;

        let record = match self.store.read_by_key(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(KeyError::NotFound),
            Err(e) => {
                tracing::error!(key = %mask_key(key), error = %e, "key validation read failed");
                return Err(KeyError::Service(e.to_string()));
            }
        };

        if !record.permissions.satisfies(required) {
            tracing::debug!(key = %mask_key(key), "key lacks required permissions");
            return Err(KeyError::Permission {
                required: required.iter().map(|p| p.as_ref().to_string()).collect(),
                record: Box::new(record),
            });
        }

        Ok(record)
    }

    /// [`validate_key`](Self::validate_key) requiring only `read`.
    pub async fn validate_key_default(&self, key: &str) -> Result<ApiKeyRecord, KeyError> {
        self.validate_key(key, &DEFAULT_REQUIRED_PERMISSIONS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyStore;

    fn validator_with(records: Vec<ApiKeyRecord>) -> KeyValidator<InMemoryKeyStore> {
        let store = InMemoryKeyStore::new();
        for r in records {
            store.insert(r);
        }
        KeyValidator::new(store)
    }

    #[tokio::test]
    async fn rejects_bad_prefix_before_lookup() {
        let v = validator_with(vec![ApiKeyRecord::new("sk_live")]);
        let err = v.validate_key_default("sk_live").await.unwrap_err();
        assert!(matches!(err, KeyError::Format { .. }));
        assert!(matches!(v.validate_key_default("").await, Err(KeyError::Format { .. })));
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let v = validator_with(vec![]);
        assert_eq!(v.validate_key_default("api_nope").await, Err(KeyError::NotFound));
    }

    #[tokio::test]
    async fn permissions_must_be_superset() {
        let v = validator_with(vec![ApiKeyRecord::new("api_rw").with_permissions(["read", "write"])]);
        assert!(v.validate_key("api_rw", &["read", "write"]).await.is_ok());
        let err = v.validate_key("api_rw", &["read", "delete"]).await.unwrap_err();
        match err {
            KeyError::Permission { required, record } => {
                assert_eq!(required, vec!["read".to_string(), "delete".to_string()]);
                assert_eq!(record.key, "api_rw");
            }
            other => panic!("expected permission error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_requirement_only_needs_existence() {
        let v = validator_with(vec![ApiKeyRecord::new("api_bare")]);
        let none: [&str; 0] = [];
        assert!(v.validate_key("api_bare", &none).await.is_ok());
        assert!(matches!(v.validate_key_default("api_bare").await, Err(KeyError::Permission { .. })));
    }

    #[tokio::test]
    async fn prefix_follows_live_config() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.insert(ApiKeyRecord::new("sk_1").with_permissions(["read"]));
        let config = DynamicConfig::new(LimiterConfig::default());
        let v = KeyValidator::from_shared(store, config.clone());
        assert!(v.check_format("sk_1").is_err());
        config.set(LimiterConfig::builder().key_prefix("sk_").build().unwrap());
        assert!(v.validate_key_default("sk_1").await.is_ok());
    }
}
