//! Tower middleware that gates an inner service behind key validation and usage accounting.
//!
//! Request flow:
//! 1. pull the key out of the request (missing ⇒ [`GateError::MissingKey`]);
//! 2. validate format, existence and permissions (failure ⇒ [`GateError::Rejected`]);
//! 3. spend [`ApiKeyRequest::usage_cost`] units (denial ⇒ [`GateError::RateLimited`] carrying a
//!    shaped response);
//! 4. call the inner service and attach the rate-limit headers to its response.
//!
//! Usage is spent before the inner service runs, so a failing inner call still counts.

use crate::error::KeyError;
use crate::limiter::{RateLimitInfo, UsageLimiter};
use crate::record::ApiKeyRecord;
use crate::response::{RateLimitHeaders, RateLimitResponse};
use crate::store::KeyStore;
use crate::telemetry::TelemetrySink;
use crate::validator::DEFAULT_REQUIRED_PERMISSIONS;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Requests that carry an API key.
pub trait ApiKeyRequest {
    /// The raw key, if the caller sent one.
    fn api_key(&self) -> Option<&str>;

    /// Units of quota this request consumes.
    fn usage_cost(&self) -> u64 {
        1
    }
}

/// Inner response plus the accounting that admitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct Metered<T> {
    pub response: T,
    pub headers: RateLimitHeaders,
    pub rate_limit_info: RateLimitInfo,
    pub record: Option<ApiKeyRecord>,
}

/// Why the gate did not produce an inner response.
#[derive(Debug, Error)]
pub enum GateError<E> {
    /// The request carried no key.
    #[error("API key is required")]
    MissingKey,
    /// Validation refused the key.
    #[error(transparent)]
    Rejected(KeyError),
    /// Accounting denied the request; the payload is ready to send.
    #[error("request denied with status {}", .0.status)]
    RateLimited(RateLimitResponse),
    /// The inner service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> GateError<E> {
    /// Status to answer with, or `None` for inner failures.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GateError::MissingKey => Some(400),
            GateError::Rejected(e) => Some(e.status_code()),
            GateError::RateLimited(shaped) => Some(shaped.status),
            GateError::Inner(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GateError::RateLimited(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            GateError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that gates requests through a [`UsageLimiter`].
#[derive(Debug)]
pub struct ApiKeyLayer<St, Sk> {
    limiter: Arc<UsageLimiter<St, Sk>>,
    required: Arc<[String]>,
}

impl<St, Sk> Clone for ApiKeyLayer<St, Sk> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), required: self.required.clone() }
    }
}

impl<St, Sk> ApiKeyLayer<St, Sk> {
    /// Gate requiring the `read` permission.
    pub fn new(limiter: Arc<UsageLimiter<St, Sk>>) -> Self {
        Self {
            limiter,
            required: DEFAULT_REQUIRED_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Replace the permissions every request must hold.
    pub fn require<I, P>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.required = permissions.into_iter().map(Into::into).collect();
        self
    }
}

impl<S, St, Sk> Layer<S> for ApiKeyLayer<St, Sk> {
    type Service = ApiKeyService<S, St, Sk>;

    fn layer(&self, service: S) -> Self::Service {
        ApiKeyService {
            inner: service,
            limiter: self.limiter.clone(),
            required: self.required.clone(),
        }
    }
}

/// Middleware service produced by [`ApiKeyLayer`].
#[derive(Debug)]
pub struct ApiKeyService<S, St, Sk> {
    inner: S,
    limiter: Arc<UsageLimiter<St, Sk>>,
    required: Arc<[String]>,
}

impl<S: Clone, St, Sk> Clone for ApiKeyService<S, St, Sk> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            required: self.required.clone(),
        }
    }
}

impl<S, St, Sk, Req> Service<Req> for ApiKeyService<S, St, Sk>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    St: KeyStore + 'static,
    Sk: TelemetrySink,
    Sk::Future: Send + 'static,
    Req: ApiKeyRequest + Send + 'static,
{
    type Response = Metered<S::Response>;
    type Error = GateError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let required = self.required.clone();
        // The readied service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let key = match req.api_key() {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => return Box::pin(async { Err(GateError::MissingKey) }),
        };
        let cost = req.usage_cost();

        Box::pin(async move {
            limiter.validate_key(&key, &required[..]).await.map_err(GateError::Rejected)?;

            let decision = limiter.check_and_increment_usage(&key, cost).await;
            if !decision.allowed {
                let status = decision.denial_reason().map(|r| r.status_code()).unwrap_or(429);
                return Err(GateError::RateLimited(
                    limiter.shape_response(&decision.rate_limit_info, status),
                ));
            }

            let headers = limiter.shape_response(&decision.rate_limit_info, 200).headers;
            let response = inner.call(req).await.map_err(GateError::Inner)?;
            Ok(Metered {
                response,
                headers,
                rate_limit_info: decision.rate_limit_info,
                record: decision.record,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryKeyStore;
    use crate::telemetry::NullSink;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::convert::Infallible;
    use futures::future::{ready, Ready};
    use tower::service_fn;
    use tower::util::ServiceFn;
    use tower::ServiceExt;

    struct Summarize {
        key: Option<String>,
        cost: u64,
    }

    impl ApiKeyRequest for Summarize {
        fn api_key(&self) -> Option<&str> {
            self.key.as_deref()
        }

        fn usage_cost(&self) -> u64 {
            self.cost
        }
    }

    fn req(key: Option<&str>) -> Summarize {
        Summarize { key: key.map(str::to_owned), cost: 1 }
    }

    fn gate(limit: u64) -> ApiKeyLayer<InMemoryKeyStore, NullSink> {
        let now = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let store = InMemoryKeyStore::new();
        store.insert(
            ApiKeyRecord::new("api_gate")
                .with_usage_limit(limit)
                .with_permissions(["read"])
                .with_reset_at(now + TimeDelta::days(3)),
        );
        store.insert(ApiKeyRecord::new("api_noperm").with_reset_at(now + TimeDelta::days(3)));
        ApiKeyLayer::new(Arc::new(UsageLimiter::new(store).with_clock(ManualClock::new(now))))
    }

    type Echo = ServiceFn<fn(Summarize) -> Ready<Result<&'static str, Infallible>>>;

    fn echo() -> Echo {
        service_fn(|_req| ready(Ok("summary")))
    }

    #[tokio::test]
    async fn admitted_request_carries_headers() {
        let svc = gate(2).layer(echo());
        let metered = svc.oneshot(req(Some("api_gate"))).await.unwrap();
        assert_eq!(metered.response, "summary");
        assert_eq!(metered.headers.remaining, "1");
        assert_eq!(metered.rate_limit_info.current, 1);
    }

    #[tokio::test]
    async fn missing_key_is_400() {
        let err = gate(2).layer(echo()).oneshot(req(None)).await.unwrap_err();
        assert!(matches!(err, GateError::MissingKey));
        assert_eq!(err.status_code(), Some(400));
        let err = gate(2).layer(echo()).oneshot(req(Some(""))).await.unwrap_err();
        assert!(matches!(err, GateError::MissingKey));
    }

    #[tokio::test]
    async fn validation_failures_map_to_401_and_403() {
        let layer = gate(2);
        let err = layer.layer(echo()).oneshot(req(Some("bad_key"))).await.unwrap_err();
        assert_eq!(err.status_code(), Some(401));
        let err = layer.layer(echo()).oneshot(req(Some("api_unknown"))).await.unwrap_err();
        assert_eq!(err.status_code(), Some(401));
        let err = layer.layer(echo()).oneshot(req(Some("api_noperm"))).await.unwrap_err();
        assert_eq!(err.status_code(), Some(403));
    }

    #[tokio::test]
    async fn exhausted_quota_is_429_with_body() {
        let layer = gate(1);
        layer.layer(echo()).oneshot(req(Some("api_gate"))).await.unwrap();
        let err = layer.layer(echo()).oneshot(req(Some("api_gate"))).await.unwrap_err();
        assert!(err.is_rate_limited());
        match err {
            GateError::RateLimited(shaped) => {
                assert_eq!(shaped.status, 429);
                let body = shaped.body.expect("denial body");
                assert_eq!(body.error, "Rate limit exceeded");
                assert_eq!(body.rate_limit_info.retry_after, 3 * 24 * 3600);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_permissions_and_cost() {
        let layer = gate(10).require(["read", "write"]);
        let err = layer.layer(echo()).oneshot(req(Some("api_gate"))).await.unwrap_err();
        assert_eq!(err.status_code(), Some(403));

        let layer = gate(10);
        let metered = layer
            .layer(echo())
            .oneshot(Summarize { key: Some("api_gate".into()), cost: 4 })
            .await
            .unwrap();
        assert_eq!(metered.rate_limit_info.remaining, 6);
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let failing = service_fn(|_req: Summarize| async {
            Err::<&'static str, _>(std::io::Error::new(std::io::ErrorKind::Other, "readme fetch failed"))
        });
        let err = gate(5).layer(failing).oneshot(req(Some("api_gate"))).await.unwrap_err();
        assert_eq!(err.status_code(), None);
        assert_eq!(err.to_string(), "readme fetch failed");
        assert!(err.into_inner().is_some());
    }
}
