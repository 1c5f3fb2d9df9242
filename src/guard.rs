//! Request-boundary adapter between axum and the [`RateLimiter`].
//!
//! The guard always resolves to admit or reject. Store failures are logged
//! and the request is admitted, so an unreachable backend never takes the
//! protected service down with it.

use axum::{
    extract::{Request, State},
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

use crate::{
    error::Result,
    limiter::{RateLimiter, Verdict},
    metrics::Metrics,
};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Body of a 429 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub error: String,
    pub retry_after: u64,
}

impl Rejection {
    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "Too many requests".to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let retry_after = HeaderValue::from(self.retry_after);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();
        response.headers_mut().insert(RETRY_AFTER, retry_after);
        response
    }
}

/// What the guard decided for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit { limit: u64, remaining: u64 },
    /// The store failed; admitted without accounting
    FailOpen,
    Reject(Rejection),
}

/// Shared handle to the process's limiter plus its metrics
#[derive(Clone)]
pub struct AdmissionGuard {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl AdmissionGuard {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<Metrics>) -> Self {
        Self { limiter, metrics }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decide for one request. Never fails.
    pub fn admit(&self, request: &Request) -> impl Future<Output = Admission> + Send + '_ {
        let check = self.limiter.check(request);
        async move {
            let timer = self.metrics.start_check_timer();
            let result = check.await;
            drop(timer);
            self.settle(result)
        }
    }

    fn settle(&self, result: Result<Verdict>) -> Admission {
        match result {
            Ok(verdict) if verdict.allowed => {
                self.metrics.record_admitted();
                Admission::Admit {
                    limit: self.limiter.policy().max_hits(),
                    remaining: verdict.remaining,
                }
            }
            Ok(verdict) => {
                self.metrics.record_rejected();
                debug!("Rejecting request, retry after {}s", verdict.retry_after_secs);
                Admission::Reject(Rejection::new(verdict.retry_after_secs))
            }
            Err(e) => {
                self.metrics.record_fail_open();
                warn!("Rate limit check failed, admitting request: {}", e);
                Admission::FailOpen
            }
        }
    }
}

/// Axum middleware: `next` admits, a written 429 rejects.
///
/// Install with `axum::middleware::from_fn_with_state(guard, admission_guard)`.
pub async fn admission_guard(
    State(guard): State<AdmissionGuard>,
    request: Request,
    next: Next,
) -> Response {
    match guard.admit(&request).await {
        Admission::Admit { limit, remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        Admission::FailOpen => next.run(request).await,
        Admission::Reject(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CounterStore, LocalCounterStore, RateRecord},
        error::{RateLimitError, Result},
        identity::IdentityExtractor,
        limiter::Policy,
        utils::{Clock, ManualClock},
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use std::time::Duration;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<RateRecord> {
            Err(RateLimitError::BackendUnavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Err(RateLimitError::BackendUnavailable("connection refused".to_string()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(RateLimitError::BackendUnavailable("connection refused".to_string()))
        }

        fn backend(&self) -> &'static str {
            "unreachable"
        }
    }

    fn guard_with(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> AdmissionGuard {
        let limiter = RateLimiter::new(
            Policy::new(3000, 2).unwrap(),
            IdentityExtractor::default(),
            store,
            clock,
        );
        AdmissionGuard::new(Arc::new(limiter), Arc::new(Metrics::new().unwrap()))
    }

    fn request_from(ip: &str) -> Request {
        http::Request::builder()
            .uri("/test")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_rejection_payload_shape() {
        let body = serde_json::to_value(Rejection::new(3)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"error": "Too many requests", "retryAfter": 3})
        );
    }

    #[test]
    fn test_rejection_response_status_and_header() {
        let response = Rejection::new(2).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
    }

    #[tokio::test]
    async fn test_admit_then_reject() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let guard = guard_with(Arc::new(LocalCounterStore::new(clock.clone())), clock);

        assert_eq!(
            guard.admit(&request_from("10.0.0.1")).await,
            Admission::Admit { limit: 2, remaining: 1 }
        );
        assert_eq!(
            guard.admit(&request_from("10.0.0.1")).await,
            Admission::Admit { limit: 2, remaining: 0 }
        );
        assert_eq!(
            guard.admit(&request_from("10.0.0.1")).await,
            Admission::Reject(Rejection::new(3))
        );
        assert_eq!(guard.metrics().requests_with_outcome("rejected"), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let guard = guard_with(Arc::new(UnreachableStore), Arc::new(ManualClock::new(0)));

        for _ in 0..5 {
            assert_eq!(guard.admit(&request_from("10.0.0.1")).await, Admission::FailOpen);
        }
        assert_eq!(guard.metrics().requests_with_outcome("fail_open"), 5);
    }
}
