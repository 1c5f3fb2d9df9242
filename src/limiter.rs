use axum::extract::Request;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    cache::{CounterStore, LocalCounterStore, RateRecord, SharedCounterStore},
    config::{Backend, GuardConfig},
    error::{RateLimitError, Result},
    identity::IdentityExtractor,
    utils::{calculate_retry_after, window_millis, Clock, SystemClock},
};

/// Window length and hit budget, fixed for the lifetime of a limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    window: Duration,
    max_hits: u64,
}

impl Policy {
    pub fn new(window_ms: u64, max_hits: u64) -> Result<Self> {
        if window_ms == 0 {
            return Err(RateLimitError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if max_hits == 0 {
            return Err(RateLimitError::Config(
                "max_hits must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            window: Duration::from_millis(window_ms),
            max_hits,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_hits(&self) -> u64 {
        self.max_hits
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Seconds until the current window ends; 0 when allowed
    pub retry_after_secs: u64,
    /// Hits counted in the current window, including this one
    pub count: u64,
    pub remaining: u64,
}

/// Decides allow/deny for callers by combining an identity extractor, a
/// counter store and a policy.
///
/// One instance is meant to serve all traffic for a policy; the bootstrap
/// builds it once and hands out `Arc<RateLimiter>`.
pub struct RateLimiter {
    policy: Policy,
    extractor: IdentityExtractor,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        policy: Policy,
        extractor: IdentityExtractor,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            extractor,
            store,
            clock,
        }
    }

    /// Validate the configuration and build the selected backend.
    ///
    /// Configuration problems are reported before any connection attempt.
    pub async fn from_config(config: &GuardConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new())).await
    }

    pub async fn from_config_with_clock(config: &GuardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let policy = Policy::new(config.window_ms, config.max_hits)?;
        let extractor =
            IdentityExtractor::new(config.identity).with_session_cookie(config.session_cookie.clone());

        let store: Arc<dyn CounterStore> = match config.backend {
            Backend::Local => Arc::new(LocalCounterStore::new(clock.clone())),
            Backend::Shared => {
                let redis = config.redis.as_ref().ok_or_else(|| {
                    RateLimitError::Config(
                        "shared backend selected but no redis connection settings given".to_string(),
                    )
                })?;
                Arc::new(SharedCounterStore::connect(redis, clock.clone()).await?)
            }
        };

        info!(
            "Rate limiter ready: {} hits per {}ms, identity by {:?}, {} store",
            policy.max_hits(),
            config.window_ms,
            config.identity,
            store.backend()
        );

        Ok(Self::new(policy, extractor, store, clock))
    }

    /// Replace the identity extractor, e.g. to install a custom rule
    pub fn with_extractor(mut self, extractor: IdentityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn extractor(&self) -> &IdentityExtractor {
        &self.extractor
    }

    /// Count the request against its caller's window.
    ///
    /// The identity is derived before the returned future is polled, so the
    /// future does not borrow the request.
    pub fn check(&self, request: &Request) -> impl Future<Output = Result<Verdict>> + Send + '_ {
        let identity = self.extractor.extract(request);
        async move { self.check_key(&identity).await }
    }

    /// Count one hit against an already-derived identity
    pub async fn check_key(&self, identity: &str) -> Result<Verdict> {
        let record = self.store.increment(identity, self.policy.window).await?;
        let now_ms = self.clock.now_millis();

        if let Err(violation) = self.verify(identity, &record, now_ms) {
            warn!("{}; resetting and admitting", violation);
            if let Err(e) = self.store.reset(identity).await {
                warn!("Failed to reset corrupt record for '{}': {}", identity, e);
            }
            return Ok(Verdict {
                allowed: true,
                retry_after_secs: 0,
                count: 1,
                remaining: self.policy.max_hits - 1,
            });
        }

        let verdict = if record.count > self.policy.max_hits {
            Verdict {
                allowed: false,
                retry_after_secs: calculate_retry_after(
                    record.window_start_ms,
                    self.policy.window,
                    now_ms,
                ),
                count: record.count,
                remaining: 0,
            }
        } else {
            Verdict {
                allowed: true,
                retry_after_secs: 0,
                count: record.count,
                remaining: self.policy.max_hits - record.count,
            }
        };

        debug!(
            "identity='{}' count={} allowed={}",
            identity, verdict.count, verdict.allowed
        );
        Ok(verdict)
    }

    /// Clear an identity's window. Administrative override, not used per request.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        info!("Resetting rate limit state for '{}'", identity);
        self.store.reset(identity).await
    }

    /// Health check for the limiter
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    fn verify(&self, identity: &str, record: &RateRecord, now_ms: i64) -> Result<()> {
        let violation = |reason: String| RateLimitError::InvariantViolation {
            key: identity.to_string(),
            reason,
        };

        if record.count == 0 {
            return Err(violation("record has a count of zero".to_string()));
        }
        let ahead_ms = record.window_start_ms.saturating_sub(now_ms);
        if ahead_ms > window_millis(self.policy.window) {
            return Err(violation(format!(
                "window starts {}ms in the future",
                ahead_ms
            )));
        }
        Ok(())
    }
}
