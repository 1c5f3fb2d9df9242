//! Rate Guard
//!
//! Fixed-window request throttling per caller identity. Counters live either
//! in process or in Redis; both backends apply the same window rules and stay
//! correct under concurrent requests. An axum middleware turns verdicts into
//! `429 Too Many Requests` responses and fails open when the store is down.

pub mod cache;
pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod utils;

// Re-export main types
pub use cache::{CounterStore, LocalCounterStore, RateRecord, SharedCounterStore};
pub use config::{Backend, GuardConfig};
pub use error::{RateLimitError, Result};
pub use guard::{admission_guard, AdmissionGuard, Rejection};
pub use identity::{IdentityExtractor, IdentityStrategy};
pub use limiter::{Policy, RateLimiter, Verdict};
