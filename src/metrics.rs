use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Admission outcomes as recorded in `rate_guard_requests_total`
pub const OUTCOME_ADMITTED: &str = "admitted";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_FAIL_OPEN: &str = "fail_open";

/// Metrics collector for the admission guard
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    requests: CounterVec,
    store_errors: Counter,
    check_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests = CounterVec::new(
            Opts::new(
                "rate_guard_requests_total",
                "Requests seen by the admission guard, by outcome",
            ),
            &["outcome"],
        )?;

        let store_errors = Counter::new(
            "rate_guard_store_errors_total",
            "Counter store failures that caused a request to be admitted unchecked",
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "rate_guard_check_duration_seconds",
            "Duration of limiter checks in seconds",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            store_errors,
            check_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self) {
        self.requests.with_label_values(&[OUTCOME_ADMITTED]).inc();
    }

    pub fn record_rejected(&self) {
        self.requests.with_label_values(&[OUTCOME_REJECTED]).inc();
    }

    /// A store failure let the request through
    pub fn record_fail_open(&self) {
        self.requests.with_label_values(&[OUTCOME_FAIL_OPEN]).inc();
        self.store_errors.inc();
    }

    pub fn requests_with_outcome(&self, outcome: &str) -> u64 {
        self.requests.with_label_values(&[outcome]).get() as u64
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }

    /// Render all metrics in the text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_are_counted_separately() {
        let metrics = Metrics::new().unwrap();

        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_rejected();
        metrics.record_fail_open();

        assert_eq!(metrics.requests_with_outcome(OUTCOME_ADMITTED), 2);
        assert_eq!(metrics.requests_with_outcome(OUTCOME_REJECTED), 1);
        assert_eq!(metrics.requests_with_outcome(OUTCOME_FAIL_OPEN), 1);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejected();
        drop(metrics.start_check_timer());

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("rate_guard_requests_total{outcome=\"rejected\"} 1"));
        assert!(rendered.contains("rate_guard_check_duration_seconds"));
    }
}
