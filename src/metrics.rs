// Prometheus metrics for admission control
//
// Exposes metrics on /metrics HTTP endpoint:
// - Admission decisions by mode, outcome and reason (counter)
// - Ticket releases (counter)
// - Swallowed rollback failures (counter)
// - Counter store errors by operation (counter)
// - Admission check latency (histogram)

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, Encoder, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_decisions_total", "Admission decisions"),
        &["mode", "outcome", "reason"]
    ).expect("Failed to create admission decisions metric");

    pub static ref RELEASES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_releases_total", "Ticket releases"),
        &["outcome"]
    ).expect("Failed to create admission releases metric");

    pub static ref ROLLBACK_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "admission_rollback_failures_total",
        "Best-effort counter decrements that failed"
    ).expect("Failed to create rollback failures metric");

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_store_errors_total", "Counter store failures"),
        &["op"]
    ).expect("Failed to create store errors metric");

    pub static ref CHECK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "admission_check_duration_seconds",
            "Time spent deciding admission"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["mode"]
    ).expect("Failed to create admission check duration metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RELEASES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROLLBACK_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHECK_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_metrics() {
        // May fail if another test registered first, which is fine
        let _ = init();

        DECISIONS_TOTAL
            .with_label_values(&["enforce", "denied", "user_inflight"])
            .inc();
        assert!(
            DECISIONS_TOTAL
                .with_label_values(&["enforce", "denied", "user_inflight"])
                .get()
                >= 1
        );

        let text = gather_metrics().unwrap();
        assert!(text.contains("admission_decisions_total"));
    }

    #[test]
    fn test_rollback_metric() {
        let before = ROLLBACK_FAILURES_TOTAL.get();
        ROLLBACK_FAILURES_TOTAL.inc();
        assert!(ROLLBACK_FAILURES_TOTAL.get() > before);
    }
}
