use log::debug;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

// Use global registry for Pingora's built-in Prometheus service
static TOTAL_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("gate_total_requests", "Total HTTP requests").expect("metric creation failed")
});

static ADMITTED_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("gate_admitted_requests", "Requests admitted by the gate")
        .expect("metric creation failed")
});

static REJECTED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gate_rejected_requests", "Requests rejected by the gate"),
        &["reason"],
    )
    .expect("metric creation failed")
});

static BANS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gate_bans_total", "Suspicious payloads that banned their origin"),
        &["rule"],
    )
    .expect("metric creation failed")
});

static PERSIST_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "gate_persist_failures",
        "Failed flushes of the ban snapshot or incident log",
    )
    .expect("metric creation failed")
});

fn register<C: Collector + Clone + 'static>(collector: &C) {
    // A second collector instance in the same process finds these already
    // registered.
    if let Err(e) = prometheus::register(Box::new(collector.clone())) {
        debug!("metric registration skipped: {}", e);
    }
}

pub struct MetricsCollector {
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        // Register with default registry (used by Pingora)
        register(&*TOTAL_REQUESTS);
        register(&*ADMITTED_REQUESTS);
        register(&*REJECTED_REQUESTS);
        register(&*BANS);
        register(&*PERSIST_FAILURES);

        Self {
            registry: Arc::new(prometheus::default_registry().clone()),
        }
    }

    pub fn increment_admitted_requests(&self) {
        TOTAL_REQUESTS.inc();
        ADMITTED_REQUESTS.inc();
    }

    pub fn increment_rejected_requests(&self, reason: &str) {
        TOTAL_REQUESTS.inc();
        REJECTED_REQUESTS.with_label_values(&[reason]).inc();
    }

    pub fn increment_bans(&self, rule_id: &str) {
        BANS.with_label_values(&[rule_id]).inc();
    }

    pub fn increment_persist_failures(&self) {
        PERSIST_FAILURES.inc();
    }

    pub fn rejected_count(&self, reason: &str) -> u64 {
        REJECTED_REQUESTS.with_label_values(&[reason]).get()
    }

    pub fn ban_count(&self, rule_id: &str) -> u64 {
        BANS.with_label_values(&[rule_id]).get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
