//! Prometheus metrics for the coordination runtime.
//!
//! Metrics cover component lifecycle, session state transitions, proxy
//! retries, and keepalive traffic.
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "conclave"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully: if a
//! metric fails to register, a detached fallback metric is used instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts};
use tracing::warn;

/// Custom Prometheus registry for runtime metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("conclave".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels)
        .unwrap_or_else(|e| panic!("bad metric definition {}: {}", name, e));
    if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

fn register_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels)
        .unwrap_or_else(|e| panic!("bad metric definition {}: {}", name, e));
    if let Err(e) = REGISTRY.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    gauge
}

/// Component lifecycle transitions, labeled by component and transition.
pub static LIFECYCLE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "lifecycle_transitions_total",
        "Component open/close transitions",
        &["component", "transition"],
    )
});

/// Proxy retry attempts, labeled by outcome (attempt, exhausted, success).
pub static PROXY_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "proxy_retries_total",
        "Retrying proxy attempts by outcome",
        &["outcome"],
    )
});

/// Sessions per state, labeled by state name.
pub static SESSION_STATES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_gauge_vec(
        "sessions",
        "Number of sessions per lifecycle state",
        &["state"],
    )
});

/// Keepalives sent, labeled by result (ok, failed).
pub static KEEPALIVES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec("keepalives_total", "Session keepalives sent", &["result"])
});

/// Errors surfaced to callers, labeled by error kind.
pub static ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "errors_total",
        "Errors surfaced to callers by kind",
        &["kind"],
    )
});

/// Record a lifecycle transition for a component.
pub fn record_lifecycle(component: &str, transition: &str) {
    LIFECYCLE_TRANSITIONS
        .with_label_values(&[component, transition])
        .inc();
}

/// Render all runtime metrics in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counter_increments() {
        let before = LIFECYCLE_TRANSITIONS
            .with_label_values(&["membership", "open"])
            .get();
        record_lifecycle("membership", "open");
        let after = LIFECYCLE_TRANSITIONS
            .with_label_values(&["membership", "open"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn session_gauge_moves_both_directions() {
        let gauge = SESSION_STATES.with_label_values(&["open"]);
        let before = gauge.get();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), before);
    }

    #[test]
    fn gather_text_contains_registered_metrics() {
        record_lifecycle("transport", "open");
        let text = gather_text();
        assert!(text.contains("conclave_lifecycle_transitions_total"));
    }
}
