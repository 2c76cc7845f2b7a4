use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

pub static SIGNALS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbiter_signal_accepted_total",
        "Signals that passed every validation phase"
    )
    .expect("accepted counter")
});

pub static SIGNALS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbiter_signal_rejected_total",
        "Signals terminally rejected by a validation phase"
    )
    .expect("rejected counter")
});

pub static SIGNALS_RETRIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbiter_signal_retried_total",
        "Signals left un-acked for redelivery after a transient fault"
    )
    .expect("retried counter")
});

pub static INVALID_PAYLOADS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbiter_signal_invalid_payloads_total",
        "Messages that failed JSON decoding"
    )
    .expect("invalid_payloads counter")
});

pub static DLQ_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbiter_signal_dlq_published_total",
        "Poison messages published to the dead-letter subject"
    )
    .expect("dlq_published counter")
});

pub static PIPELINE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "arbiter_signal_pipeline_latency_seconds",
        "End-to-end pipeline latency per signal",
        vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("pipeline_latency histogram")
});

pub fn inc_accepted() {
    SIGNALS_ACCEPTED.inc();
}

pub fn inc_rejected() {
    SIGNALS_REJECTED.inc();
}

pub fn inc_retried() {
    SIGNALS_RETRIED.inc();
}

pub fn inc_invalid_payloads() {
    INVALID_PAYLOADS.inc();
}

pub fn inc_dlq_published() {
    DLQ_PUBLISHED.inc();
}

pub fn observe_pipeline_latency(duration_sec: f64) {
    PIPELINE_LATENCY.observe(duration_sec);
}
