use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

pub static WEBHOOK_DELIVERIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cryptopay_webhook_deliveries_total",
        "Webhook delivery attempts by outcome",
        &["result"]
    )
    .unwrap()
});

pub static PAYMENT_TRANSITIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cryptopay_payment_transitions_total",
        "Payment status transitions by target status",
        &["status"]
    )
    .unwrap()
});

pub static SWEEP_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "cryptopay_reconcile_sweep_duration_seconds",
        "Duration of a full reconciliation sweep in seconds",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]
    )
    .unwrap()
});

pub static RATE_LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cryptopay_rate_lookups_total",
        "Exchange rate lookups by the layer that answered",
        &["source"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
