use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

lazy_static! {
    // Decision metrics
    pub static ref DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limiter_decisions_total",
        "Total number of rate limit decisions",
        &["identity_kind", "outcome"]
    ).unwrap();

    pub static ref EVALUATION_DURATION: HistogramVec = register_histogram_vec!(
        "rate_limiter_evaluation_duration_seconds",
        "Rate limit evaluation duration in seconds",
        &["identity_kind", "outcome"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    pub static ref EVALUATION_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limiter_evaluation_errors_total",
        "Total number of evaluations that failed with an error",
        &["identity_kind"]
    ).unwrap();

    // Redis metrics
    pub static ref REDIS_DURATION: HistogramVec = register_histogram_vec!(
        "rate_limiter_redis_duration_seconds",
        "Redis command duration in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    pub static ref REDIS_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limiter_redis_errors_total",
        "Total number of Redis errors",
        &["error_type"]
    ).unwrap();

    pub static ref REDIS_SCRIPT_EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limiter_redis_script_executions_total",
        "Total number of Lua script executions",
        &["result"]
    ).unwrap();
}

/// Record a rate limit decision
pub fn record_decision(identity_kind: &str, outcome: &str, duration_secs: f64) {
    DECISIONS_TOTAL
        .with_label_values(&[identity_kind, outcome])
        .inc();

    EVALUATION_DURATION
        .with_label_values(&[identity_kind, outcome])
        .observe(duration_secs);
}

/// Record an evaluation that failed with an error
pub fn record_evaluation_error(identity_kind: &str) {
    EVALUATION_ERRORS_TOTAL
        .with_label_values(&[identity_kind])
        .inc();
}

/// Record Redis operation duration
pub fn record_redis_duration(command: &str, duration_secs: f64) {
    REDIS_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

/// Record Redis error
pub fn record_redis_error(error_type: &str) {
    REDIS_ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record script execution
pub fn record_script_execution(success: bool) {
    let result = if success { "success" } else { "error" };
    REDIS_SCRIPT_EXECUTIONS_TOTAL
        .with_label_values(&[result])
        .inc();
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_text() -> std::result::Result<String, String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
}
