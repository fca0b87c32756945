use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "metasearch_scheduler";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref TASK_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_task_executions_total"), "Total task executions by outcome"),
        &["task_id", "outcome"]
    ).expect("Failed to create task_executions_total metric");

    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_duration_seconds"),
            "Task execution duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 7200.0]),
        &["task_id"]
    ).expect("Failed to create task_duration_seconds metric");

    pub static ref TASK_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_task_running"), "Whether a task is currently running (1) or not (0)"),
        &["task_id"]
    ).expect("Failed to create task_running metric");

    pub static ref TASK_FAILURE_NOTIFICATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_task_failure_notifications_total"),
            "Failure notifications raised after exhausted retries"
        ),
        &["task_id"]
    ).expect("Failed to create task_failure_notifications_total metric");

    pub static ref TASK_SKIPPED_OCCURRENCES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_task_skipped_occurrences_total"),
            "Missed occurrences dropped because they were older than the catch-up window"
        ),
        &["task_id"]
    ).expect("Failed to create task_skipped_occurrences_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(TASK_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASK_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(TASK_FAILURE_NOTIFICATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_SKIPPED_OCCURRENCES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished task execution
pub fn record_task_execution(task_id: &str, outcome: &str, duration: Duration) {
    TASK_EXECUTIONS_TOTAL
        .with_label_values(&[task_id, outcome])
        .inc();

    TASK_DURATION_SECONDS
        .with_label_values(&[task_id])
        .observe(duration.as_secs_f64());
}

pub fn set_task_running(task_id: &str, running: bool) {
    TASK_RUNNING
        .with_label_values(&[task_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_failure_notification(task_id: &str) {
    TASK_FAILURE_NOTIFICATIONS_TOTAL
        .with_label_values(&[task_id])
        .inc();
}

pub fn record_skipped_occurrence(task_id: &str) {
    TASK_SKIPPED_OCCURRENCES_TOTAL
        .with_label_values(&[task_id])
        .inc();
}

/// Text exposition of all registered metrics
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
