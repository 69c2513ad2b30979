//! # Prometheus Metrics
//!
//! Everything lives under the `knative_lambda` namespace with a small,
//! closed set of subsystems. Label values come from closed sets (phases,
//! error kinds, runtimes, results); free-form error text never becomes a
//! label.
//!
//! The `function_*` RED family is registered so dashboards and alert rules
//! can bind to stable names, but it is an extension point: populating it
//! requires a response-event subscription that is not part of the operator
//! core.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

use crate::ErrorKind;

lazy_static! {
    pub static ref RECONCILE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "knative_lambda_operator_reconcile_total",
        "Reconcile passes by phase and result",
        &["phase", "result"]
    )
    .unwrap();

    pub static ref RECONCILE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "knative_lambda_operator_reconcile_duration_seconds",
        "Reconcile wall-clock by phase",
        &["phase"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "knative_lambda_operator_errors_total",
        "Operator errors by component and kind",
        &["component", "error_type"]
    )
    .unwrap();

    pub static ref WORKQUEUE_DEPTH: IntGauge = register_int_gauge!(
        "knative_lambda_operator_workqueue_depth",
        "Reconciles in flight plus scheduled retries"
    )
    .unwrap();

    pub static ref BUILD_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "knative_lambda_operator_build_duration_seconds",
        "Build job wall-clock by runtime and result",
        &["runtime", "result"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0]
    )
    .unwrap();

    pub static ref BUILD_JOBS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        "knative_lambda_operator_build_jobs_active",
        "Build jobs currently running",
        &["namespace"]
    )
    .unwrap();

    pub static ref LAMBDAFUNCTIONS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "knative_lambda_operator_lambdafunctions_total",
        "Observed functions by namespace and phase",
        &["namespace", "phase"]
    )
    .unwrap();

    pub static ref CONFIGMAP_SIZE_LIMIT_TOTAL: IntCounter = register_int_counter!(
        "knative_lambda_operator_configmap_size_limit_total",
        "Context archives refused by the inline backend for size"
    )
    .unwrap();

    // Function RED family (extension point; see module docs).
    pub static ref FUNCTION_INVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "knative_lambda_function_invocations_total",
        "Function invocations",
        &["namespace", "function"]
    )
    .unwrap();

    pub static ref FUNCTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "knative_lambda_function_duration_seconds",
        "Function invocation latency",
        &["namespace", "function"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref FUNCTION_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "knative_lambda_function_errors_total",
        "Function invocation errors",
        &["namespace", "function"]
    )
    .unwrap();

    pub static ref FUNCTION_COLD_STARTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "knative_lambda_function_cold_starts_total",
        "Function cold starts",
        &["namespace", "function"]
    )
    .unwrap();
}

/// Count an error against its component; the label is the taxonomy kind.
pub fn record_error(component: &str, kind: ErrorKind) {
    ERRORS_TOTAL
        .with_label_values(&[component, kind.as_str()])
        .inc();
}

/// Count a reconcile pass and observe its duration.
pub fn record_reconcile(phase: &str, result: &str, seconds: f64) {
    RECONCILE_TOTAL.with_label_values(&[phase, result]).inc();
    RECONCILE_DURATION_SECONDS
        .with_label_values(&[phase])
        .observe(seconds);
}

/// Observe a finished build.
pub fn record_build(runtime: &str, result: &str, seconds: f64) {
    BUILD_DURATION_SECONDS
        .with_label_values(&[runtime, result])
        .observe(seconds);
}

/// Render the default registry in the Prometheus text format.
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("metrics encoding failed: {err}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
