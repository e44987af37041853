//! Prometheus metrics for bulk jobs
//!
//! Registered in the default registry alongside the db-pool metrics and
//! served as Prometheus text on `GET /metrics`.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use std::future::Future;
use std::net::SocketAddr;

use crate::models::JobKind;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use tracing::info;

lazy_static! {
    /// Jobs handled (labels: job_type, status=completed|retrying|dead_lettered)
    pub static ref JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "user_ops_jobs_total",
        "Total number of bulk jobs handled",
        &["job_type", "status"]
    )
    .expect("Failed to register metric");

    /// Job handling duration in seconds (labels: job_type)
    pub static ref JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "user_ops_job_duration_seconds",
        "Time spent handling a bulk job, including commit",
        &["job_type"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register metric");

    /// Records committed (labels: job_type)
    pub static ref RECORDS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "user_ops_records_processed_total",
        "Records submitted by successfully committed jobs",
        &["job_type"]
    )
    .expect("Failed to register metric");

    /// Chunk statements executed (labels: operation=insert|update)
    pub static ref CHUNK_STATEMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "user_ops_chunk_statements_total",
        "Multi-row statements executed, committed or not",
        &["operation"]
    )
    .expect("Failed to register metric");

    /// Cache invalidations that failed after retries
    pub static ref CACHE_INVALIDATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "user_ops_cache_invalidation_failures_total",
        "Post-commit cache invalidations that failed"
    )
    .expect("Failed to register metric");
}

/// Bounded `job_type` label; unrecognized names share `unknown`
pub fn job_type_label(name: &str) -> &'static str {
    name.parse::<JobKind>()
        .map(|kind| kind.as_str())
        .unwrap_or("unknown")
}

pub fn record_job_completed(job_type: &str, processed: usize, elapsed_secs: f64) {
    JOBS_TOTAL.with_label_values(&[job_type, "completed"]).inc();
    RECORDS_PROCESSED_TOTAL
        .with_label_values(&[job_type])
        .inc_by(processed as u64);
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(elapsed_secs);
}

/// `status` is the queue's disposition label
pub fn record_job_failed(job_type: &str, status: &str, elapsed_secs: f64) {
    JOBS_TOTAL.with_label_values(&[job_type, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(elapsed_secs);
}

pub fn record_chunk(operation: &str) {
    CHUNK_STATEMENTS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_invalidation_failure() {
    CACHE_INVALIDATION_FAILURES_TOTAL.inc();
}

/// Encode every metric in the default registry
pub fn render() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

pub async fn metrics_handler() -> Response {
    match render() {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` on `port` until `shutdown` resolves
pub async fn serve<F>(port: u16, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
}
