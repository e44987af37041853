//! Prometheus metrics for database connection pool
//!
//! Tracks pool size, transaction acquisition latency, and errors

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Instant;

lazy_static::lazy_static! {
    /// Database connection pool size by state (idle/active/max)
    static ref DB_POOL_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_connections",
        "Database pool connection count by state",
        &["service", "state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time to acquire a connection and open a transaction on it
    static ref DB_POOL_BEGIN_DURATION: HistogramVec = register_histogram_vec!(
        "db_pool_begin_duration_seconds",
        "Time to acquire a pooled connection and begin a transaction",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Transaction begin errors by type
    static ref DB_POOL_BEGIN_ERRORS: IntCounterVec = register_int_counter_vec!(
        "db_pool_begin_errors_total",
        "Errors acquiring a connection or beginning a transaction",
        &["service", "error_type"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Update connection pool metrics (called periodically)
pub(crate) fn update_pool_metrics(pool: &PgPool, service: &str) {
    let size = pool.size() as i64;
    let idle = pool.num_idle() as i64;
    let active = size - idle;

    DB_POOL_CONNECTIONS
        .with_label_values(&[service, "idle"])
        .set(idle);

    DB_POOL_CONNECTIONS
        .with_label_values(&[service, "active"])
        .set(active);

    DB_POOL_CONNECTIONS
        .with_label_values(&[service, "max"])
        .set(pool.options().get_max_connections() as i64);
}

/// Begin a transaction on a pooled connection and record metrics
///
/// Drop-in replacement for `pool.begin().await`. The returned transaction owns
/// its connection until it is committed, rolled back, or dropped; dropping it
/// uncommitted rolls back and returns the connection to the pool.
pub async fn begin_with_metrics(
    pool: &PgPool,
    service: &str,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let start = Instant::now();
    let result = pool.begin().await;

    DB_POOL_BEGIN_DURATION
        .with_label_values(&[service])
        .observe(start.elapsed().as_secs_f64());

    if let Err(e) = &result {
        DB_POOL_BEGIN_ERRORS
            .with_label_values(&[service, error_type(e)])
            .inc();
    }

    result
}

fn error_type(err: &sqlx::Error) -> &'static str {
    match err {
        sqlx::Error::PoolTimedOut => "timeout",
        sqlx::Error::PoolClosed => "closed",
        sqlx::Error::Io(_) => "io",
        _ => "other",
    }
}
