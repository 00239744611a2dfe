//! Metrics and tracing helpers
//!
//! Both halves are feature gated: `metrics` exports OpenTelemetry instruments
//! through Prometheus, `tracing` wraps lock acquisition, transactions and each
//! migration in spans. With neither feature enabled this module is empty.

#[cfg(feature = "metrics")]
pub use self::otel::{MigrationMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
        KeyValue,
    };
    use opentelemetry_prometheus::PrometheusExporter;
    use std::time::Duration;

    pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

    pub struct MigrationMetrics {
        pub exporter: PrometheusExporter,
        pub migrations_total: Counter<u64>,
        pub migration_failures_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub migration_duration: Histogram<f64>,
        pub lock_wait_duration: Histogram<f64>,
    }

    impl MigrationMetrics {
        pub fn init() -> Self {
            let exporter = opentelemetry_prometheus::exporter()
                .build()
                .expect("failed to build prometheus exporter");
            let meter = global::meter("tidemark");

            let migrations_total = meter
                .u64_counter("tidemark_migrations_total")
                .with_description("Migration scripts executed, by direction")
                .build();

            let migration_failures_total = meter
                .u64_counter("tidemark_migration_failures_total")
                .with_description("Migration scripts that failed, by direction")
                .build();

            let query_errors_total = meter
                .u64_counter("tidemark_query_errors_total")
                .with_description("Statements rejected by the database")
                .build();

            let migration_duration = meter
                .f64_histogram("tidemark_migration_duration_seconds")
                .with_description("Duration of individual migration scripts")
                .build();

            let lock_wait_duration = meter
                .f64_histogram("tidemark_lock_wait_seconds")
                .with_description("Time spent waiting for the migration advisory lock")
                .build();

            Self {
                exporter,
                migrations_total,
                migration_failures_total,
                query_errors_total,
                migration_duration,
                lock_wait_duration,
            }
        }

        pub fn record_migration(&self, direction: &'static str, elapsed: Duration) {
            let attrs = [KeyValue::new("direction", direction)];
            self.migrations_total.add(1, &attrs);
            self.migration_duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_migration_failure(&self, direction: &'static str) {
            self.migration_failures_total
                .add(1, &[KeyValue::new("direction", direction)]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_lock_wait(&self, waited: Duration) {
            self.lock_wait_duration.record(waited.as_secs_f64(), &[]);
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    const MAX_SQL_IN_SPAN: usize = 120;

    fn truncate(sql: &str) -> &str {
        match sql.char_indices().nth(MAX_SQL_IN_SPAN) {
            Some((idx, _)) => &sql[..idx],
            None => sql,
        }
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("tidemark.connect")
    }

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("tidemark.query", sql = truncate(sql.trim()))
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("tidemark.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("tidemark.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("tidemark.transaction.rollback")
    }

    pub fn acquire_lock_span(lock_id: i64) -> Span {
        info_span!("tidemark.lock.acquire", lock_id)
    }

    pub fn migration_span(direction: &'static str, version: i64, name: &str) -> Span {
        info_span!("tidemark.migration", direction, version, name)
    }
}
