//! Metrics and tracing helpers.
//!
//! Counters are exported through a Prometheus registry owned by
//! [`PartitionMetrics`]; call [`PartitionMetrics::render`] to scrape them.

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{PartitionMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<PartitionMetrics> = Lazy::new(PartitionMetrics::init);

    pub struct PartitionMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        pub partitions_created: Counter<u64>,
        pub partitions_detached: Counter<u64>,
        pub partitions_dropped: Counter<u64>,
        pub lock_retries: Counter<u64>,
        pub lock_exhausted: Counter<u64>,
        pub db_calls: Counter<u64>,
        pub db_call_duration: Histogram<f64>,
    }

    impl PartitionMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let builder = SdkMeterProvider::builder();
            let builder = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => builder.with_reader(exporter),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    builder
                }
            };
            let provider = builder.build();
            let meter = provider.meter("partwarden");

            Self {
                partitions_created: meter
                    .u64_counter("partwarden_partitions_created_total")
                    .with_description("Partitions created and attached")
                    .build(),
                partitions_detached: meter
                    .u64_counter("partwarden_partitions_detached_total")
                    .with_description("Partitions detached from their parent")
                    .build(),
                partitions_dropped: meter
                    .u64_counter("partwarden_partitions_dropped_total")
                    .with_description("Detached partitions dropped")
                    .build(),
                lock_retries: meter
                    .u64_counter("partwarden_lock_retries_total")
                    .with_description("Structural changes retried after lock_timeout")
                    .build(),
                lock_exhausted: meter
                    .u64_counter("partwarden_lock_exhausted_total")
                    .with_description("Structural changes abandoned after the retry budget")
                    .build(),
                db_calls: meter
                    .u64_counter("partwarden_db_calls_total")
                    .with_description("Catalog queries and statements executed")
                    .build(),
                db_call_duration: meter
                    .f64_histogram("partwarden_db_call_duration_seconds")
                    .with_description("Duration of catalog queries and statements")
                    .build(),
                registry,
                _provider: provider,
            }
        }

        pub fn record_db_call(&self, elapsed: Duration, failed: bool) {
            self.db_calls.add(1, &[KeyValue::new("failed", failed)]);
            self.db_call_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_lock_retry(&self, operation: &'static str) {
            self.lock_retries.add(1, &[KeyValue::new("operation", operation)]);
        }

        pub fn record_lock_exhausted(&self, operation: &'static str) {
            self.lock_exhausted.add(1, &[KeyValue::new("operation", operation)]);
        }

        /// Prometheus text exposition of everything recorded so far.
        pub fn render(&self) -> Result<String, prometheus::Error> {
            TextEncoder::new().encode_to_string(&self.registry.gather())
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(query: &str) -> Span {
        info_span!("partwarden.query", sql = %query)
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("partwarden.connect")
    }

    pub fn operation_span(operation: &'static str, table: &str) -> Span {
        info_span!("partwarden.operation", operation, table = %table)
    }
}
