use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Builds the OTLP meter provider. The caller installs it globally before
/// creating any instrument, instruments taken from the default global
/// provider never export.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    // Early exit if metrics are disabled
    if !enable_metrics {
        return Ok(None);
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "ci"))
        .with_attribute(KeyValue::new("service.name", "container-registry"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));

    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "service.instance.id",
            instance_id.to_owned(),
        ));
    }

    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

#[derive(Clone, Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub state_read: Histogram<f64>,
    pub driver_writes: Counter<u64>,
    pub driver_reads: Counter<u64>,
    pub driver_scans: Counter<u64>,
    pub driver_deletes: Counter<u64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let state_write = meter
            .f64_histogram("registry.state_store_write_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Container store write latency in seconds")
            .build();

        let state_read = meter
            .f64_histogram("registry.state_store_read_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Container store read latency in seconds")
            .build();

        let driver_writes = meter
            .u64_counter("registry.state_driver_writes")
            .with_description("Number of state driver writes")
            .build();

        let driver_reads = meter
            .u64_counter("registry.state_driver_reads")
            .with_description("Number of state driver reads")
            .build();

        let driver_scans = meter
            .u64_counter("registry.state_driver_scans")
            .with_description("Number of state driver scans")
            .build();

        let driver_deletes = meter
            .u64_counter("registry.state_driver_deletes")
            .with_description("Number of state driver deletes")
            .build();

        Self {
            state_write,
            state_read,
            driver_writes,
            driver_reads,
            driver_scans,
            driver_deletes,
        }
    }
}

pub mod registry_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub reservations: Counter<u64>,
        pub transitions: Counter<u64>,
        pub conflicts: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("registry");
            let reservations = meter
                .u64_counter("registry.reservations")
                .with_description("number of reservations, labelled by outcome (new or reused)")
                .build();
            let transitions = meter
                .u64_counter("registry.transitions")
                .with_description("number of container state transitions by operation")
                .build();
            let conflicts = meter
                .u64_counter("registry.cas_conflicts")
                .with_description("number of compare-and-swap conflicts retried by the registry")
                .build();
            Metrics {
                reservations,
                transitions,
                conflicts,
            }
        }
    }
}

pub mod reaper_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub passes: Counter<u64>,
        pub pass_duration: Histogram<f64>,
        pub expired: Counter<u64>,
        pub destroyed: Counter<u64>,
        pub destroy_failures: Counter<u64>,
        pub persistent_orphans: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("reaper");
            let passes = meter
                .u64_counter("registry.reaper_passes")
                .with_description("number of reaper passes")
                .build();
            let pass_duration = meter
                .f64_histogram("registry.reaper_pass_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("reaper pass latency in seconds")
                .build();
            let expired = meter
                .u64_counter("registry.reaper_expired")
                .with_description("containers expired by the reaper, labelled by reason")
                .build();
            let destroyed = meter
                .u64_counter("registry.reaper_destroyed")
                .with_description("containers destroyed and removed from the store")
                .build();
            let destroy_failures = meter
                .u64_counter("registry.reaper_destroy_failures")
                .with_description("failed destroy calls against workers")
                .build();
            let persistent_orphans = meter
                .u64_counter("registry.reaper_persistent_orphans")
                .with_description("containers that exhausted their destroy attempts")
                .build();
            Metrics {
                passes,
                pass_duration,
                expired,
                destroyed,
                destroy_failures,
                persistent_orphans,
            }
        }
    }
}
