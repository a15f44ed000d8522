//! OpenTelemetry metrics export.
//!
//! Counts the records each probe family delivers, perf buffer losses and the
//! approximate openat invocation count. Export is disabled unless an OTLP
//! endpoint is configured.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<KmlProbeMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

/// Last value read from the in-kernel openat counter.
static OPENAT_INVOCATIONS: AtomicU64 = AtomicU64::new(0);

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct KmlProbeMetrics {
    pub call_trace_events: Counter<u64>,
    pub file_open_events: Counter<u64>,
    pub scheduler_events: Counter<u64>,
    pub perf_events_lost: Counter<u64>,
}

impl KmlProbeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            call_trace_events: meter
                .u64_counter("call_trace_events")
                .with_description("Number of traced kernel function calls")
                .with_unit("events")
                .build(),
            file_open_events: meter
                .u64_counter("file_open_events")
                .with_description("Number of openat syscalls observed")
                .with_unit("events")
                .build(),
            scheduler_events: meter
                .u64_counter("scheduler_events")
                .with_description("Number of task-selection phase events")
                .with_unit("events")
                .build(),
            perf_events_lost: meter
                .u64_counter("perf_events_lost")
                .with_description("Records dropped because a per-CPU buffer was full")
                .with_unit("events")
                .build(),
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> Option<String> {
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Priority:
/// 1. Endpoint from the loaded settings
/// 2. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    match configured {
        Some(endpoint) => normalize_endpoint(endpoint),
        None => normalize_endpoint(&std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?),
    }
}

/// Configures metrics export to an OTLP collector via gRPC.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "kmlprobe"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("kmlprobe");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently attached eBPF programs")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    // Racy in-kernel increments, so this undercounts under contention.
    let _openat_gauge = meter
        .u64_observable_gauge("openat_invocations_approximate")
        .with_description("Approximate number of openat invocations seen by the kernel counter")
        .with_unit("calls")
        .with_callback(|observer| {
            observer.observe(OPENAT_INVOCATIONS.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(KmlProbeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static KmlProbeMetrics> {
    METRICS.get()
}

pub fn record_call_trace_event(function: &str) {
    if let Some(m) = metrics() {
        m.call_trace_events
            .add(1, &[KeyValue::new("function", function.to_string())]);
    }
}

pub fn record_file_open_event(flags: &str) {
    if let Some(m) = metrics() {
        m.file_open_events
            .add(1, &[KeyValue::new("flags", flags.to_string())]);
    }
}

pub fn record_scheduler_event(event_type: &'static str) {
    if let Some(m) = metrics() {
        m.scheduler_events
            .add(1, &[KeyValue::new("event_type", event_type)]);
    }
}

pub fn record_lost_events(map: &str, lost: u64) {
    if let Some(m) = metrics() {
        m.perf_events_lost
            .add(lost, &[KeyValue::new("map", map.to_string())]);
    }
}

pub fn record_openat_invocations(count: u64) {
    OPENAT_INVOCATIONS.store(count, Ordering::Relaxed);
}

/// Updates the map read by the `active_probes` gauge callback.
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

#[cfg(test)]
fn active_probe_count(probe_name: &str) -> Option<u64> {
    active_probes_map().read().ok()?.get(probe_name).copied()
}

/// Flushes pending metrics and shuts down the MeterProvider.
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint(None).is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "") };
        assert!(get_otlp_endpoint(None).is_none());
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_from_env() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://custom:4317") };

        let endpoint = get_otlp_endpoint(None);
        assert_eq!(endpoint, Some("http://custom:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_configured_endpoint_wins() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "http://from-env:4317") };

        let endpoint = get_otlp_endpoint(Some("collector:4317"));
        assert_eq!(endpoint, Some("http://collector:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    fn test_active_probe_registry() {
        record_active_probe("test_probe", 3);
        assert_eq!(active_probe_count("test_probe"), Some(3));
        assert_eq!(active_probe_count("missing_probe"), None);
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        record_call_trace_event("vfs_read");
        record_scheduler_event("entry");
        record_lost_events("CALL_TRACE_EVENTS", 2);
    }
}
