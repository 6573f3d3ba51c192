//! OpenTelemetry metrics export.
//!
//! Histogram, limiter and channel figures are published as observable gauges. The
//! reporter pushes fresh snapshots into [`TelemetryState`] and the gauge callbacks read
//! whatever was published last.

use anyhow::{Context, Result};
use hivepf_common::{LATENCY_BANDS, LatencyStat, RateLimitState};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::core::ChannelStats;
use crate::records::RecordKind;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

const BAND_LABELS: [&str; LATENCY_BANDS] = ["0-10ms", "10-20ms", "20-50ms", "50ms+"];

static METRICS: OnceLock<HiveMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

static STATE: OnceLock<RwLock<TelemetryState>> = OnceLock::new();

fn state() -> &'static RwLock<TelemetryState> {
    STATE.get_or_init(|| RwLock::new(TelemetryState::default()))
}

/// Last published figures, read by the gauge callbacks.
#[derive(Debug, Default, Clone)]
pub struct TelemetryState {
    pub runqlat_global: LatencyStat,
    pub runqlat_groups: HashMap<u64, LatencyStat>,
    pub limiters: HashMap<String, RateLimitState>,
    pub channel: ChannelStats,
    pub active_probes: HashMap<String, u64>,
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct HiveMetrics {
    pub records_consumed: Counter<u64>,
}

impl HiveMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            records_consumed: meter
                .u64_counter("records_consumed")
                .with_description("Records drained from the event channel")
                .with_unit("records")
                .build(),
        }
    }
}

fn normalize_endpoint(raw: &str) -> Option<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return None;
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Configures OTLP export over gRPC. A missing or empty endpoint disables export.
pub fn init_metrics(endpoint: Option<&str>) -> Result<()> {
    let Some(endpoint) = endpoint.and_then(normalize_endpoint) else {
        info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
        return Ok(());
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
        KeyValue::new("service.name", "hivepf"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("hivepf");
    register_gauges(&meter);
    let _ = METRICS.set(HiveMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

fn register_gauges(meter: &Meter) {
    let _active_probes = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                for (probe, count) in &s.active_probes {
                    observer.observe(*count, &[KeyValue::new("probe", probe.clone())]);
                }
            }
        })
        .build();

    let _runqlat_global = meter
        .u64_observable_gauge("runqlat_global")
        .with_description("Run-queue latency samples per band, all groups")
        .with_unit("samples")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                for (label, count) in BAND_LABELS.iter().zip(s.runqlat_global.nlat) {
                    observer.observe(count, &[KeyValue::new("band", *label)]);
                }
                observer.observe(s.runqlat_global.nvcsw, &[KeyValue::new("band", "nvcsw")]);
                observer.observe(s.runqlat_global.nivcsw, &[KeyValue::new("band", "nivcsw")]);
            }
        })
        .build();

    let _runqlat_group = meter
        .u64_observable_gauge("runqlat_group")
        .with_description("Run-queue latency samples per band and scheduling group")
        .with_unit("samples")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                for (group, stat) in &s.runqlat_groups {
                    let group = format!("{:#x}", group);
                    for (label, count) in BAND_LABELS.iter().zip(stat.nlat) {
                        observer.observe(
                            count,
                            &[
                                KeyValue::new("group", group.clone()),
                                KeyValue::new("band", *label),
                            ],
                        );
                    }
                    observer.observe(
                        stat.nvcsw,
                        &[
                            KeyValue::new("group", group.clone()),
                            KeyValue::new("band", "nvcsw"),
                        ],
                    );
                    observer.observe(
                        stat.nivcsw,
                        &[KeyValue::new("group", group), KeyValue::new("band", "nivcsw")],
                    );
                }
            }
        })
        .build();

    let _ratelimit_events = meter
        .u64_observable_gauge("ratelimit_events")
        .with_description("Events admitted by each limiter since start")
        .with_unit("events")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                for (name, limiter) in &s.limiters {
                    observer.observe(
                        limiter.total_events,
                        &[KeyValue::new("limiter", name.clone())],
                    );
                }
            }
        })
        .build();

    let _ratelimit_missed = meter
        .u64_observable_gauge("ratelimit_missed")
        .with_description("Events suppressed by each limiter since start")
        .with_unit("events")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                for (name, limiter) in &s.limiters {
                    observer.observe(
                        limiter.total_missed,
                        &[KeyValue::new("limiter", name.clone())],
                    );
                }
            }
        })
        .build();

    let _channel_emitted = meter
        .u64_observable_gauge("channel_emitted")
        .with_description("Records accepted by the event channel")
        .with_unit("records")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                observer.observe(s.channel.emitted, &[]);
            }
        })
        .build();

    let _channel_dropped = meter
        .u64_observable_gauge("channel_dropped")
        .with_description("Records dropped because the event channel was full")
        .with_unit("records")
        .with_callback(|observer| {
            if let Ok(s) = state().read() {
                observer.observe(s.channel.dropped, &[]);
            }
        })
        .build();
}

pub fn metrics() -> Option<&'static HiveMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut s) = state().write() {
        s.active_probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

pub fn record_consumed(kind: RecordKind, count: u64) {
    if let Some(m) = metrics() {
        m.records_consumed
            .add(count, &[KeyValue::new("kind", kind.as_str())]);
    }
}

pub fn publish_runqlat(global: LatencyStat, groups: Vec<(u64, LatencyStat)>) {
    if let Ok(mut s) = state().write() {
        s.runqlat_global = global;
        s.runqlat_groups = groups.into_iter().collect();
    }
}

pub fn publish_limiter(name: &str, limiter: RateLimitState) {
    if let Ok(mut s) = state().write() {
        s.limiters.insert(name.to_string(), limiter);
    }
}

pub fn publish_channel(stats: ChannelStats) {
    if let Ok(mut s) = state().write() {
        s.channel = stats;
    }
}

/// Copy of the last published figures.
pub fn snapshot() -> TelemetryState {
    state().read().map(|s| s.clone()).unwrap_or_default()
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
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
    fn test_endpoint_empty_disables_export() {
        assert!(normalize_endpoint("").is_none());
        assert!(normalize_endpoint("   ").is_none());
    }

    #[test]
    fn test_endpoint_kept_with_scheme() {
        assert_eq!(
            normalize_endpoint("https://custom:4317"),
            Some("https://custom:4317".to_string())
        );
    }

    #[test]
    fn test_endpoint_adds_http_prefix() {
        assert_eq!(
            normalize_endpoint("collector:4317"),
            Some("http://collector:4317".to_string())
        );
    }

    #[test]
    fn test_init_without_endpoint_is_noop() {
        assert!(init_metrics(None).is_ok());
        assert!(metrics().is_none());
    }

    #[test]
    #[serial]
    fn test_published_state_is_visible() {
        let stat = LatencyStat {
            nvcsw: 1,
            nivcsw: 2,
            nlat: [3, 4, 5, 6],
        };
        publish_runqlat(stat, vec![(0xabc, stat)]);
        publish_channel(ChannelStats {
            emitted: 10,
            consumed: 8,
            dropped: 2,
        });
        publish_limiter("hungtask", RateLimitState::default());

        let snap = snapshot();
        assert_eq!(snap.runqlat_global, stat);
        assert_eq!(snap.runqlat_groups.get(&0xabc), Some(&stat));
        assert_eq!(snap.channel.dropped, 2);
        assert!(snap.limiters.contains_key("hungtask"));
    }
}
