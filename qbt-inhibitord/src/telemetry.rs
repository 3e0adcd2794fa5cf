use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Inhibitor metrics exported over OTLP.
pub struct InhibitorMetrics {
    pub enforcement_edges: Counter<u64>,
    pub enforcement_failures: Counter<u64>,
    pub broadcasts: Counter<u64>,
    pub connections_opened: Counter<u64>,
    pub connections_closed: Counter<u64>,
    pub frames_rejected: Counter<u64>,
    pub collaborator_restarts: Counter<u64>,
}

impl InhibitorMetrics {
    pub fn new(meter: &Meter) -> Self {
        let enforcement_edges = meter
            .u64_counter("qbt_inhibitor.enforcement.edges")
            .with_description("Throttle engage/release transitions")
            .build();

        let enforcement_failures = meter
            .u64_counter("qbt_inhibitor.enforcement.failures")
            .with_description("Failed calls to the throttle target")
            .build();

        let broadcasts = meter
            .u64_counter("qbt_inhibitor.api.broadcasts")
            .with_description("Frames fanned out to API connections")
            .build();

        let connections_opened = meter
            .u64_counter("qbt_inhibitor.api.connections_opened")
            .with_description("Completed API handshakes")
            .build();

        let connections_closed = meter
            .u64_counter("qbt_inhibitor.api.connections_closed")
            .with_description("API connections torn down")
            .build();

        let frames_rejected = meter
            .u64_counter("qbt_inhibitor.api.frames_rejected")
            .with_description("Inbound frames rejected before or after handshake")
            .build();

        let collaborator_restarts = meter
            .u64_counter("qbt_inhibitor.supervisor.restarts")
            .with_description("Collaborator tasks restarted after exiting")
            .build();

        Self {
            enforcement_edges,
            enforcement_failures,
            broadcasts,
            connections_opened,
            connections_closed,
            frames_rejected,
            collaborator_restarts,
        }
    }

    pub fn record_enforcement(&self, action: &str, ok: bool) {
        let attrs = [KeyValue::new("action", action.to_string())];
        if ok {
            self.enforcement_edges.add(1, &attrs);
        } else {
            self.enforcement_failures.add(1, &attrs);
        }
    }

    pub fn record_broadcast(&self, kind: &str, delivered: u64, dropped: u64) {
        self.broadcasts.add(
            delivered,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("outcome", "delivered"),
            ],
        );
        if dropped > 0 {
            self.broadcasts.add(
                dropped,
                &[
                    KeyValue::new("kind", kind.to_string()),
                    KeyValue::new("outcome", "dropped"),
                ],
            );
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.add(1, &[]);
    }

    pub fn record_connection_closed(&self, reason: &str) {
        self.connections_closed
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_frame_rejected(&self, reason: &str) {
        self.frames_rejected
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_restart(&self, role: &str) {
        self.collaborator_restarts
            .add(1, &[KeyValue::new("role", role.to_string())]);
    }
}

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
const EXPORT_INTERVAL: Duration = Duration::from_secs(30);
const METER_NAME: &str = "qbt-inhibitord";

/// Installs the global meter provider pushing inhibitor counters to
/// `endpoint` over OTLP/HTTP. Only called when `--otlp-endpoint` is given;
/// without it every metrics hook in the daemon is `None`.
pub fn init_metrics(
    endpoint: &str,
    service_name: &str,
) -> Result<(SdkMeterProvider, InhibitorMetrics)> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(opentelemetry_otlp::ExportConfig {
            endpoint: Some(endpoint.to_string()),
            timeout: EXPORT_TIMEOUT,
            ..Default::default()
        })
        .build()
        .with_context(|| format!("building OTLP metric exporter for {endpoint}"))?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(EXPORT_INTERVAL)
    .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();
    global::set_meter_provider(provider.clone());

    let metrics = InhibitorMetrics::new(&global::meter(METER_NAME));
    info!(
        endpoint,
        interval_secs = EXPORT_INTERVAL.as_secs(),
        "Exporting inhibitor metrics"
    );
    Ok((provider, metrics))
}

/// Flushes pending counters before exit.
pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    provider
        .shutdown()
        .context("flushing inhibitor metrics")?;
    info!("Metrics exporter stopped");
    Ok(())
}
