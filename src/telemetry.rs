use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Config;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing::error;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

/// Flushes exported telemetry when dropped.
pub(crate) struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.take() {
            global::shutdown_tracer_provider();
            if let Err(err) = meter_provider.shutdown() {
                error!("Failed to shut down meter provider: {}", err);
            }
        }
    }
}

pub(crate) fn init_telemetry(endpoint: &Option<String>, console: bool) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("INFO"));

    let Some(endpoint) = endpoint else {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(TelemetryGuard {
            meter_provider: None,
        });
    };

    let service_resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(build_tonic_exporter(endpoint))
        .with_trace_config(Config::default().with_resource(service_resource.clone()))
        .install_batch(runtime::Tokio)
        .context("Failed to install tracer")?
        .tracer(env!("CARGO_PKG_NAME"));

    let meter = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(build_tonic_exporter(endpoint))
        .with_resource(service_resource)
        .build()
        .context("Failed to install meter")?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    let registry = Registry::default()
        .with(filter)
        .with(OpenTelemetryLayer::new(tracer))
        .with(MetricsLayer::new(meter.clone()));

    if console {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.init();
    }

    Ok(TelemetryGuard {
        meter_provider: Some(meter),
    })
}

fn build_tonic_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_timeout(Duration::from_secs(15))
        .with_endpoint(endpoint)
}
