//! Tracing and OpenTelemetry wiring.
//!
//! When any `OTEL_EXPORTER_OTLP_*` variable is present, spans and metrics are
//! exported over OTLP (HTTP or gRPC per `OTEL_EXPORTER_OTLP_PROTOCOL`) in
//! addition to local fmt logging; otherwise only the local subscriber is
//! installed. The returned guard shuts the providers down on drop.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use std::time::Duration;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    Http,
    Grpc,
}

impl OtlpProtocol {
    /// Detects whether OTLP export is requested, and over which transport.
    fn from_env() -> Option<Self> {
        let enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !enabled {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(OtlpProtocol::Grpc),
            _ => Some(OtlpProtocol::Http),
        }
    }
}

fn service_resource() -> Resource {
    let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_schema_url(
            [
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
            ],
            SCHEMA_URL,
        )
        .build()
}

fn build_tracer_provider(protocol: OtlpProtocol) -> SdkTracerProvider {
    let exporter = opentelemetry_otlp::SpanExporter::builder();
    let exporter = match protocol {
        OtlpProtocol::Http => exporter.with_http().build(),
        OtlpProtocol::Grpc => exporter.with_tonic().build(),
    }
    .expect("Failed to build OTLP span exporter");

    SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(service_resource())
        .with_batch_exporter(exporter)
        .build()
}

fn build_meter_provider(protocol: OtlpProtocol) -> SdkMeterProvider {
    let exporter = opentelemetry_otlp::MetricExporter::builder();
    let exporter = match protocol {
        OtlpProtocol::Http => exporter.with_http().build(),
        OtlpProtocol::Grpc => exporter.with_tonic().build(),
    }
    .expect("Failed to build OTLP metric exporter");

    let otlp_reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(30))
        .build();
    let stdout_reader =
        PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build();

    let provider = MeterProviderBuilder::default()
        .with_resource(service_resource())
        .with_reader(otlp_reader)
        .with_reader(stdout_reader)
        .build();
    global::set_meter_provider(provider.clone());
    provider
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Holds the telemetry providers for graceful shutdown on drop.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Installs the global tracing subscriber, with OTLP layers when the
    /// environment asks for them.
    pub fn init() -> Self {
        match OtlpProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = build_tracer_provider(protocol);
                let meter_provider = build_meter_provider(protocol);
                let tracer = tracer_provider.tracer("resq-core");

                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();

                tracing::info!(?protocol, "OpenTelemetry export enabled");
                Telemetry {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .init();

                tracing::info!("OpenTelemetry export not configured, logging locally");
                Telemetry {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref()
            && let Err(err) = tracer_provider.shutdown()
        {
            eprintln!("{err:?}");
        }
        if let Some(meter_provider) = self.meter_provider.as_ref()
            && let Err(err) = meter_provider.shutdown()
        {
            eprintln!("{err:?}");
        }
    }
}
