//! Tracing and OpenTelemetry initialization.
//!
//! Local structured logging is always on. OTLP export of spans and
//! metrics activates only when `OTEL_EXPORTER_OTLP_ENDPOINT` is present,
//! so development machines log to stdout and deployments export to
//! whatever collector the environment names. Unlike the collector
//! endpoint itself (which follows the OTel SDK conventions), the export
//! policy is part of [`Config`]: `OTEL_TRACE_SAMPLE_RATIO` bounds how
//! many request spans leave the process and `OTEL_METRIC_INTERVAL_SECONDS`
//! sets the metric push cadence. Every span of a paid request carries the
//! request id, so a sampled-out trace is still reconstructible from logs.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use std::time::Duration;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Export policy resolved from [`Config`] plus the standard OTel
/// environment variables.
struct ExportPolicy {
    use_grpc: bool,
    sample_ratio: f64,
    metric_interval: Duration,
    deployment_env: String,
}

impl ExportPolicy {
    /// `None` when no collector endpoint is configured; nothing is
    /// exported then.
    fn detect(config: &Config) -> Option<Self> {
        env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
        let use_grpc = matches!(
            env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref(),
            Ok("grpc")
        );
        Some(Self {
            use_grpc,
            sample_ratio: config.otel_trace_sample_ratio.clamp(0.0, 1.0),
            metric_interval: Duration::from_secs(config.otel_metric_interval_seconds.max(1)),
            deployment_env: config.deployment_env.clone(),
        })
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, self.deployment_env.clone()),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    /// Head sampling for request traces. Ratios at or above 1.0 short-cut
    /// to always-on; anything lower follows the parent decision first so a
    /// sampled paid request keeps its facilitator and ledger child spans.
    fn sampler(&self) -> Sampler {
        let head = if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        };
        Sampler::ParentBased(Box::new(head))
    }

    fn tracer_provider(&self) -> SdkTracerProvider {
        let builder = opentelemetry_otlp::SpanExporter::builder();
        let exporter = if self.use_grpc {
            builder.with_tonic().build()
        } else {
            builder.with_http().build()
        };
        let exporter = exporter.expect("Failed to build OTLP span exporter");
        SdkTracerProvider::builder()
            .with_sampler(self.sampler())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build()
    }

    fn meter_provider(&self) -> SdkMeterProvider {
        let builder = opentelemetry_otlp::MetricExporter::builder();
        let exporter = if self.use_grpc {
            builder.with_tonic().build()
        } else {
            builder.with_http().build()
        };
        let exporter = exporter.expect("Failed to build OTLP metric exporter");
        let reader = PeriodicReader::builder(exporter)
            .with_interval(self.metric_interval)
            .build();
        let meter_provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        meter_provider
    }
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn"))
}

/// Holds the telemetry providers so dropping the struct flushes
/// exporters.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Registers the global subscriber. Call once, early in `main`, after
    /// configuration is loaded.
    pub fn register(config: &Config) -> Self {
        match ExportPolicy::detect(config) {
            Some(policy) => {
                let tracer_provider = policy.tracer_provider();
                let meter_provider = policy.meter_provider();
                let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
                tracing_subscriber::registry()
                    .with(log_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();
                tracing::info!(
                    sample_ratio = policy.sample_ratio,
                    metric_interval = ?policy.metric_interval,
                    grpc = policy.use_grpc,
                    "OpenTelemetry export enabled"
                );
                Self {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(log_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                tracing::info!("OpenTelemetry is not enabled");
                Self {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.take() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("trace exporter shutdown failed: {err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.take() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("metric exporter shutdown failed: {err:?}");
            }
        }
    }
}
