use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "iparty-relay";
const OTEL_STDOUT_ENV: &str = "IPARTY_RELAY_OTEL_STDOUT";

/// Process-wide logging and metrics. Dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Relay process: tracing plus the Prometheus recorder behind `/metrics`.
    pub fn init_server() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        let tracer_provider = init_tracing()?;
        Ok(Self {
            metrics_handle: Some(metrics_handle),
            tracer_provider,
        })
    }

    /// Debug subcommands: tracing only.
    pub fn init_client() -> Result<Self> {
        Ok(Self {
            metrics_handle: None,
            tracer_provider: init_tracing()?,
        })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(
                    error = %err,
                    "failed to shutdown OpenTelemetry tracer provider"
                );
            }
        }
    }
}

/// One subscriber for both modes; the OpenTelemetry layer is simply absent
/// unless the stdout exporter is switched on.
fn init_tracing() -> Result<Option<SdkTracerProvider>> {
    let provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
    let otel_layer = provider.as_ref().map(|provider| {
        global::set_tracer_provider(provider.clone());
        tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    if provider.is_some() {
        info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
    }
    Ok(provider)
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| is_truthy(&val))
        .unwrap_or(false)
}

fn is_truthy(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
