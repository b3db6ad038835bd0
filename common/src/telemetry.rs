//! Provides helper functions for initializing telemetry collection and publication.
use std::time::Duration;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer, Registry};

/// Format of log lines written to stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single line, human readable.
    #[default]
    Compact,
    /// Newline delimited JSON.
    Json,
}

/// Telemetry handle, flushes exporters when shut down.
pub struct Telemetry {
    meter_provider: Option<MeterProvider>,
}

impl Telemetry {
    /// Flush and stop all exporters.
    pub fn shutdown(self) -> Result<()> {
        if let Some(provider) = self.meter_provider {
            provider.shutdown()?;
        }
        global::shutdown_tracer_provider();
        Ok(())
    }
}

fn resource(service_name: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            "hostname",
            gethostname::gethostname()
                .into_string()
                .unwrap_or_else(|_| "unknown".to_owned()),
        ),
        KeyValue::new("service.name", service_name.to_owned()),
    ])
}

/// Initialize tracing and metrics.
///
/// Logs are always written to stdout. When an OTLP endpoint is given spans and metrics
/// are exported to it as well.
pub async fn init(
    service_name: &str,
    otlp_endpoint: Option<String>,
    format: LogFormat,
) -> Result<Telemetry> {
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let logger = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(log_filter)
            .boxed(),
    };

    let (telemetry, meter_provider) = if let Some(endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint.clone()),
            )
            .with_trace_config(trace::config().with_resource(resource(service_name)))
            .install_batch(runtime::Tokio)?;

        let meter_provider = opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_resource(resource(service_name))
            .with_period(Duration::from_secs(10))
            .build()?;
        global::set_meter_provider(meter_provider.clone());

        let otlp_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;
        let layer = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter);
        (Some(layer), Some(meter_provider))
    } else {
        (None, None)
    };

    let collector = Registry::default().with(telemetry).with(logger);

    #[cfg(feature = "tokio-console")]
    let collector = {
        let console_filter = EnvFilter::builder().parse("tokio=trace,runtime=trace")?;
        let console_layer = console_subscriber::spawn().with_filter(console_filter);
        collector.with(console_layer)
    };

    tracing::subscriber::set_global_default(collector)?;

    Ok(Telemetry { meter_provider })
}
