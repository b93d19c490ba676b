mod checkpoint;
mod config;
mod mapper;
mod pipeline;
mod sink;
mod source;

use crate::config::Config;
use crate::pipeline::{run_sync, SyncContext};
use crate::sink::TagoDeviceClient;
use crate::source::LesenseClient;
use anyhow::{Context, Result};
use std::sync::Arc;

const USER_AGENT: &str = concat!("lesense-sync/", env!("CARGO_PKG_VERSION"));

/// Flushes batched spans when the run ends, whichever way `main` returns.
struct TracingGuard {
    exporting: bool,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if self.exporting {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn init_tracing(config: &Config) -> Result<TracingGuard> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let tracer = config
        .otlp_traces_endpoint()
        .map(|endpoint| {
            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(endpoint))
                .with_trace_config(TraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                ])))
                .install_batch(Tokio)
        })
        .transpose()
        .context("failed to install OTLP span exporter")?;
    let guard = TracingGuard {
        exporting: tracer.is_some(),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,lesense_sync=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .try_init()?;

    Ok(guard)
}

fn build_context(config: &Config) -> Result<SyncContext> {
    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.http_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let source = LesenseClient::new(http.clone(), &config.lesense_api_base);
    let sink = TagoDeviceClient::new(http, &config.tago_api_base);
    Ok(SyncContext::new(
        config.credentials(),
        Arc::new(source),
        Arc::new(sink),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _tracing = init_tracing(&config)?;
    tracing::debug!(?config, "loaded configuration");

    let ctx = build_context(&config)?;
    run_sync(&ctx)
        .await
        .map(|_| ())
        .context("lesense sync aborted")
}
