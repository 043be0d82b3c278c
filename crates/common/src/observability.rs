use std::borrow::Cow;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Counter incremented for every ERROR-level log event.
pub const ERROR_EVENTS_METRIC: &str = "leaderboard_error_log_events_total";

/// Flushes the global tracer provider when dropped.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!(ERROR_EVENTS_METRIC).increment(1);
        }
    }
}

fn json_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json()
}

fn otel_provider(
    endpoint: String,
    service_name: &str,
) -> Option<opentelemetry_sdk::trace::TracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .ok()?;

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    // Batch export needs a running Tokio runtime.
    Some(
        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(resource)
            .build(),
    )
}

/// Build the process-wide `tracing` dispatcher.
///
/// - JSON lines on stdout
/// - `RUST_LOG` wins over `default_level`
/// - ERROR events counted in [`ERROR_EVENTS_METRIC`]
/// - OTLP span export only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; if the
///   exporter cannot be built we keep logs and metrics only
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let service_name = service_name.into();

    let provider = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|endpoint| otel_provider(endpoint, &service_name));

    let base = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer())
        .with(ErrorCounterLayer);

    match provider {
        Some(provider) => {
            let tracer = provider.tracer("leaderboard");
            let _ = opentelemetry::global::set_tracer_provider(provider);
            let subscriber = base.with(tracing_opentelemetry::layer().with_tracer(tracer));
            (
                tracing::Dispatch::new(subscriber),
                Some(OtelGuard { _private: () }),
            )
        }
        None => (tracing::Dispatch::new(base), None),
    }
}
