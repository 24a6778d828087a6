//! Logging and distributed tracing.
//!
//! - [`TraceBridge`] moves W3C trace context between message headers and
//!   OpenTelemetry contexts. Bad or missing fields never fail processing; they
//!   just produce a root context.
//! - [`init`] installs the `tracing` subscriber with an OpenTelemetry layer.

use anyhow::{Context as _, Result};
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::headers::Headers;
use crate::identity::WorkerIdentity;

pub const TRACER_NAME: &str = "hireflow/notifications-worker";

const DEFAULT_LOG_FILTER: &str = "info,notifications_worker=debug,lapin=warn";

/// Read-only view of [`Headers`] for propagators.
struct HeaderExtractor<'a>(&'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().collect()
    }
}

/// Write view of [`Headers`] for propagators.
struct HeaderInjector<'a>(&'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value);
    }
}

/// Carries trace context across the broker.
pub struct TraceBridge {
    propagator: TextMapCompositePropagator,
}

impl Default for TraceBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBridge {
    /// W3C `traceparent`/`tracestate` plus `baggage`.
    pub fn new() -> Self {
        Self {
            propagator: TextMapCompositePropagator::new(vec![
                Box::new(TraceContextPropagator::new()),
                Box::new(BaggagePropagator::new()),
            ]),
        }
    }

    /// Context carried in `headers`, or an empty root context.
    pub fn extract(&self, headers: &Headers) -> Context {
        self.propagator
            .extract_with_context(&Context::new(), &HeaderExtractor(headers))
    }

    /// Write `cx` into `headers`. Only publishers need this.
    pub fn inject(&self, cx: &Context, headers: &mut Headers) {
        self.propagator
            .inject_context(cx, &mut HeaderInjector(headers));
    }

    /// Whether `cx` continues a trace started elsewhere.
    pub fn is_remote_parent(cx: &Context) -> bool {
        let span = cx.span();
        let span_context = span.span_context();
        span_context.is_valid() && span_context.is_remote()
    }
}

/// Owns the tracer provider; flushes pending spans on shutdown.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "otel shutdown error");
            }
        }
    }
}

/// Install the global subscriber: env filter, fmt output and, when the
/// exporter can be built, an OpenTelemetry layer.
///
/// Tracing is best-effort: if the exporter cannot be built the worker keeps
/// running with logs only.
pub fn init(config: &WorkerConfig, identity: &WorkerIdentity) -> Telemetry {
    let provider = build_provider(config, identity);

    let otel_layer = provider.as_ref().ok().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME))
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    match provider {
        Ok(provider) => {
            opentelemetry::global::set_tracer_provider(provider.clone());
            info!(
                worker_id = %identity.worker_id,
                endpoint = %config.otlp_endpoint,
                service = %config.service_name,
                "otel tracing enabled"
            );
            Telemetry {
                provider: Some(provider),
            }
        }
        Err(e) => {
            warn!(
                worker_id = %identity.worker_id,
                pod = %identity.pod_name,
                error = %e,
                "otel init failed (continuing without tracing)"
            );
            Telemetry { provider: None }
        }
    }
}

fn build_provider(config: &WorkerConfig, identity: &WorkerIdentity) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([
            KeyValue::new("hireflow.worker_id", identity.worker_id.clone()),
            KeyValue::new("k8s.pod.name", identity.pod_name.clone()),
            KeyValue::new("k8s.namespace.name", identity.namespace.clone()),
            KeyValue::new("k8s.node.name", identity.node_name.clone()),
        ])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_extract_from_text_and_bytes() {
        let bridge = TraceBridge::new();

        for headers in [
            Headers::new().with("traceparent", TRACEPARENT),
            Headers::new().with("traceparent", TRACEPARENT.as_bytes().to_vec()),
        ] {
            let cx = bridge.extract(&headers);
            assert!(TraceBridge::is_remote_parent(&cx));
            assert_eq!(
                cx.span().span_context().trace_id().to_string(),
                "4bf92f3577b34da6a3ce929d0e0e4736"
            );
        }
    }

    #[test]
    fn test_missing_or_malformed_yields_root_context() {
        let bridge = TraceBridge::new();

        let cx = bridge.extract(&Headers::new());
        assert!(!TraceBridge::is_remote_parent(&cx));

        let cx = bridge.extract(&Headers::new().with("traceparent", "garbage"));
        assert!(!TraceBridge::is_remote_parent(&cx));

        let cx = bridge.extract(&Headers::new().with("traceparent", vec![0xff, 0x00]));
        assert!(!TraceBridge::is_remote_parent(&cx));
    }

    #[test]
    fn test_inject_then_extract_continues_trace() {
        let bridge = TraceBridge::new();
        let span_context = SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        let cx = Context::new().with_remote_span_context(span_context);

        let mut headers = Headers::new();
        bridge.inject(&cx, &mut headers);
        assert!(headers.get_str("traceparent").is_some());

        let extracted = bridge.extract(&headers);
        assert_eq!(
            extracted.span().span_context().span_id().to_string(),
            "b7ad6b7169203331"
        );
    }
}
