//! Distributed tracing middleware.
//!
//! Every call gets one `http.request` span. A W3C `traceparent` on the
//! inbound headers makes the span a child of the caller's; a missing or
//! malformed one starts a new trace. The span travels to the rest of the
//! chain inside [`Context::trace_context`], and [`inject`] writes it into an
//! outbound carrier.
//!
//! ```rust,no_run
//! use tsu_api::middleware::{Pipeline, Tracing, TracingConfig};
//! # use tsu_api::{Context, Response, SharedRequest};
//! # async fn search(_cx: Context, _req: SharedRequest) -> Response { Response::ok("ok") }
//! # async fn run() -> Result<(), tsu_api::Error> {
//!
//! let tracing = Tracing::new(TracingConfig::new("search-api", "production")).runtime_metrics(true);
//! tracing.start_tracer()?;
//!
//! let service = Pipeline::new().with(tracing.clone()).build(search);
//! # let _ = service;
//!
//! tracing.stop_tracer();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::gauge;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{Context as TraceContext, KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::log::Logger;
use crate::middleware::{Middleware, Next};
use crate::request::{Headers, Request, SharedRequest};
use crate::response::Response;

const TRACER_NAME: &str = "tsu-api";
const OPERATION: &str = "http.request";
const RUNTIME_METRICS_INTERVAL: Duration = Duration::from_secs(10);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Tracer identity and export settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name, tagged on every span and on the tracer resource.
    pub service_name: String,

    /// Deployment environment (`production`, `staging`, ...).
    pub environment: String,

    pub service_version: String,

    /// OTLP gRPC endpoint used by [`Tracing::start_tracer`].
    pub otlp_endpoint: String,

    /// Publish tokio runtime gauges while the tracer runs.
    pub runtime_metrics: bool,
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), environment: environment.into(), ..Self::default() }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "tsu-api".to_owned(),
            environment: "development".to_owned(),
            service_version: "1.0.0".to_owned(),
            otlp_endpoint: "http://localhost:4317".to_owned(),
            runtime_metrics: false,
        }
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Span-per-call tracing.
///
/// Clones share the runtime metrics task, so keep one around to call
/// [`stop_tracer`](Tracing::stop_tracer) after handing another to the pipeline.
#[derive(Clone)]
pub struct Tracing {
    config: TracingConfig,
    trace_log: Option<Arc<Logger>>,
    provider: Option<SdkTracerProvider>,
    metrics_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Tracing {
    pub fn new(config: TracingConfig) -> Self {
        Self { config, trace_log: None, provider: None, metrics_task: Arc::default() }
    }

    pub fn runtime_metrics(mut self, enabled: bool) -> Self {
        self.config.runtime_metrics = enabled;
        self
    }

    /// Writes one `info` record per finished span to `sink`.
    pub fn trace_log<W>(mut self, sink: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        self.trace_log = Some(Arc::new(Logger::new(sink)));
        self
    }

    /// Creates spans from `provider` instead of the process-wide one.
    pub fn tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Installs the process-wide tracer provider and W3C propagator.
    ///
    /// Without an explicit [`tracer_provider`](Tracing::tracer_provider) this
    /// builds a batching OTLP exporter for `otlp_endpoint`, so it must run
    /// inside a tokio runtime.
    pub fn start_tracer(&self) -> Result<(), Error> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let provider = match &self.provider {
            Some(provider) => provider.clone(),
            None => self.otlp_provider()?,
        };
        global::set_tracer_provider(provider);

        if self.config.runtime_metrics {
            let task = publish_runtime_metrics(self.config.service_name.clone());
            if let Some(previous) = self.lock_metrics_task().replace(task) {
                previous.abort();
            }
        }

        tracing::info!(
            service = %self.config.service_name,
            env = %self.config.environment,
            runtime_metrics = self.config.runtime_metrics,
            "tracer started"
        );
        Ok(())
    }

    /// Stops runtime metrics and flushes and shuts down the process-wide provider.
    pub fn stop_tracer(&self) {
        if let Some(task) = self.lock_metrics_task().take() {
            task.abort();
        }
        global::shutdown_tracer_provider();
        tracing::info!(service = %self.config.service_name, "tracer stopped");
    }

    fn otlp_provider(&self) -> Result<SdkTracerProvider, Error> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.config.otlp_endpoint)
            .build()
            .map_err(|e| Error::Tracer(e.to_string()))?;

        let resource = Resource::new([
            KeyValue::new("service.name", self.config.service_name.clone()),
            KeyValue::new("service.version", self.config.service_version.clone()),
            KeyValue::new("deployment.environment", self.config.environment.clone()),
        ]);

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(resource)
            .build())
    }

    fn lock_metrics_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.metrics_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_span(&self, parent: &TraceContext, req: &dyn Request, resource: &str) -> TraceContext {
        match &self.provider {
            Some(provider) => self.build_span(&provider.tracer(TRACER_NAME), parent, req, resource),
            None => self.build_span(&global::tracer(TRACER_NAME), parent, req, resource),
        }
    }

    fn build_span<T>(&self, tracer: &T, parent: &TraceContext, req: &dyn Request, resource: &str) -> TraceContext
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let span = tracer
            .span_builder(OPERATION)
            .with_kind(SpanKind::Server)
            .with_attributes([
                KeyValue::new("http.method", req.method().to_owned()),
                KeyValue::new("http.url", req.path().to_owned()),
                KeyValue::new("resource.name", resource.to_owned()),
                KeyValue::new("service.name", self.config.service_name.clone()),
                KeyValue::new("measured", true),
            ])
            .start_with_context(tracer, parent);
        parent.with_span(span)
    }
}

impl Middleware for Tracing {
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            let headers = req.headers();
            let parent = TraceContextPropagator::new()
                .extract_with_context(cx.trace_context(), &HeaderCarrier(&headers));
            let resource = format!("{} {}", req.method(), req.path());
            let span_cx = self.start_span(&parent, req.as_ref(), &resource);

            let mut guard = SpanGuard {
                cx: span_cx.clone(),
                resource,
                status: None,
                trace_log: self.trace_log.clone(),
            };
            let res = next.run(cx.with_trace_context(span_cx), req).await;
            guard.record(&res);
            res
        })
    }
}

impl std::fmt::Debug for Tracing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracing")
            .field("config", &self.config)
            .field("trace_log", &self.trace_log.is_some())
            .finish_non_exhaustive()
    }
}

/// Ends the span when dropped, whether the call returned, was cancelled, or
/// unwound.
struct SpanGuard {
    cx: TraceContext,
    resource: String,
    status: Option<u16>,
    trace_log: Option<Arc<Logger>>,
}

impl SpanGuard {
    fn record(&mut self, res: &Response) {
        let span = self.cx.span();
        let status = res.status();
        span.set_attribute(KeyValue::new("http.status_code", i64::from(status)));
        if status >= 400 {
            let reason = res.status_code().canonical_reason().unwrap_or_default();
            let error = format!("{status} {reason}").trim_end().to_owned();
            span.set_attribute(KeyValue::new("error", error.clone()));
            span.set_status(Status::error(error));
        }
        self.status = Some(status);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let span = self.cx.span();
        span.end();

        if let Some(log) = &self.trace_log {
            let span_context = span.span_context();
            log.record(Level::INFO)
                .field("message", "span finished")
                .field(
                    "trace",
                    json!({
                        "operation": OPERATION,
                        "resource": self.resource,
                        "trace_id": span_context.trace_id().to_string(),
                        "span_id": span_context.span_id().to_string(),
                        "status": self.status,
                    }),
                )
                .send();
        }
    }
}

fn publish_runtime_metrics(service: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RUNTIME_METRICS_INTERVAL);
        loop {
            ticker.tick().await;
            let runtime = tokio::runtime::Handle::current().metrics();
            gauge!("runtime.tokio.workers", "service" => service.clone()).set(runtime.num_workers() as f64);
            gauge!("runtime.tokio.alive_tasks", "service" => service.clone()).set(runtime.num_alive_tasks() as f64);
            gauge!("runtime.tokio.global_queue_depth", "service" => service.clone())
                .set(runtime.global_queue_depth() as f64);
        }
    })
}

// ── Carrier ───────────────────────────────────────────────────────────────────

/// Read-only propagation carrier over request headers.
pub struct HeaderCarrier<'a>(pub &'a Headers);

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Writes the span active in `cx` into an outbound carrier as
/// `traceparent`/`tracestate`. Writes nothing if `cx` has no valid span.
pub fn inject(cx: &Context, carrier: &mut HashMap<String, String>) {
    TraceContextPropagator::new().inject_context(cx.trace_context(), carrier);
}
