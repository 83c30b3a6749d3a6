//! Middleware layer.
//!
//! Middleware wraps a handler to produce another handler. It is the right
//! place for cross-cutting concerns: access logging, panic recovery, trace
//! propagation, liveness probes.
//!
//! # Ordering
//!
//! The first middleware registered is the outermost wrapper. Composing
//! `[a, b]` around `h` gives `a(b(h))`:
//!
//! ```text
//! call → a (pre) → b (pre) → h → b (post) → a (post) → response
//! ```
//!
//! A middleware that does not run [`Next`] short-circuits everything inside
//! it. Order is the integrator's decision: a [`Health`] registered first
//! answers probes before anything is logged or traced; registered last, its
//! probes are logged and traced like any other call.
//!
//! ```rust
//! use tsu_api::middleware::{AccessLog, Health, Pipeline, Recovery, Tracing, TracingConfig};
//! use tsu_api::{Context, Response, SharedRequest};
//!
//! async fn search(_cx: Context, _req: SharedRequest) -> Response {
//!     Response::ok("OK")
//! }
//!
//! let service = Pipeline::new()
//!     .with(Health::new("/healthz", "ok"))
//!     .with(Tracing::new(TracingConfig::new("search-api", "production")))
//!     .with(AccessLog::new(std::io::stdout).server_name("api-1"))
//!     .with(Recovery::new(std::io::stderr))
//!     .build(search);
//! # let _ = service;
//! ```

mod access_log;
mod health;
mod recovery;
mod trace;

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, Service};
use crate::request::SharedRequest;
use crate::response::Response;

pub use access_log::AccessLog;
pub use health::Health;
pub use recovery::Recovery;
pub use trace::{HeaderCarrier, Tracing, TracingConfig, inject};

/// A transform around the rest of the chain.
///
/// Configuration lives in the implementing type, is fixed at construction and
/// shared read-only by every concurrent call.
pub trait Middleware: Send + Sync + 'static {
    /// Handles one call. Run `next` to continue the chain; return without
    /// running it to short-circuit.
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response>;
}

/// The rest of the chain after the current middleware.
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    /// Invokes the next middleware or the terminal handler.
    ///
    /// Consumes `self`: each link runs at most once per call. Anything the
    /// downstream raises, even synchronously while building its future,
    /// surfaces while this future is polled.
    pub async fn run(self, cx: Context, req: SharedRequest) -> Response {
        self.inner.call(cx, req).await
    }
}

/// One middleware bound to its successor.
struct Link {
    middleware: Arc<dyn Middleware>,
    next: BoxedHandler,
}

impl ErasedHandler for Link {
    fn call(&self, cx: Context, req: SharedRequest) -> BoxFuture<'static, Response> {
        let next = Next { inner: Arc::clone(&self.next) };
        Arc::clone(&self.middleware).handle(cx, req, next)
    }
}

/// Wraps `handler` in `middlewares`, first element outermost.
pub fn compose<H, I>(handler: H, middlewares: I) -> Service
where
    H: Handler,
    I: IntoIterator<Item = Arc<dyn Middleware>>,
    I::IntoIter: DoubleEndedIterator,
{
    let inner = middlewares
        .into_iter()
        .rev()
        .fold(handler.into_boxed_handler(), |next, middleware| {
            Arc::new(Link { middleware, next }) as BoxedHandler
        });
    Service::new(inner)
}

/// Ordered middleware registration.
///
/// ```rust
/// use tsu_api::middleware::{Health, Pipeline};
/// use tsu_api::{Context, Response, SharedRequest};
///
/// async fn hello(_cx: Context, _req: SharedRequest) -> Response {
///     Response::ok("hello")
/// }
///
/// let service = Pipeline::new().with(Health::new("/health", "ok")).build(hello);
/// # let _ = service;
/// ```
#[derive(Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` inside every middleware registered before it.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn build(self, handler: impl Handler) -> Service {
        compose(handler, self.middlewares)
    }
}

// ── Function middleware ───────────────────────────────────────────────────────

/// Middleware from an async closure, for one-off behavior that does not
/// deserve its own type.
///
/// ```rust
/// use tsu_api::middleware::{Next, Pipeline, from_fn};
/// use tsu_api::{Context, Response, SharedRequest};
///
/// let stamp = from_fn(|cx: Context, req: SharedRequest, next: Next| async move {
///     next.run(cx, req).await.with_header("x-served-by", "tsu")
/// });
/// # async fn hello(_cx: Context, _req: SharedRequest) -> Response { Response::ok("hi") }
/// let service = Pipeline::new().with(stamp).build(hello);
/// # let _ = service;
/// ```
pub fn from_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Context, SharedRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FnMiddleware(f)
}

/// See [`from_fn`].
pub struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Context, SharedRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response> {
        Box::pin((self.0)(cx, req, next))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::RequestBuilder;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Middleware {
        let log = Arc::clone(log);
        from_fn(move |cx: Context, req: SharedRequest, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}:pre"));
                let res = next.run(cx, req).await;
                log.lock().unwrap().push(format!("{name}:post"));
                res
            }
        })
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let handler = move |_cx: Context, _req: SharedRequest| {
            let log = Arc::clone(&handler_log);
            async move {
                log.lock().unwrap().push("handler".to_owned());
                Response::ok("OK")
            }
        };

        let service = Pipeline::new()
            .with(recorder(&log, "a"))
            .with(recorder(&log, "b"))
            .build(handler);
        let res = service.call(Context::background(), RequestBuilder::new("GET", "/").build()).await;

        assert_eq!(res.status(), 200);
        assert_eq!(*log.lock().unwrap(), ["a:pre", "b:pre", "handler", "b:post", "a:post"]);
    }

    #[tokio::test]
    async fn composed_services_nest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = compose(
            |_cx: Context, _req: SharedRequest| async { Response::ok("OK") },
            [Arc::new(recorder(&log, "inner")) as Arc<dyn Middleware>],
        );
        let outer = compose(inner, [Arc::new(recorder(&log, "outer")) as Arc<dyn Middleware>]);

        outer.call(Context::background(), RequestBuilder::new("GET", "/").build()).await;
        assert_eq!(*log.lock().unwrap(), ["outer:pre", "inner:pre", "inner:post", "outer:post"]);
    }

    #[tokio::test]
    async fn a_middleware_can_short_circuit() {
        let gate = from_fn(|_cx: Context, _req: SharedRequest, _next: Next| async {
            Response::unauthorized("no entry")
        });
        let service = Pipeline::new()
            .with(gate)
            .build(|_cx: Context, _req: SharedRequest| async { Response::ok("OK") });

        let res = service.call(Context::background(), RequestBuilder::new("GET", "/").build()).await;
        assert_eq!(res.status(), 401);
    }

    #[tokio::test]
    async fn empty_pipeline_is_the_handler() {
        let service = Pipeline::new().build(|_cx: Context, req: SharedRequest| async move {
            Response::ok(req.path().to_owned())
        });
        let res = service.call(Context::background(), RequestBuilder::new("GET", "/plain").build()).await;
        assert_eq!(res.body_json().unwrap().unwrap(), br#"{"message":"/plain"}"#);
    }
}
