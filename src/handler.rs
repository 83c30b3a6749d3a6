//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! A pipeline holds handlers and middleware of *different* concrete types, so
//! everything is hidden behind one trait object (`dyn ErasedHandler`) and
//! stored uniformly.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! async fn hello(cx: Context, req: SharedRequest) -> Response { … }  ← user writes this
//!        ↓ compose(hello, middlewares)
//! hello.into_boxed_handler()                                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                                       ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(cx, req)  at request time                           ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(cx, req).await.into_response() })         ← BoxFuture
//! ```
//!
//! The only runtime cost per call and per link is **one Arc clone** +
//! **one virtual call**.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::request::SharedRequest;
use crate::response::{IntoResponse, Response};

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future.
///
/// `Pin<Box<…>>` is required because the async runtime must be able to poll
/// the future in-place. `Send` lets tokio move the future across threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, cx: Context, req: SharedRequest) -> BoxFuture<'static, Response>;
}

/// A heap-allocated, type-erased handler shared across concurrent calls.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid terminal handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(cx: Context, req: SharedRequest) -> impl IntoResponse
/// ```
///
/// and for a composed [`Service`], which is what makes pipelines nest.
///
/// The trait is **sealed** (via the private `Sealed` supertrait).
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Context, SharedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Context, SharedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Context, SharedRequest) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, cx: Context, req: SharedRequest) -> BoxFuture<'static, Response> {
        let fut = (self.0)(cx, req);
        Box::pin(async move { fut.await.into_response() })
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// A callable, composed handler: the output of
/// [`compose`](crate::middleware::compose) or
/// [`Pipeline::build`](crate::middleware::Pipeline::build).
///
/// Cloning shares the same chain. A `Service` is itself a [`Handler`], so a
/// composed pipeline can be wrapped again.
#[derive(Clone)]
pub struct Service {
    inner: BoxedHandler,
}

impl Service {
    pub(crate) fn new(inner: BoxedHandler) -> Self {
        Self { inner }
    }

    /// Runs one call through the whole chain.
    pub fn call(&self, cx: Context, req: SharedRequest) -> BoxFuture<'static, Response> {
        self.inner.call(cx, req)
    }
}

impl private::Sealed for Service {}

impl Handler for Service {
    fn into_boxed_handler(self) -> BoxedHandler {
        self.inner
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}
