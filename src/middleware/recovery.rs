//! Panic recovery middleware.
//!
//! The one place in a pipeline where a panic is caught. Everything inside
//! this middleware runs under [`catch_unwind`](futures_util::FutureExt::catch_unwind);
//! a panic raised while polling it is logged and turned into a
//! `500 Internal Server Error`. Panics outside it, or in tasks the handler
//! spawns, are not caught here.
//!
//! The logged `stack` is captured by a process-wide panic hook, installed by
//! the first [`Recovery::new`], at the point the panic is raised. The hook
//! chains to whatever hook was installed before it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::context::Context;
use crate::error::{ApiError, BoxError, ErrorKind};
use crate::handler::BoxFuture;
use crate::log::Logger;
use crate::middleware::{Middleware, Next};
use crate::request::SharedRequest;
use crate::response::Response;

/// Converts downstream panics into `500` responses.
///
/// Panic payloads are interpreted as:
/// - [`ApiError`]: used as the response body as-is;
/// - `Box<dyn Error + Send + Sync>`: its message;
/// - `String` / `&'static str`: the text;
/// - anything else: `"unknown panic"`.
///
/// ```rust
/// use tsu_api::middleware::{Pipeline, Recovery};
/// # use tsu_api::{Context, Response, SharedRequest};
/// # async fn flaky(_cx: Context, _req: SharedRequest) -> Response { panic!("connection error") }
///
/// let service = Pipeline::new().with(Recovery::new(std::io::stderr)).build(flaky);
/// # let _ = service;
/// ```
#[derive(Debug)]
pub struct Recovery {
    logger: Logger,
}

impl Recovery {
    pub fn new<W>(sink: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        install_panic_hook();
        Self { logger: Logger::new(sink) }
    }
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// The stack recorded for the panic just caught on this thread.
fn take_panic_stack() -> String {
    PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

impl Middleware for Recovery {
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            match AssertUnwindSafe(next.run(cx, req)).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => {
                    let stack = take_panic_stack();
                    let err = fault_error(payload);
                    self.logger
                        .record(Level::ERROR)
                        .field("error", err.message())
                        .field("stack", stack)
                        .field("message", "panic recovered")
                        .send();
                    Response::internal_server_error(err)
                }
            }
        })
    }
}

fn fault_error(payload: Box<dyn Any + Send>) -> ApiError {
    let payload = match payload.downcast::<ApiError>() {
        Ok(err) => return *err,
        Err(other) => other,
    };
    let payload = match payload.downcast::<BoxError>() {
        Ok(err) => return ErrorKind::UNEXPECTED.wrap(*err),
        Err(other) => other,
    };
    let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    };
    ErrorKind::UNEXPECTED.new(message)
}
