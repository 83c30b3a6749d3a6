//! Liveness probe middleware.
//!
//! Kubernetes asks "is the process alive?". If it can answer HTTP at all, it
//! is, so the probe path is answered right here, without touching the rest
//! of the chain.
//!
//! ```rust
//! use tsu_api::middleware::{Health, Pipeline};
//! # use tsu_api::{Context, Response, SharedRequest};
//! # async fn app(_cx: Context, _req: SharedRequest) -> Response { Response::ok("app") }
//!
//! let service = Pipeline::new()
//!     .with(Health::new("/healthz", "ok"))
//!     .build(app);
//! # let _ = service;
//! ```

use std::sync::Arc;

use crate::context::Context;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::SharedRequest;
use crate::response::{Body, Response};

/// Answers `200 OK` with a fixed body on one exact path; everything else
/// passes through untouched.
#[derive(Debug, Clone)]
pub struct Health {
    path: String,
    body: Body,
}

impl Health {
    pub fn new(path: impl Into<String>, body: impl Into<Body>) -> Self {
        Self { path: path.into(), body: body.into() }
    }
}

impl Middleware for Health {
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response> {
        if req.path() == self.path {
            let res = Response::ok(self.body.clone());
            return Box::pin(async move { res });
        }
        Box::pin(next.run(cx, req))
    }
}
