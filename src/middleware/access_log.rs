//! Access log middleware.
//!
//! Emits one record per call after the response is produced:
//!
//! ```text
//! {"level":"info","time":"…","status":200,"method":"POST","path":"/search",
//!  "query":{"pretty":"true"},"header":{"user-agent":["curl/8"]},
//!  "protocol":"HTTP/1.1","client_ip":"10.0.0.7","useragent":"curl/8",
//!  "referer":"","latency":1.27,"target":"api.local","server":"api-1"}
//! ```
//!
//! `latency` is in milliseconds. Severity follows the status: `error` for 5xx,
//! `warn` for 4xx, `info` otherwise. Excluded paths produce no record at all.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::context::Context;
use crate::handler::BoxFuture;
use crate::log::Logger;
use crate::middleware::{Middleware, Next};
use crate::request::{Request, SharedRequest};
use crate::response::Response;

type PathFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;
type BodyFilter = Box<dyn Fn(&dyn Request) -> bool + Send + Sync>;

/// Structured access logging.
///
/// Defaults: every path is logged, no request body is.
pub struct AccessLog {
    logger: Logger,
    server: String,
    log_path: PathFilter,
    log_body: BodyFilter,
}

impl AccessLog {
    pub fn new<W>(sink: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Self {
            logger: Logger::new(sink),
            server: String::new(),
            log_path: Box::new(|_| true),
            log_body: Box::new(|_| false),
        }
    }

    /// Identity of this server, written as `server` in every record. Resolve
    /// it once at startup (host name, pod name) and pass it in.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server = name.into();
        self
    }

    /// Never log calls whose path equals one of `paths`.
    pub fn skip_paths<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let skipped: HashSet<String> = paths.into_iter().map(Into::into).collect();
        self.path_filter(move |path| !skipped.contains(path))
    }

    /// Log only calls whose path satisfies `filter`.
    pub fn path_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.log_path = Box::new(filter);
        self
    }

    /// Include the request body for calls satisfying `filter`. Bodies are only
    /// read when the request declares a non-zero content length.
    pub fn body_filter(mut self, filter: impl Fn(&dyn Request) -> bool + Send + Sync + 'static) -> Self {
        self.log_body = Box::new(filter);
        self
    }

    fn write(&self, req: &dyn Request, res: &Response, started: Instant, body: Option<Bytes>) {
        let status = res.status();
        let level = match status {
            500.. => Level::ERROR,
            400..=499 => Level::WARN,
            _ => Level::INFO,
        };

        let mut record = self
            .logger
            .record(level)
            .field("status", status)
            .field("method", req.method())
            .field("path", req.path())
            .field("query", serde_json::to_value(req.query_params()).unwrap_or_default())
            .field("header", serde_json::to_value(req.headers()).unwrap_or_default())
            .field("protocol", req.protocol())
            .field("client_ip", req.client_ip())
            .field("useragent", req.user_agent())
            .field("referer", req.referer())
            .field("latency", started.elapsed().as_secs_f64() * 1000.0)
            .field("target", req.host())
            .field("server", self.server.as_str());
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            record = record.field("body", body_field(&body));
        }
        record.send();
    }
}

/// JSON bodies are embedded as JSON; anything else as a string.
fn body_field(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::from(String::from_utf8_lossy(body).into_owned()))
}

impl Middleware for AccessLog {
    fn handle(self: Arc<Self>, cx: Context, req: SharedRequest, next: Next) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            if !(self.log_path)(req.path()) {
                return next.run(cx, req).await;
            }

            let started = Instant::now();
            let body = if (self.log_body)(req.as_ref()) && req.content_length() > 0 {
                match req.body().await {
                    Ok(body) => Some(body),
                    Err(e) => {
                        tracing::warn!(path = req.path(), "access log could not read body: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let res = next.run(cx, Arc::clone(&req)).await;
            self.write(req.as_ref(), &res, started, body);
            res
        })
    }
}

impl std::fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLog").field("server", &self.server).finish_non_exhaustive()
    }
}
