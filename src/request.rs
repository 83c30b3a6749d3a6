//! Incoming request contract and its HTTP adapter.
//!
//! Middlewares and handlers depend only on the [`Request`] trait. The one
//! concrete implementation, [`HttpRequest`], adapts an `http::Request<B>` from
//! whatever transport produced it (hyper in [`Server`](crate::Server), an
//! in-memory body in tests).
//!
//! # Headers
//!
//! [`Request::headers`] returns every value of every header, keyed by the
//! lower-case name (`http::HeaderMap` normalizes names on the way in).
//! [`Request::header`] coalesces duplicates into one value joined with `", "`,
//! the way RFC 9110 combines repeated fields. Lookups are case-insensitive.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body as HttpBody;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, OnceCell};

use crate::error::{ApiError, BoxError, Error, ErrorKind};
use crate::handler::BoxFuture;

const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_X_REAL_IP: &str = "x-real-ip";

/// Header names mapped to all of their values, in arrival order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// The request handle passed through a pipeline.
pub type SharedRequest = Arc<dyn Request>;

// ── Request contract ──────────────────────────────────────────────────────────

/// A normalized, transport-independent view of one inbound call.
///
/// Accessors never fail: unknown keys yield an empty string. The body is the
/// one exception, because reading it touches the transport.
pub trait Request: Send + Sync + 'static {
    fn method(&self) -> &str;
    fn path(&self) -> &str;

    /// The raw body. Read from the transport on first use and cached, so every
    /// later call (and [`bind`](dyn Request::bind)) sees the same bytes.
    fn body(&self) -> BoxFuture<'_, Result<Bytes, Error>>;

    fn headers(&self) -> Headers;

    /// All values of one header, in arrival order.
    fn header_values(&self, name: &str) -> Vec<String>;

    /// First value of a query parameter.
    fn query_param(&self, key: &str) -> String;

    /// Every query parameter, multiple values joined with `,`.
    fn query_params(&self) -> BTreeMap<String, String>;

    /// A path parameter bound by the router, e.g. `id` for `/users/{id}`.
    fn path_param(&self, key: &str) -> String;

    /// The peer address of the transport connection, if known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The target host: URI authority, falling back to the `Host` header.
    fn host(&self) -> String;

    /// Protocol version string, e.g. `HTTP/1.1`.
    fn protocol(&self) -> String;

    fn content_length(&self) -> u64;

    /// One header, duplicate values joined with `", "`.
    fn header(&self, name: &str) -> String {
        self.header_values(name).join(", ")
    }

    fn user_agent(&self) -> String {
        self.header("user-agent")
    }

    fn referer(&self) -> String {
        self.header("referer")
    }

    /// The originating client address.
    ///
    /// Precedence: first entry of `X-Forwarded-For`, then `X-Real-Ip`, then
    /// the host part of the connection's remote address. Empty when none of
    /// the three is available.
    fn client_ip(&self) -> String {
        let forwarded = self.header(HEADER_X_FORWARDED_FOR);
        if let Some(first) = forwarded.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_owned();
            }
        }
        let real_ip = self.header(HEADER_X_REAL_IP);
        if !real_ip.is_empty() {
            return real_ip;
        }
        self.remote_addr().map(|addr| addr.ip().to_string()).unwrap_or_default()
    }
}

impl dyn Request {
    /// Decodes the body as JSON into `T`.
    ///
    /// Every failure is an [`ErrorKind::BINDING`] error; the message tells a
    /// type mismatch, a syntax error and any other decode failure apart.
    pub async fn bind<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let body = self.body().await.map_err(|e| {
            let message = format!("Failed to bind object: error={e}");
            ErrorKind::BINDING.wrap_with(e, message)
        })?;
        decode_json(&body)
    }
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let mut de = serde_json::Deserializer::from_slice(body);
    let value = serde_path_to_error::deserialize(&mut de).map_err(|e| {
        let field = e.path().to_string();
        binding_error(body, &field, e.into_inner())
    })?;
    de.end().map_err(|e| binding_error(body, ".", e))?;
    Ok(value)
}

fn binding_error(body: &[u8], field: &str, err: serde_json::Error) -> ApiError {
    use serde_json::error::Category;

    let offset = byte_offset(body, err.line(), err.column());
    let text = err.to_string();
    // serde_json appends " at line L column C" to positioned errors.
    let reason = text.rsplit_once(" at line ").map_or(text.as_str(), |(head, _)| head);

    let message = match err.classify() {
        Category::Data => match parse_invalid_type(reason) {
            Some((got, expected)) => format!(
                "Unmarshal type error: expected={expected}, got={got}, field={field}, offset={offset}"
            ),
            None => format!("Failed to bind object: error={reason}, field={field}"),
        },
        Category::Syntax => format!("Syntax error: offset={offset}, error={reason}"),
        Category::Eof | Category::Io => format!("Failed to bind object: error={text}"),
    };
    ErrorKind::BINDING.wrap_with(err, message)
}

/// Splits serde's `invalid type: <got>, expected <expected>` message.
fn parse_invalid_type(reason: &str) -> Option<(&str, &str)> {
    reason.strip_prefix("invalid type: ")?.rsplit_once(", expected ")
}

/// Converts serde_json's 1-based line / column into a byte offset.
fn byte_offset(body: &[u8], line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let preceding: usize = body
        .split(|b| *b == b'\n')
        .take(line - 1)
        .map(|l| l.len() + 1)
        .sum();
    preceding + column
}

// ── HTTP adapter ──────────────────────────────────────────────────────────────

/// [`Request`] over an `http::Request<B>`.
///
/// The body stream is consumed at most once: the first [`Request::body`] call
/// collects it and caches the outcome, bytes or read error; every later call
/// returns the cache.
/// Designed for a single consumer per call, not for concurrent readers.
pub struct HttpRequest<B> {
    parts: http::request::Parts,
    stream: Mutex<Option<B>>,
    cached: OnceCell<Result<Bytes, String>>,
    size_hint: Option<u64>,
    query: Vec<(String, String)>,
    path_params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
}

impl<B> HttpRequest<B>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    pub fn new(req: http::Request<B>) -> Self {
        let (parts, body) = req.into_parts();
        let query = parts
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self {
            size_hint: body.size_hint().exact(),
            parts,
            stream: Mutex::new(Some(body)),
            cached: OnceCell::new(),
            query,
            path_params: HashMap::new(),
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Path parameters produced by an external router.
    pub fn with_path_params(mut self, params: HashMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    pub fn into_shared(self) -> SharedRequest {
        Arc::new(self)
    }

    async fn read_body(&self) -> Result<Bytes, String> {
        let stream = self.stream.lock().await.take();
        match stream {
            Some(body) => body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| e.into().to_string()),
            None => Ok(Bytes::new()),
        }
    }
}

impl<B> Request for HttpRequest<B>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn method(&self) -> &str {
        self.parts.method.as_str()
    }

    fn path(&self) -> &str {
        self.parts.uri.path()
    }

    fn body(&self) -> BoxFuture<'_, Result<Bytes, Error>> {
        Box::pin(async move {
            match self.cached.get_or_init(|| self.read_body()).await {
                Ok(bytes) => Ok(bytes.clone()),
                Err(message) => Err(Error::Body(message.clone())),
            }
        })
    }

    fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in &self.parts.headers {
            headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        headers
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect()
    }

    fn query_param(&self, key: &str) -> String {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    fn query_params(&self) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in &self.query {
            params
                .entry(key.clone())
                .and_modify(|joined| {
                    joined.push(',');
                    joined.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        params
    }

    fn path_param(&self, key: &str) -> String {
        self.path_params.get(key).cloned().unwrap_or_default()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn host(&self) -> String {
        match self.parts.uri.host() {
            Some(host) => host.to_owned(),
            None => self.header("host"),
        }
    }

    fn protocol(&self) -> String {
        format!("{:?}", self.parts.version)
    }

    fn content_length(&self) -> u64 {
        self.header("content-length")
            .parse()
            .ok()
            .or(self.size_hint)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::testing::RequestBuilder;

    #[derive(Debug, Deserialize)]
    struct Event {
        id: i64,
        name: String,
    }

    fn event_request(body: &str) -> SharedRequest {
        RequestBuilder::new("POST", "/events").body(body).build()
    }

    #[tokio::test]
    async fn exposes_normalized_fields() {
        let req = RequestBuilder::new("GET", "/events/123")
            .path_param("id", "123")
            .query("key1", "value1")
            .query("key2", "value2")
            .header("Content-Type", "application/json")
            .header("X-Request-Id", "req-12345")
            .header("User-Agent", "TestUserAgent")
            .header("Referer", "TestReferer")
            .body(r#"{"level":"info"}"#)
            .build();

        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/events/123");
        assert_eq!(req.header("x-request-id"), "req-12345");
        assert_eq!(req.header_values("X-Request-Id"), vec!["req-12345"]);
        assert_eq!(req.headers()["content-type"], vec!["application/json"]);
        assert_eq!(req.query_param("key1"), "value1");
        assert_eq!(req.query_param("unknown"), "");
        assert_eq!(req.query_params().len(), 2);
        assert_eq!(req.path_param("id"), "123");
        assert_eq!(req.path_param("unknown"), "");
        assert_eq!(req.client_ip(), "127.0.0.1");
        assert_eq!(req.user_agent(), "TestUserAgent");
        assert_eq!(req.referer(), "TestReferer");
        assert_eq!(req.host(), "localhost");
        assert_eq!(req.protocol(), "HTTP/1.1");
        assert_eq!(req.content_length(), 16);
    }

    #[tokio::test]
    async fn body_is_read_once_and_cached() {
        let req = event_request(r#"{"id":1,"name":"a"}"#);
        let first = req.body().await.unwrap();
        let second = req.body().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first[..], br#"{"id":1,"name":"a"}"#);

        let event: Event = req.bind().await.unwrap();
        assert_eq!(event.id, 1);
    }

    struct BrokenBody;

    impl HttpBody for BrokenBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
            let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
            std::task::Poll::Ready(Some(Err(err)))
        }
    }

    #[tokio::test]
    async fn body_read_failure_is_cached() {
        let req = HttpRequest::new(http::Request::new(BrokenBody)).into_shared();

        let first = req.body().await.unwrap_err();
        let second = req.body().await.unwrap_err();
        assert!(first.to_string().contains("connection reset"), "{first}");
        assert!(second.to_string().contains("connection reset"), "{second}");

        let err = req.bind::<Event>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BINDING);
        assert!(err.message().contains("connection reset"), "{}", err.message());
    }

    #[test]
    fn query_values_are_comma_joined() {
        let req = RequestBuilder::new("GET", "/search")
            .query("tag", "a")
            .query("tag", "b")
            .build();
        assert_eq!(req.query_param("tag"), "a");
        assert_eq!(req.query_params()["tag"], "a,b");
    }

    #[test]
    fn duplicate_headers_are_coalesced() {
        let req = RequestBuilder::new("GET", "/")
            .header("Accept", "text/html")
            .header("Accept", "application/json")
            .build();
        assert_eq!(req.header("accept"), "text/html, application/json");
        assert_eq!(req.headers()["accept"].len(), 2);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let req = RequestBuilder::new("GET", "/")
            .header("X-Forwarded-For", "a, b")
            .header("X-Real-Ip", "10.0.0.2")
            .build();
        assert_eq!(req.client_ip(), "a");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_remote_addr() {
        let req = RequestBuilder::new("GET", "/").header("X-Real-Ip", "10.0.0.2").build();
        assert_eq!(req.client_ip(), "10.0.0.2");

        let req = RequestBuilder::new("GET", "/").header("X-Forwarded-For", " ").build();
        assert_eq!(req.client_ip(), "127.0.0.1");

        let req = RequestBuilder::new("GET", "/").no_remote_addr().build();
        assert_eq!(req.client_ip(), "");
    }

    #[tokio::test]
    async fn bind_decodes_json() {
        let req = event_request(r#"{"id": 12345, "name": "Michael Jordan"}"#);
        let event: Event = req.bind().await.unwrap();
        assert_eq!(event.id, 12345);
        assert_eq!(event.name, "Michael Jordan");
    }

    #[tokio::test]
    async fn bind_reports_type_mismatch() {
        let req = event_request(r#"{"id":"12345","name":"Michael Jordan"}"#);
        let err = req.bind::<Event>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BINDING);
        let message = err.message();
        assert!(message.starts_with("Unmarshal type error:"), "{message}");
        assert!(message.contains("expected=i64"), "{message}");
        assert!(message.contains("got=string"), "{message}");
        assert!(message.contains("field=id"), "{message}");
        assert!(message.contains("offset="), "{message}");
    }

    #[tokio::test]
    async fn bind_reports_syntax_error() {
        let req = event_request("{\n  \"id\": 12345,,\n}");
        let err = req.bind::<Event>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BINDING);
        assert!(err.message().starts_with("Syntax error: offset="), "{}", err.message());
    }

    #[tokio::test]
    async fn bind_reports_empty_body() {
        let req = event_request("");
        let err = req.bind::<Event>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BINDING);
        assert!(err.message().starts_with("Failed to bind object: error=EOF"), "{}", err.message());
    }

    #[test]
    fn byte_offset_counts_previous_lines() {
        let body = b"{\n  \"id\": 1\n}";
        assert_eq!(byte_offset(body, 1, 1), 1);
        assert_eq!(byte_offset(body, 2, 3), 5);
        assert_eq!(byte_offset(body, 0, 0), 0);
    }
}
