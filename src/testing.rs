//! Test helpers.
//!
//! [`RequestBuilder`] builds a [`SharedRequest`] backed by an in-memory body,
//! shaped like a request that arrived over a real connection: remote address
//! `127.0.0.1:80`, target host `localhost`, protocol `HTTP/1.1`.
//! [`LogSink`] captures the records written by the logging middlewares.
//!
//! ```rust
//! use tsu_api::testing::RequestBuilder;
//!
//! let req = RequestBuilder::new("POST", "/search")
//!     .header("content-type", "application/json")
//!     .query("pretty", "true")
//!     .body(r#"{"keyword":"hello"}"#)
//!     .build();
//!
//! assert_eq!(req.client_ip(), "127.0.0.1");
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http_body_util::Full;
use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

use crate::request::{HttpRequest, SharedRequest};

const REMOTE_ADDR: &str = "127.0.0.1:80";
const HOST: &str = "localhost";

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: String,
    path: String,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    path_params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_owned(),
            path: path.to_owned(),
            body: Vec::new(),
            headers: Vec::new(),
            query: Vec::new(),
            path_params: HashMap::new(),
            remote_addr: REMOTE_ADDR.parse().ok(),
        }
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Appends a header value; repeating a name adds another value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn path_param(mut self, key: &str, value: &str) -> Self {
        self.path_params.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Builds the request without a connection address.
    pub fn no_remote_addr(mut self) -> Self {
        self.remote_addr = None;
        self
    }

    /// # Panics
    ///
    /// Panics if the method, path, or a header is not valid HTTP.
    pub fn build(self) -> SharedRequest {
        let mut uri = format!("http://{HOST}{}", self.path);
        if !self.query.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.query)
                .finish();
            uri.push('?');
            uri.push_str(&encoded);
        }

        let mut builder = http::Request::builder()
            .method(self.method.as_str())
            .uri(uri)
            .version(http::Version::HTTP_11);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .body(Full::new(Bytes::from(self.body)))
            .unwrap_or_else(|e| panic!("invalid test request: {e}"));

        let mut req = HttpRequest::new(req).with_path_params(self.path_params);
        if let Some(addr) = self.remote_addr {
            req = req.with_remote_addr(addr);
        }
        req.into_shared()
    }
}

// ── Log capture ───────────────────────────────────────────────────────────────

/// In-memory log sink. Clones share one buffer, so keep a clone to read
/// back what a middleware wrote.
///
/// ```rust
/// use tsu_api::middleware::Recovery;
/// use tsu_api::testing::LogSink;
///
/// let sink = LogSink::default();
/// let recovery = Recovery::new(sink.clone());
/// # let _ = recovery;
/// assert!(sink.records().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct LogSink(Arc<Mutex<Vec<u8>>>);

impl LogSink {
    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer()).into_owned()
    }

    /// Every line written so far, parsed as JSON.
    ///
    /// # Panics
    ///
    /// Panics if a line is not valid JSON.
    pub fn records(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("invalid log line {line:?}: {e}")))
            .collect()
    }
}

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn clones_share_the_buffer() {
        let sink = LogSink::default();
        let mut writer = sink.make_writer();
        writer.write_all(b"{\"level\":\"info\"}\n{\"level\":\"warn\"}\n").unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["level"], "warn");
        assert!(!sink.is_empty());
    }
}
