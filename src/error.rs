//! Error types.
//!
//! Two families live here and they never mix:
//!
//! - [`Error`] surfaces infrastructure failures: binding a port, reading a
//!   transport body, encoding a response body, starting the tracer.
//! - [`ApiError`] is a typed domain failure. It travels inside a
//!   [`Response`](crate::Response) body and is what the client sees.

use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeStruct, Serializer};

/// A boxed, thread-safe error value. Anything that is a `std::error::Error`
/// (and plain strings) converts into this.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by tsu-api's fallible operations.
///
/// Application-level errors (400, 404, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("failed to encode json object: error={0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tracer: {0}")]
    Tracer(String),
}

// ── ErrorKind ─────────────────────────────────────────────────────────────────

/// The machine-readable category of an [`ApiError`], serialized as `code`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ErrorKind(&'static str);

impl ErrorKind {
    /// A request body could not be decoded into the target type.
    pub const BINDING: Self = Self("binding_error");
    /// A response body could not be encoded as JSON.
    pub const JSON_ENCODE: Self = Self("json_encode_error");
    /// A failure with no declared domain kind.
    pub const UNEXPECTED: Self = Self("unexpected_error");
    /// Input that decoded fine but failed application validation.
    pub const VALIDATION: Self = Self("validation_error");

    /// Declares an application-specific kind, e.g. `ErrorKind::custom("quota_exceeded")`.
    pub const fn custom(code: &'static str) -> Self {
        Self(code)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }

    /// Builds an error of this kind from a message.
    pub fn new(self, message: impl Into<String>) -> ApiError {
        ApiError { kind: self, message: message.into(), source: None }
    }

    /// Wraps an underlying failure, reusing its message.
    pub fn wrap(self, source: impl Into<BoxError>) -> ApiError {
        let source: BoxError = source.into();
        ApiError { kind: self, message: source.to_string(), source: Some(Arc::from(source)) }
    }

    /// Wraps an underlying failure under a new message.
    pub fn wrap_with(self, source: impl Into<BoxError>, message: impl Into<String>) -> ApiError {
        ApiError { kind: self, message: message.into(), source: Some(Arc::from(source.into())) }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

// ── ApiError ──────────────────────────────────────────────────────────────────

/// A typed domain error. Serializes as `{"code": "...", "message": "..."}`.
///
/// Cheap to clone: the optional source is reference-counted so the same error
/// can back a response body that is rendered more than once.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classifies an arbitrary failure: an `ApiError` is kept as-is, anything
    /// else becomes an [`ErrorKind::UNEXPECTED`] wrapper.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<ApiError>() {
            Ok(typed) => *typed,
            Err(other) => ErrorKind::UNEXPECTED.wrap(other),
        }
    }
}

impl Serialize for ApiError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ApiError", 2)?;
        state.serialize_field("code", self.kind.as_str())?;
        state.serialize_field("message", &self.message)?;
        state.end()
    }
}
