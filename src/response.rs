//! Outgoing response value and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] is a status, a [`Body`] and a header map seeded with
//! `content-type: application/json`. The body is interpreted by its variant
//! every time it is read or rendered:
//!
//! | Body | Rendered as |
//! |---|---|
//! | [`ApiError`] | `{"code": …, "message": …}` as-is |
//! | any other failure | wrapped as an `unexpected_error` [`ApiError`] |
//! | bytes | pre-formed JSON, embedded verbatim |
//! | string `{…}` | pre-formed JSON, embedded verbatim |
//! | any other string | `{"message": <string>}` |
//! | [`Json<T>`] | `serde_json` encoding of `T` |
//! | empty | no body |
//!
//! ```rust
//! use tsu_api::{Json, Response};
//!
//! Response::ok("OK");                                    // {"message":"OK"}
//! Response::created(r#"{"id":42}"#);                     // verbatim
//! Response::ok(Json(vec![1, 2, 3]))
//!     .with_header("location", "/numbers");
//! Response::bad_request("name is required");             // unexpected_error
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use serde::Serialize;

use crate::error::{ApiError, BoxError, Error, ErrorKind};

const CONTENT_TYPE: &str = "Content-Type";
const APPLICATION_JSON: &str = "application/json";

// ── Body ──────────────────────────────────────────────────────────────────────

/// A structured value that can be rendered as JSON on demand.
///
/// Blanket-implemented for every `Serialize + Send + Sync + 'static` type;
/// exists so [`Body`] can hold any of them behind one pointer.
pub trait JsonBody: Send + Sync + 'static {
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl<T: Serialize + Send + Sync + 'static> JsonBody for T {
    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Wraps a serializable value so it can be used as a response body.
#[derive(Clone, Debug, Default)]
pub struct Json<T>(pub T);

/// The uninterpreted body of a [`Response`]. Cloning is cheap.
#[derive(Clone, Default)]
pub enum Body {
    Typed(ApiError),
    Failure(Arc<dyn std::error::Error + Send + Sync + 'static>),
    Bytes(Bytes),
    Text(String),
    Value(Arc<dyn JsonBody>),
    #[default]
    Empty,
}

impl Body {
    /// Classifies an arbitrary failure value.
    pub fn from_error(err: impl Into<BoxError>) -> Self {
        match err.into().downcast::<ApiError>() {
            Ok(typed) => Self::Typed(*typed),
            Err(other) => Self::Failure(Arc::from(other)),
        }
    }

    /// Interprets the body. Evaluated on every call; nothing is cached.
    pub fn payload(&self) -> Payload<'_> {
        match self {
            Self::Typed(err) => Payload::Error(err.clone()),
            Self::Failure(err) => Payload::Error(ErrorKind::UNEXPECTED.wrap(Arc::clone(err))),
            Self::Bytes(bytes) => Payload::Raw(bytes),
            Self::Text(text) if text.starts_with('{') && text.ends_with('}') => {
                Payload::Raw(text.as_bytes())
            }
            Self::Text(text) => Payload::Message(text),
            Self::Value(value) => Payload::Value(value.as_ref()),
            Self::Empty => Payload::Empty,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(err) => f.debug_tuple("Typed").field(err).finish(),
            Self::Failure(err) => f.debug_tuple("Failure").field(&err.to_string()).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<ApiError> for Body {
    fn from(err: ApiError) -> Self {
        Self::Typed(err)
    }
}

impl<T: Serialize + Send + Sync + 'static> From<Json<T>> for Body {
    fn from(Json(value): Json<T>) -> Self {
        Self::Value(Arc::new(value))
    }
}

impl From<()> for Body {
    fn from((): ()) -> Self {
        Self::Empty
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// A body after interpretation, ready to be rendered.
pub enum Payload<'a> {
    Error(ApiError),
    /// Pre-formed JSON, embedded verbatim.
    Raw(&'a [u8]),
    /// A plain string, rendered as `{"message": …}`.
    Message(&'a str),
    Value(&'a dyn JsonBody),
    Empty,
}

impl Payload<'_> {
    /// Renders the payload as JSON bytes; `None` for an empty body.
    pub fn to_json(&self) -> Result<Option<Vec<u8>>, Error> {
        let bytes = match self {
            Self::Error(err) => serde_json::to_vec(err)?,
            Self::Raw(raw) => raw.to_vec(),
            Self::Message(message) => serde_json::to_vec(&serde_json::json!({ "message": message }))?,
            Self::Value(value) => serde_json::to_vec(&value.to_json()?)?,
            Self::Empty => return Ok(None),
        };
        Ok(Some(bytes))
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing response value.
///
/// Built once per call by a status constructor, optionally decorated with
/// [`with_header`](Response::with_header), and rendered once at the transport
/// boundary.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    body: Body,
    headers: BTreeMap<String, String>,
}

impl Response {
    /// A response with an arbitrary status.
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(CONTENT_TYPE.to_owned(), APPLICATION_JSON.to_owned());
        Self { status, body: body.into(), headers }
    }

    /// `200 OK`.
    pub fn ok(body: impl Into<Body>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// `201 Created`.
    pub fn created(body: impl Into<Body>) -> Self {
        Self::new(StatusCode::CREATED, body)
    }

    /// `204 No Content`.
    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT, Body::Empty)
    }

    /// `400 Bad Request`.
    pub fn bad_request(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Body::from_error(err))
    }

    /// `401 Unauthorized`.
    pub fn unauthorized(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, Body::from_error(err))
    }

    /// `404 Not Found`.
    pub fn not_found(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::NOT_FOUND, Body::from_error(err))
    }

    /// `407 Proxy Authentication Required`.
    pub fn proxy_auth_required(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED, Body::from_error(err))
    }

    /// `409 Conflict`.
    pub fn conflict(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::CONFLICT, Body::from_error(err))
    }

    /// `500 Internal Server Error`.
    pub fn internal_server_error(err: impl Into<BoxError>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, Body::from_error(err))
    }

    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The interpreted body.
    pub fn body(&self) -> Payload<'_> {
        self.body.payload()
    }

    /// The body rendered as JSON; `None` when there is no body.
    pub fn body_json(&self) -> Result<Option<Vec<u8>>, Error> {
        self.body.payload().to_json()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Sets a header, replacing any previous value for the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Renders the response for the transport.
    ///
    /// A body that cannot be encoded does not abort the call: it is logged and
    /// replaced by a `500` carrying a `json_encode_error`.
    pub fn into_http(self) -> http::Response<Full<Bytes>> {
        match self.body_json() {
            Ok(body) => build_http(self.status, &self.headers, body.unwrap_or_default()),
            Err(e) => {
                tracing::error!(status = self.status.as_u16(), "response encoding failed: {e}");
                let fallback = ErrorKind::JSON_ENCODE.wrap_with(e, "Failed to encode json object");
                let body = serde_json::to_vec(&fallback).unwrap_or_default();
                build_http(StatusCode::INTERNAL_SERVER_ERROR, &self.headers, body)
            }
        }
    }
}

fn build_http(
    status: StatusCode,
    headers: &BTreeMap<String, String>,
    body: Vec<u8>,
) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = status;
    for (name, value) in headers {
        match (
            http::HeaderName::try_from(name.as_str()),
            http::HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                res.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header"),
        }
    }
    res
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into a [`Response`].
///
/// Lets handlers return `Result<Response, ApiError>` and use `?` on
/// [`bind`](crate::Request::bind):
///
/// ```rust
/// use tsu_api::{ApiError, Context, Response, SharedRequest};
///
/// #[derive(serde::Deserialize)]
/// struct NewUser { name: String }
///
/// async fn create_user(_cx: Context, req: SharedRequest) -> Result<Response, ApiError> {
///     let user: NewUser = req.bind().await?;
///     Ok(Response::created(format!(r#"{{"name":"{}"}}"#, user.name)))
/// }
/// ```
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

/// A typed error maps to `400` when the input was at fault, `500` otherwise.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.kind() {
            ErrorKind::BINDING | ErrorKind::VALIDATION => Response::bad_request(self),
            _ => Response::internal_server_error(self),
        }
    }
}

impl<E: IntoResponse> IntoResponse for Result<Response, E> {
    fn into_response(self) -> Response {
        self.unwrap_or_else(IntoResponse::into_response)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn rendered(res: &Response) -> Value {
        serde_json::from_slice(&res.body_json().unwrap().unwrap()).unwrap()
    }

    #[test]
    fn constructors_fix_status_and_content_type() {
        let cases = [
            (Response::ok("OK"), 200),
            (Response::created(r#"{"message": "OK"}"#), 201),
            (Response::no_content(), 204),
            (Response::bad_request(ErrorKind::VALIDATION.new("error")), 400),
            (Response::unauthorized("error"), 401),
            (Response::not_found("error"), 404),
            (Response::proxy_auth_required("error"), 407),
            (Response::conflict("error"), 409),
            (Response::internal_server_error("error"), 500),
        ];
        for (res, status) in cases {
            assert_eq!(res.status(), status);
            assert_eq!(res.headers().len(), 1);
            assert_eq!(res.headers()["Content-Type"], "application/json");
        }
    }

    #[test]
    fn plain_string_is_wrapped_as_message() {
        let res = Response::ok("OK");
        assert_eq!(res.body_json().unwrap().unwrap(), br#"{"message":"OK"}"#);
    }

    #[test]
    fn json_string_and_bytes_are_verbatim() {
        let res = Response::ok(r#"{"message":"OK"}"#);
        assert_eq!(res.body_json().unwrap().unwrap(), br#"{"message":"OK"}"#);

        let res = Response::ok(br#"{"message": "OK"}"#.to_vec());
        assert!(matches!(res.body(), Payload::Raw(raw) if raw == br#"{"message": "OK"}"#));
    }

    #[test]
    fn structured_values_are_serialized() {
        #[derive(Serialize)]
        struct Job {
            id: u32,
            status: &'static str,
        }
        let res = Response::ok(Json(Job { id: 1000, status: "succeeded" }));
        assert_eq!(rendered(&res), json!({"id": 1000, "status": "succeeded"}));
    }

    #[test]
    fn typed_errors_are_kept_and_others_wrapped() {
        let res = Response::bad_request(ErrorKind::VALIDATION.new("validation error"));
        match res.body() {
            Payload::Error(err) => assert_eq!(err.kind(), ErrorKind::VALIDATION),
            _ => panic!("expected an error payload"),
        }

        let io = std::io::Error::new(std::io::ErrorKind::Other, "unknown error");
        let res = Response::internal_server_error(io);
        assert_eq!(rendered(&res), json!({"code": "unexpected_error", "message": "unknown error"}));
    }

    #[test]
    fn no_content_has_no_body() {
        assert!(Response::no_content().body_json().unwrap().is_none());
        assert_eq!(Response::no_content().into_http().status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn with_header_adds_to_defaults() {
        let res = Response::ok("OK").with_header("X-Custom-Id", "123");
        assert_eq!(res.headers().len(), 2);
        assert_eq!(res.headers()["X-Custom-Id"], "123");
        assert_eq!(res.headers()["Content-Type"], "application/json");
    }

    #[test]
    fn unencodable_body_becomes_internal_error() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "non-string key");
        let res = Response::ok(Json(map));
        assert!(matches!(res.body_json(), Err(Error::Serialization(_))));

        let http = res.into_http();
        assert_eq!(http.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn result_handlers_map_binding_errors_to_bad_request() {
        let res: Result<Response, ApiError> = Err(ErrorKind::BINDING.new("bad body"));
        assert_eq!(res.into_response().status(), 400);
        let res: Result<Response, ApiError> = Err(ErrorKind::UNEXPECTED.new("boom"));
        assert_eq!(res.into_response().status(), 500);
    }

    #[test]
    fn responses_convert_to_themselves() {
        let res = Response::created("OK").with_header("X-Custom-Id", "123").into_response();
        assert_eq!(res.status(), 201);
        assert_eq!(res.headers()["X-Custom-Id"], "123");

        let res: Result<Response, ApiError> = Ok(Response::no_content());
        assert_eq!(res.into_response().status(), 204);
    }
}
