//! # tsu-api
//!
//! Request/response contracts and a middleware pipeline for Rust services
//! behind a reverse proxy.
//!
//! ## The contract
//!
//! Handlers see a [`Request`] trait object, never the transport type, and
//! return a [`Response`] value. The transport (the bundled hyper [`Server`],
//! or anything else that can produce a [`Request`]) owns sockets, routing and
//! TLS. This crate owns what sits between the two:
//!
//! - **Request access**: headers, query and path parameters, client IP
//!   resolution, a body read at most once, JSON binding with classified errors
//! - **Response values**: status constructors, a body that knows how to
//!   render itself as JSON, typed domain errors
//! - **Middleware**: ordered composition plus access logging, panic recovery,
//!   distributed tracing and a liveness check
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use tsu_api::middleware::{AccessLog, Health, Pipeline, Recovery};
//! use tsu_api::{Context, Response, Server, SharedRequest};
//!
//! #[derive(Deserialize)]
//! struct Search {
//!     keyword: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tsu_api::Error> {
//!     let app = Pipeline::new()
//!         .with(Health::new("/healthz", "ok"))
//!         .with(AccessLog::new(std::io::stdout).server_name("api-1"))
//!         .with(Recovery::new(std::io::stderr))
//!         .build(search);
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn search(_cx: Context, req: SharedRequest) -> Response {
//!     match req.bind::<Search>().await {
//!         Ok(query) => Response::ok(format!("searching for {}", query.keyword)),
//!         Err(e) => Response::bad_request(e),
//!     }
//! }
//! ```

mod context;
mod error;
mod handler;
mod log;
mod request;
mod response;
mod server;

pub mod middleware;
pub mod testing;

pub use context::{CancelHandle, Context};
pub use error::{ApiError, BoxError, Error, ErrorKind};
pub use handler::{BoxFuture, Handler, Service};
pub use log::{Logger, Record};
pub use request::{Headers, HttpRequest, Request, SharedRequest};
pub use response::{Body, IntoResponse, Json, JsonBody, Payload, Response};
pub use server::Server;
