//! Minimal tsu-api example: a JSON search endpoint behind the full
//! middleware stack.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/healthz
//!   curl -X POST http://localhost:3000/search \
//!        -H 'content-type: application/json' \
//!        -H 'traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01' \
//!        -d '{"keyword":"hello","limit":3}'
//!   curl -X POST http://localhost:3000/search -d '{"keyword":"hello","limit":"3"}'
//!   curl http://localhost:3000/panic

use serde::{Deserialize, Serialize};
use tsu_api::middleware::{AccessLog, Health, Pipeline, Recovery, Tracing, TracingConfig};
use tsu_api::{ApiError, Context, ErrorKind, Json, Response, Server, SharedRequest};

#[derive(Deserialize)]
struct SearchQuery {
    keyword: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Serialize)]
struct Hit {
    rank: usize,
    title: String,
}

#[tokio::main]
async fn main() -> Result<(), tsu_api::Error> {
    tracing_subscriber::fmt::init();

    let tracing = Tracing::new(TracingConfig::new("search-api", "development")).runtime_metrics(true);
    if let Err(e) = tracing.start_tracer() {
        tracing::warn!("tracing disabled: {e}");
    }

    let app = Pipeline::new()
        .with(Health::new("/healthz", "ok"))
        .with(tracing.clone())
        .with(
            AccessLog::new(std::io::stdout)
                .server_name("search-api-1")
                .skip_paths(["/favicon.ico"])
                .body_filter(|req| req.method() == "POST"),
        )
        .with(Recovery::new(std::io::stderr))
        .build(route);

    let served = Server::bind("0.0.0.0:3000").serve(app).await;
    tracing.stop_tracer();
    served
}

// Routing belongs to the transport; a match is enough here.
async fn route(cx: Context, req: SharedRequest) -> Result<Response, ApiError> {
    match (req.method(), req.path()) {
        ("POST", "/search") => search(cx, req).await,
        ("GET", "/panic") => panic!("connection error"),
        _ => Ok(Response::not_found(format!("no route for {} {}", req.method(), req.path()))),
    }
}

// POST /search
//
// A type mismatch in the body comes back as 400 binding_error via `?`.
async fn search(_cx: Context, req: SharedRequest) -> Result<Response, ApiError> {
    let query: SearchQuery = req.bind().await?;
    if query.keyword.trim().is_empty() {
        return Err(ErrorKind::VALIDATION.new("keyword is required"));
    }

    let hits: Vec<Hit> = (1..=query.limit)
        .map(|rank| Hit { rank, title: format!("{} #{rank}", query.keyword) })
        .collect();
    Ok(Response::ok(Json(hits)))
}
