use opentelemetry::trace::Status;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;
use serde::Deserialize;
use serde_json::{Value, json};
use tsu_api::middleware::{AccessLog, Health, Pipeline, Recovery, Tracing, TracingConfig};
use tsu_api::testing::{LogSink, RequestBuilder};
use tsu_api::{ApiError, Context, ErrorKind, Response, Service, SharedRequest};

fn body(res: &Response) -> Value {
    serde_json::from_slice(&res.body_json().unwrap().unwrap()).unwrap()
}

#[derive(Deserialize)]
struct Search {
    keyword: String,
}

async fn search(_cx: Context, req: SharedRequest) -> Result<Response, ApiError> {
    if req.path() == "/panic" {
        panic!("connection error");
    }
    let query: Search = req.bind().await?;
    if query.keyword.is_empty() {
        return Err(ErrorKind::VALIDATION.new("keyword is required"));
    }
    Ok(Response::ok(format!("found {}", query.keyword)))
}

struct Stack {
    service: Service,
    access: LogSink,
    faults: LogSink,
    spans: InMemorySpanExporter,
}

/// health → tracing → access log → recovery → handler
fn stack() -> Stack {
    let access = LogSink::default();
    let faults = LogSink::default();
    let spans = InMemorySpanExporter::default();
    let provider = TracerProvider::builder().with_simple_exporter(spans.clone()).build();

    let service = Pipeline::new()
        .with(Health::new("/health", "ok"))
        .with(Tracing::new(TracingConfig::new("search-api", "test")).tracer_provider(provider))
        .with(
            AccessLog::new(access.clone())
                .server_name("api-1")
                .body_filter(|req| req.method() == "POST"),
        )
        .with(Recovery::new(faults.clone()))
        .build(search);

    Stack { service, access, faults, spans }
}

#[tokio::test]
async fn successful_call_is_logged_and_traced() {
    let stack = stack();
    let req = RequestBuilder::new("POST", "/search")
        .header("x-forwarded-for", "10.0.0.7, 10.0.0.1")
        .body(r#"{"keyword":"hello"}"#)
        .build();

    let res = stack.service.call(Context::background(), req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body(&res), json!({"message": "found hello"}));

    let access = stack.access.records();
    assert_eq!(access.len(), 1);
    assert_eq!(access[0]["level"], "info");
    assert_eq!(access[0]["client_ip"], "10.0.0.7");
    assert_eq!(access[0]["server"], "api-1");
    assert_eq!(access[0]["body"], json!({"keyword": "hello"}));

    let spans = stack.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::Unset);
    assert!(stack.faults.is_empty());
}

#[tokio::test]
async fn binding_errors_become_bad_requests() {
    let stack = stack();
    let req = RequestBuilder::new("POST", "/search").body(r#"{"keyword":42}"#).build();

    let res = stack.service.call(Context::background(), req).await;
    assert_eq!(res.status(), 400);
    let body = body(&res);
    assert_eq!(body["code"], "binding_error");
    assert!(body["message"].as_str().unwrap().starts_with("Unmarshal type error:"));

    assert_eq!(stack.access.records()[0]["level"], "warn");
    let spans = stack.spans.get_finished_spans().unwrap();
    assert_eq!(spans[0].status, Status::error("400 Bad Request"));
}

#[tokio::test]
async fn panics_are_recovered_inside_the_access_log() {
    let stack = stack();
    let res = stack
        .service
        .call(Context::background(), RequestBuilder::new("GET", "/panic").build())
        .await;

    assert_eq!(res.status(), 500);
    assert_eq!(body(&res), json!({"code": "unexpected_error", "message": "connection error"}));

    let faults = stack.faults.records();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0]["error"], "connection error");

    let access = stack.access.records();
    assert_eq!(access.len(), 1);
    assert_eq!(access[0]["level"], "error");
    assert_eq!(access[0]["status"], 500);

    let spans = stack.spans.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, Status::error("500 Internal Server Error"));
}

#[tokio::test]
async fn health_checks_bypass_everything_registered_after_it() {
    let stack = stack();
    let res = stack
        .service
        .call(Context::background(), RequestBuilder::new("GET", "/health").build())
        .await;

    assert_eq!(res.status(), 200);
    assert_eq!(body(&res), json!({"message": "ok"}));
    assert!(stack.access.is_empty());
    assert!(stack.spans.get_finished_spans().unwrap().is_empty());
}

#[tokio::test]
async fn handler_sees_the_callers_cancellation() {
    let service = Pipeline::new()
        .with(Tracing::new(TracingConfig::default()).tracer_provider(TracerProvider::builder().build()))
        .build(|cx: Context, _req: SharedRequest| async move {
            cx.cancelled().await;
            Response::ok("cancelled")
        });

    let (cx, cancel) = Context::with_cancel();
    let call = tokio::spawn(service.call(cx, RequestBuilder::new("GET", "/wait").build()));
    cancel.cancel();

    let res = call.await.unwrap();
    assert_eq!(body(&res), json!({"message": "cancelled"}));
}
