//! OpenAI-compatible provider against a local stub endpoint.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use inbox_triage::error::LlmError;
use inbox_triage::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider, OpenAiCompatProvider};

#[derive(Clone)]
struct Stub {
    status: StatusCode,
    reply: Value,
    extra_headers: Vec<(&'static str, &'static str)>,
    seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn completions(State(stub): State<Stub>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    stub.seen.lock().unwrap().push((auth, body));

    let mut response_headers = HeaderMap::new();
    for (name, value) in &stub.extra_headers {
        response_headers.insert(*name, value.parse().unwrap());
    }
    (stub.status, response_headers, Json(stub.reply.clone()))
}

async fn start_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(stub);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}/v1")
}

fn stub(status: StatusCode, reply: Value) -> Stub {
    Stub {
        status,
        reply,
        extra_headers: Vec::new(),
        seen: Arc::default(),
    }
}

fn request() -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system("classify"),
        ChatMessage::user("email"),
    ])
    .with_temperature(0.3)
    .with_top_p(0.95)
    .with_max_tokens(1024)
}

fn provider(base_url: &str) -> OpenAiCompatProvider {
    OpenAiCompatProvider::new(base_url, SecretString::from("nv-key"), "qwen/qwen3-next-80b-a3b-instruct")
        .unwrap()
}

#[tokio::test]
async fn sends_request_and_parses_reply() {
    let stub = stub(
        StatusCode::OK,
        json!({
            "id": "cmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "{\"needsReply\": true}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 321, "completion_tokens": 12, "total_tokens": 333}
        }),
    );
    let seen = Arc::clone(&stub.seen);
    let base = start_stub(stub).await;

    let response = provider(&base).complete(request()).await.unwrap();

    assert_eq!(response.content, "{\"needsReply\": true}");
    assert_eq!(response.input_tokens, 321);
    assert_eq!(response.output_tokens, 12);
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.response_id.as_deref(), Some("cmpl-1"));

    let seen = seen.lock().unwrap();
    let (auth, body) = &seen[0];
    assert_eq!(auth.as_deref(), Some("Bearer nv-key"));
    assert_eq!(body["model"], "qwen/qwen3-next-80b-a3b-instruct");
    assert_eq!(body["max_tokens"], 1024);
    assert_eq!(body["stream"], false);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "email");
}

#[tokio::test]
async fn unauthorized_maps_to_auth_failed() {
    let base = start_stub(stub(StatusCode::UNAUTHORIZED, json!({"error": "bad key"}))).await;
    let err = provider(&base).complete(request()).await.unwrap_err();
    assert!(matches!(err, LlmError::AuthFailed { .. }));
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let mut s = stub(StatusCode::TOO_MANY_REQUESTS, json!({"error": "slow down"}));
    s.extra_headers.push(("retry-after", "7"));
    let base = start_stub(s).await;

    let err = provider(&base).complete(request()).await.unwrap_err();
    match err {
        LlmError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Some(std::time::Duration::from_secs(7)));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_includes_body() {
    let base = start_stub(stub(StatusCode::BAD_GATEWAY, json!({"error": "upstream down"}))).await;
    let err = provider(&base).complete(request()).await.unwrap_err();
    match err {
        LlmError::RequestFailed { reason, .. } => {
            assert!(reason.contains("502"));
            assert!(reason.contains("upstream down"));
        }
        other => panic!("expected request failure, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_choices_is_invalid_response() {
    let base = start_stub(stub(StatusCode::OK, json!({"id": "x", "choices": []}))).await;
    let err = provider(&base).complete(request()).await.unwrap_err();
    assert!(matches!(err, LlmError::InvalidResponse { .. }));
}

#[tokio::test]
async fn unreachable_endpoint_is_request_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = provider(&format!("http://127.0.0.1:{port}/v1"))
        .complete(request())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::RequestFailed { .. }));
}
