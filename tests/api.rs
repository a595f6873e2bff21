use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

struct TestContext {
    router: Router,
    upstream_calls: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct UpstreamState {
    calls: Arc<AtomicUsize>,
}

fn request_text(body: &Value) -> String {
    body.get("messages")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn stream_fixture() -> Response {
    let mut events: Vec<Result<Event, Infallible>> = Vec::new();
    events.push(Ok(Event::default().data(
        json!({
            "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
        })
        .to_string(),
    )));
    for i in 0..20 {
        events.push(Ok(Event::default().data(
            json!({
                "choices": [{"index": 0, "delta": {"content": format!("tok{i} ")}, "finish_reason": null}]
            })
            .to_string(),
        )));
    }
    events.push(Ok(Event::default().data(
        json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 20, "total_tokens": 27}
        })
        .to_string(),
    )));
    events.push(Ok(Event::default().data("[DONE]")));
    Sse::new(futures_util::stream::iter(events)).into_response()
}

async fn chat_completions(
    axum::extract::State(state): axum::extract::State<UpstreamState>,
    Json(body): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let text = request_text(&body);
    if text.contains("force-400") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {"code": "upstream_bad", "message": "secret upstream detail"}
            })),
        )
            .into_response();
    }
    if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
        return stream_fixture();
    }
    Json(json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1,
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("echo: {text}")},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    }))
    .into_response()
}

async fn messages(
    axum::extract::State(state): axum::extract::State<UpstreamState>,
    Json(_body): Json<Value>,
) -> Json<Value> {
    state.calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-upstream",
        "content": [
            {"type": "tool_use", "id": "tu_1", "name": "get_weather", "input": {"city": "SF"}}
        ],
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 10, "output_tokens": 5}
    }))
}

async fn start_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .with_state(UpstreamState {
            calls: calls.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, calls)
}

async fn setup(cache_disabled: bool) -> TestContext {
    let (upstream_addr, upstream_calls) = start_upstream().await;
    let base_url = format!("http://{upstream_addr}");

    let runtime = omnirelay::config::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        config_path: String::new(),
        request_timeout_ms: 5_000,
        cache_ttl_secs: 60,
        cache_disabled,
        debug_payloads: false,
    };
    let config = omnirelay::config::GatewayConfig {
        providers: vec![
            omnirelay::config::ProviderConfig {
                id: "up-chat".to_string(),
                kind: omnirelay::config::ProviderKind::OpenaiChat,
                base_url: base_url.clone(),
                auth: omnirelay::config::ProviderAuthConfig {
                    auth_type: omnirelay::config::ProviderAuthType::Bearer,
                    value: "upstream-key".to_string(),
                    header_name: None,
                    query_name: None,
                },
            },
            omnirelay::config::ProviderConfig {
                id: "up-msg".to_string(),
                kind: omnirelay::config::ProviderKind::Anthropic,
                base_url,
                auth: omnirelay::config::ProviderAuthConfig {
                    auth_type: omnirelay::config::ProviderAuthType::Header,
                    value: "upstream-key".to_string(),
                    header_name: Some("x-api-key".to_string()),
                    query_name: None,
                },
            },
        ],
        models: vec![
            omnirelay::registry::ModelRecord {
                model: "test-model".to_string(),
                provider_id: "up-chat".to_string(),
                upstream_model: "gpt-test".to_string(),
                capabilities: omnirelay::registry::ModelCapabilities::default(),
                pricing: omnirelay::registry::ModelPricing::default(),
            },
            omnirelay::registry::ModelRecord {
                model: "claude-test".to_string(),
                provider_id: "up-msg".to_string(),
                upstream_model: "claude-upstream".to_string(),
                capabilities: omnirelay::registry::ModelCapabilities::default(),
                pricing: omnirelay::registry::ModelPricing::default(),
            },
        ],
    };

    let state = omnirelay::app::load_state_with(runtime, config)
        .await
        .expect("load state");
    TestContext {
        router: omnirelay::app::build_app(state),
        upstream_calls,
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn post_chat(ctx: &TestContext, body: &Value) -> (StatusCode, Value) {
    let resp = ctx
        .router
        .clone()
        .oneshot(chat_request(body))
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_chat_sse(ctx: &TestContext, body: &Value) -> Vec<String> {
    let resp = ctx
        .router
        .clone()
        .oneshot(chat_request(body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes).to_string();
    text.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({"model": "no-such-model", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unsupported_model");
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn vision_request_to_text_model_is_rejected() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({
            "model": "test-model",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
            ]}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unsupported_capability");
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn nonstream_roundtrip_rewrites_model_and_metadata() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({"model": "test-model", "messages": [{"role": "user", "content": "hello there"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "test-model");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "echo: hello there"
    );
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 10);
    assert_eq!(body["metadata"]["provider"], "up-chat");
    assert_eq!(body["metadata"]["used_model"], "gpt-test");
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provider_pinned_model_routes_to_that_provider() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({"model": "up-chat/test-model", "messages": [{"role": "user", "content": "pin me"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["provider"], "up-chat");
    assert_eq!(body["model"], "up-chat/test-model");
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let ctx = setup(false).await;
    let req = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "cache me"}],
        "temperature": 0.0
    });
    let (status_a, body_a) = post_chat(&ctx, &req).await;
    let (status_b, body_b) = post_chat(&ctx, &req).await;
    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a, body_b);
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 1);

    // a different prompt is a different key
    let other = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "different prompt"}],
        "temperature": 0.0
    });
    let (status_c, _) = post_chat(&ctx, &other).await;
    assert_eq!(status_c, StatusCode::OK);
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_mode_disables_the_cache() {
    let ctx = setup(true).await;
    let req = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "no cache"}]
    });
    let (status_a, _) = post_chat(&ctx, &req).await;
    let (status_b, _) = post_chat(&ctx, &req).await;
    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn upstream_client_error_is_relayed_without_the_raw_body() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({"model": "test-model", "messages": [{"role": "user", "content": "force-400"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "upstream_error");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("upstream_bad"));
    assert!(!message.contains("secret upstream detail"));
}

#[tokio::test]
async fn anthropic_tool_use_unifies_to_tool_calls() {
    let ctx = setup(false).await;
    let (status, body) = post_chat(
        &ctx,
        &json!({"model": "claude-test", "messages": [{"role": "user", "content": "weather?"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let call = &body["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "tu_1");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert_eq!(body["usage"]["completion_tokens"], 5);
    assert_eq!(body["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn streaming_preserves_order_with_terminal_chunk_last() {
    let ctx = setup(false).await;
    let frames = post_chat_sse(
        &ctx,
        &json!({
            "model": "test-model",
            "messages": [{"role": "user", "content": "stream it"}],
            "stream": true
        }),
    )
    .await;

    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();

    // finish_reason is non-null only on the terminal chunk
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(chunk["choices"][0]["finish_reason"].is_null());
        assert_eq!(chunk["model"], "test-model");
    }
    let terminal = chunks.last().unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    assert_eq!(terminal["usage"]["total_tokens"], 27);

    // content arrives in upstream order
    let contents: Vec<String> = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .map(|s| s.to_string())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("tok{i} ")).collect();
    assert_eq!(contents, expected);
}

#[tokio::test]
async fn second_streaming_request_replays_the_buffer() {
    let ctx = setup(false).await;
    let req = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "replay me"}],
        "stream": true
    });
    let first = post_chat_sse(&ctx, &req).await;
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 1);

    // the chunk buffer is stored right after the relay finishes
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = post_chat_sse(&ctx, &req).await;
    assert_eq!(ctx.upstream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
}

#[tokio::test]
async fn models_endpoint_lists_bare_and_pinned_ids() {
    let ctx = setup(false).await;
    let resp = ctx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"test-model"));
    assert!(ids.contains(&"up-chat/test-model"));
    assert!(ids.contains(&"claude-test"));
}

#[tokio::test]
async fn healthz_is_ok() {
    let ctx = setup(false).await;
    let resp = ctx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
