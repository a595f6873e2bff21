use crate::app::AppState;
use crate::cache::{CacheEntry, canonical_key};
use crate::decode::{self, UnifyContext};
use crate::encode;
use crate::error::{AppError, AppResult};
use crate::logsink::RequestLogRecord;
use crate::normalize::{FirstCapable, RouteTarget, resolve_route};
use crate::openai::{ChatRequest, Usage};
use crate::stream::{StreamContext, StreamRecorder};
use crate::transform::ImageFetcher;
use crate::upstream;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    let request_id = extract_request_id(&headers);
    let req: ChatRequest = serde_json::from_value(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("request body does not parse: {err}"),
        )
    })?;
    counter!("omnirelay_requests_total", "model" => req.model.clone()).increment(1);

    let route = match resolve_route(&req, &state.registry, &state.providers, &FirstCapable).await {
        Ok(route) => route,
        Err(err) => {
            log_failure(&state, &request_id, &req, None, &err, started_at);
            counter!("omnirelay_request_errors_total", "code" => err.code.clone()).increment(1);
            return Err(err);
        }
    };

    if req.stream.unwrap_or(false) {
        forward_stream(state, req, route, request_id, started_at).await
    } else {
        forward_nonstream(state, req, route, request_id, started_at).await
    }
}

async fn forward_nonstream(
    state: AppState,
    req: ChatRequest,
    route: RouteTarget,
    request_id: String,
    started_at: Instant,
) -> AppResult<Response> {
    let cache_key = canonical_key(&req);
    if let Some(CacheEntry::Response(resp)) = state.cache.get(&cache_key) {
        counter!("omnirelay_cache_hits_total", "kind" => "response").increment(1);
        debug!(request_id = %request_id, "serving cached response");
        log_success(&state, &request_id, &req, &route, Some(&resp.usage), true, started_at, None);
        return Ok(Json(resp).into_response());
    }

    let fetcher = ImageFetcher::new(state.http.clone(), state.runtime.request_timeout_ms);
    let payload = encode::build_request(
        route.provider.kind,
        &route.record.upstream_model,
        &route.record.capabilities,
        &req,
        &fetcher,
    )
    .await;

    let raw = match upstream::call_json(
        &state.http,
        &route.provider,
        &route.record.upstream_model,
        &payload,
        state.runtime.request_timeout_ms,
    )
    .await
    {
        Ok(raw) => raw,
        Err(err) => {
            let err = err.into_app_error(&route.provider.id);
            counter!("omnirelay_upstream_errors_total", "provider" => route.provider.id.clone())
                .increment(1);
            log_failure(&state, &request_id, &req, Some(&route), &err, started_at);
            return Err(err);
        }
    };

    let ctx = UnifyContext {
        requested_model: &req.model,
        upstream_model: &route.record.upstream_model,
        provider_id: &route.provider.id,
        request_messages: &req.messages,
    };
    let resp = match decode::unify(route.provider.kind, &raw, &ctx) {
        Ok(resp) => resp,
        Err(err) => {
            log_failure(&state, &request_id, &req, Some(&route), &err, started_at);
            return Err(err);
        }
    };

    histogram!("omnirelay_request_duration_seconds", "provider" => route.provider.id.clone())
        .record(started_at.elapsed().as_secs_f64());
    state.cache.put_response(cache_key, resp.clone());
    let raw_payload = state.runtime.debug_payloads.then(|| raw.clone());
    log_success(
        &state,
        &request_id,
        &req,
        &route,
        Some(&resp.usage),
        false,
        started_at,
        raw_payload,
    );
    Ok(Json(resp).into_response())
}

async fn forward_stream(
    state: AppState,
    req: ChatRequest,
    route: RouteTarget,
    request_id: String,
    started_at: Instant,
) -> AppResult<Response> {
    let cache_key = canonical_key(&req);
    if let Some(CacheEntry::Stream(buffer)) = state.cache.get(&cache_key) {
        counter!("omnirelay_cache_hits_total", "kind" => "stream").increment(1);
        debug!(request_id = %request_id, "replaying cached stream");
        log_success(&state, &request_id, &req, &route, None, true, started_at, None);
        let (tx, rx) = mpsc::channel::<Event>(64);
        tokio::spawn(async move {
            crate::stream::replay_buffer(buffer, tx).await;
        });
        return Ok(sse_response(rx));
    }

    let fetcher = ImageFetcher::new(state.http.clone(), state.runtime.request_timeout_ms);
    let payload = encode::build_request(
        route.provider.kind,
        &route.record.upstream_model,
        &route.record.capabilities,
        &req,
        &fetcher,
    )
    .await;

    let upstream_resp = match upstream::call_stream(
        &state.http,
        &route.provider,
        &route.record.upstream_model,
        &payload,
        state.runtime.request_timeout_ms,
    )
    .await
    {
        Ok(resp) => resp,
        Err(err) => {
            let err = err.into_app_error(&route.provider.id);
            counter!("omnirelay_upstream_errors_total", "provider" => route.provider.id.clone())
                .increment(1);
            log_failure(&state, &request_id, &req, Some(&route), &err, started_at);
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(64);
    let recorder = Arc::new(Mutex::new(StreamRecorder::new()));
    let ctx = StreamContext {
        requested_model: req.model.clone(),
        provider_id: route.provider.id.clone(),
    };
    let state_bg = state.clone();
    let recorder_bg = recorder.clone();
    tokio::spawn(async move {
        crate::stream::relay(
            route.provider.kind,
            upstream_resp,
            ctx,
            tx,
            Some(recorder_bg),
        )
        .await;
        // the relay dropped its clone, so the recorder is ours again
        if let Ok(mutex) = Arc::try_unwrap(recorder) {
            let buffer = mutex
                .into_inner()
                .into_buffer(&req.model, &route.provider.id);
            if !buffer.meta.completed {
                counter!(
                    "omnirelay_stream_abnormal_total",
                    "provider" => route.provider.id.clone()
                )
                .increment(1);
            }
            state_bg.cache.put_stream(cache_key, buffer);
        }
        histogram!(
            "omnirelay_request_duration_seconds",
            "provider" => route.provider.id.clone()
        )
        .record(started_at.elapsed().as_secs_f64());
        log_success(&state_bg, &request_id, &req, &route, None, false, started_at, None);
    });

    Ok(sse_response(rx))
}

fn sse_response(rx: mpsc::Receiver<Event>) -> Response {
    let stream =
        tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Sse::new(stream).into_response()
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let records = state.registry.all_records().await;
    let mut data = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for record in &records {
        if seen.insert(record.model.clone()) {
            data.push(json!({
                "id": record.model,
                "object": "model",
                "created": 0,
                "owned_by": record.provider_id,
            }));
        }
        let pinned = format!("{}/{}", record.provider_id, record.model);
        if seen.insert(pinned.clone()) {
            data.push(json!({
                "id": pinned,
                "object": "model",
                "created": 0,
                "owned_by": record.provider_id,
            }));
        }
    }
    Json(json!({ "object": "list", "data": data }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.render().into_response()
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[allow(clippy::too_many_arguments)]
fn log_success(
    state: &AppState,
    request_id: &str,
    req: &ChatRequest,
    route: &RouteTarget,
    usage: Option<&Usage>,
    cache_hit: bool,
    started_at: Instant,
    response_payload: Option<Value>,
) {
    let cost_usd = usage.map(|u| {
        route
            .record
            .pricing
            .estimate_usd(u.prompt_tokens, u.completion_tokens)
    });
    state.logs.push(RequestLogRecord {
        request_id: request_id.to_string(),
        requested_model: req.model.clone(),
        used_model: Some(route.record.upstream_model.clone()),
        provider: Some(route.provider.id.clone()),
        streamed: req.stream.unwrap_or(false),
        cache_hit,
        usage: usage.cloned(),
        cost_usd,
        duration_ms: started_at.elapsed().as_millis() as u64,
        error: None,
        request_payload: state
            .runtime
            .debug_payloads
            .then(|| serde_json::to_value(req).unwrap_or(Value::Null)),
        response_payload,
    });
}

fn log_failure(
    state: &AppState,
    request_id: &str,
    req: &ChatRequest,
    route: Option<&RouteTarget>,
    err: &AppError,
    started_at: Instant,
) {
    state.logs.push(RequestLogRecord {
        request_id: request_id.to_string(),
        requested_model: req.model.clone(),
        used_model: route.map(|r| r.record.upstream_model.clone()),
        provider: route.map(|r| r.provider.id.clone()),
        streamed: req.stream.unwrap_or(false),
        cache_hit: false,
        usage: None,
        cost_usd: None,
        duration_ms: started_at.elapsed().as_millis() as u64,
        error: Some(format!("{}: {}", err.code, err.message)),
        request_payload: state
            .runtime
            .debug_payloads
            .then(|| serde_json::to_value(req).unwrap_or(Value::Null)),
        response_payload: None,
    });
}
