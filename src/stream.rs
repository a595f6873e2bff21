use crate::cache::{BufferedChunk, StreamBuffer, StreamMeta};
use crate::config::ProviderKind;
use crate::decode;
use crate::openai::{FinishReason, Usage, new_completion_id, now_ts};
use crate::reasoning::extract_reasoning;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Captures the canonical SSE frames of a live stream so a later
/// identical request can be served by replay. Only marked complete
/// when the upstream terminated with an explicit terminal signal.
pub struct StreamRecorder {
    chunks: Vec<BufferedChunk>,
    finish_reason: Option<FinishReason>,
    completed: bool,
    started: Instant,
}

impl StreamRecorder {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            finish_reason: None,
            completed: false,
            started: Instant::now(),
        }
    }

    fn record(&mut self, data: &str) {
        let event_id = self.chunks.len() as u64;
        self.chunks.push(BufferedChunk {
            data: data.to_string(),
            event_id,
            timestamp: now_ts(),
        });
    }

    fn mark_done(&mut self, finish_reason: FinishReason) {
        self.finish_reason = Some(finish_reason);
        self.completed = true;
    }

    pub fn into_buffer(self, model: &str, provider: &str) -> StreamBuffer {
        let total_chunks = self.chunks.len() as u64;
        StreamBuffer {
            chunks: self.chunks,
            meta: StreamMeta {
                model: model.to_string(),
                provider: provider.to_string(),
                finish_reason: self.finish_reason,
                total_chunks,
                duration_ms: self.started.elapsed().as_millis() as u64,
                completed: self.completed,
            },
        }
    }
}

impl Default for StreamRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedRecorder = Option<Arc<Mutex<StreamRecorder>>>;

/// Per-connection identity of the client-facing stream.
pub struct StreamContext {
    pub requested_model: String,
    pub provider_id: String,
}

/// Writes canonical chunks to the client channel in upstream arrival
/// order. Holds no reordering buffer. A failed send means the client
/// went away; the relay loop stops and dropping the upstream body
/// aborts the provider connection.
struct ChunkWriter {
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
    id: String,
    created: i64,
    model: String,
}

impl ChunkWriter {
    fn new(ctx: &StreamContext, tx: mpsc::Sender<Event>, recorder: SharedRecorder) -> Self {
        Self {
            tx,
            recorder,
            id: new_completion_id(),
            created: now_ts(),
            model: ctx.requested_model.clone(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<FinishReason>, usage: Option<&Usage>) -> Value {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason.map(|f| f.as_str()),
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
        }
        chunk
    }

    async fn send_raw(&mut self, data: String) -> bool {
        if let Some(recorder) = &self.recorder {
            recorder.lock().await.record(&data);
        }
        self.tx.send(Event::default().data(data)).await.is_ok()
    }

    async fn delta(&mut self, delta: Value) -> bool {
        let chunk = self.chunk(delta, None, None);
        self.send_raw(chunk.to_string()).await
    }

    /// Terminal chunk plus the `[DONE]` sentinel. `finish_reason` is
    /// never null here; usage appears only when the provider supplied
    /// enough to reconcile one.
    async fn terminal(
        &mut self,
        finish_reason: FinishReason,
        usage: Option<Usage>,
        explicit: bool,
    ) {
        let chunk = self.chunk(json!({}), Some(finish_reason), usage.as_ref());
        let _ = self.send_raw(chunk.to_string()).await;
        let _ = self.send_raw("[DONE]".to_string()).await;
        if explicit {
            if let Some(recorder) = &self.recorder {
                recorder.lock().await.mark_done(finish_reason);
            }
        }
    }
}

fn parse_finish(reason: &str) -> FinishReason {
    serde_json::from_value(Value::String(reason.to_string())).unwrap_or(FinishReason::Stop)
}

fn usage_from_openai(usage: &Value) -> Option<Usage> {
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let reasoning = usage
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|v| v.as_u64());
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64());
    let total = usage.get("total_tokens").and_then(|v| v.as_u64());
    Some(decode::reconcile_usage(prompt, completion, reasoning, cached, total))
}

/// OpenAI chat streams are near-canonical already: rewrite the model,
/// normalize reasoning deltas, and hold the upstream finish_reason and
/// usage back so exactly one terminal chunk carries both.
pub async fn relay_openai_chat(
    upstream_resp: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
) {
    let mut writer = ChunkWriter::new(&ctx, tx, recorder);
    let mut final_finish: Option<FinishReason> = None;
    let mut final_usage: Option<Usage> = None;
    let mut saw_done = false;

    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        if ev.data.trim() == "[DONE]" {
            saw_done = true;
            break;
        }
        let data_val: Value = serde_json::from_str(&ev.data).unwrap_or(Value::Null);
        if let Some(usage) = data_val.get("usage").filter(|v| !v.is_null()) {
            if let Some(u) = usage_from_openai(usage) {
                final_usage = Some(u);
            }
        }
        let choice = data_val
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else { continue };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            final_finish = Some(parse_finish(reason));
        }

        let upstream_delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        let mut delta = json!({});
        if let Some(role) = upstream_delta.get("role").and_then(|v| v.as_str()) {
            delta["role"] = json!(role);
        }
        if let Some(text) = upstream_delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                delta["content"] = json!(text);
            }
        }
        let reasoning = extract_reasoning(ProviderKind::OpenaiChat, &data_val);
        if !reasoning.is_empty() {
            delta["reasoning_content"] = json!(reasoning);
        }
        if let Some(tool_calls) = upstream_delta.get("tool_calls") {
            // index is preserved verbatim so client accumulators can
            // concatenate interleaved argument fragments
            delta["tool_calls"] = tool_calls.clone();
        }

        if delta.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            if !writer.delta(delta).await {
                return;
            }
        }
    }

    let explicit = saw_done || final_finish.is_some();
    if !explicit {
        debug!(provider = %ctx.provider_id, "upstream stream ended without terminal event");
    }
    writer
        .terminal(final_finish.unwrap_or(FinishReason::Stop), final_usage, explicit)
        .await;
}

/// Anthropic SSE carries typed events. Content block indices include
/// text and thinking blocks, so tool_use blocks are renumbered into a
/// dense zero-based tool_calls index and a per-connection map keeps
/// later input_json_delta fragments on the right index.
pub async fn relay_anthropic(
    upstream_resp: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
) {
    let mut writer = ChunkWriter::new(&ctx, tx, recorder);
    let mut tool_index_by_block: HashMap<u64, u64> = HashMap::new();
    let mut next_tool_index: u64 = 0;
    let mut prompt_tokens: u64 = 0;
    let mut cached_tokens: Option<u64> = None;
    let mut completion_tokens: u64 = 0;
    let mut final_finish: Option<FinishReason> = None;
    let mut saw_usage = false;
    let mut saw_stop = false;

    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        let data_val: Value = serde_json::from_str(&ev.data).unwrap_or(Value::Null);
        let event_type = data_val.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(usage) = data_val.get("message").and_then(|m| m.get("usage")) {
                    prompt_tokens = usage
                        .get("input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    cached_tokens = usage
                        .get("cache_read_input_tokens")
                        .and_then(|v| v.as_u64())
                        .filter(|n| *n > 0);
                    saw_usage = true;
                }
                if !writer.delta(json!({"role": "assistant"})).await {
                    return;
                }
            }
            "content_block_start" => {
                let index = data_val.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let block = data_val.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let tool_index = next_tool_index;
                    next_tool_index += 1;
                    tool_index_by_block.insert(index, tool_index);
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                "arguments": "",
                            },
                        }],
                    });
                    if !writer.delta(delta).await {
                        return;
                    }
                }
            }
            "content_block_delta" => {
                let index = data_val.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let block_delta = data_val.get("delta").cloned().unwrap_or(Value::Null);
                match block_delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = block_delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty()
                                && !writer.delta(json!({"content": text})).await
                            {
                                return;
                            }
                        }
                    }
                    Some("thinking_delta") => {
                        let reasoning = extract_reasoning(ProviderKind::Anthropic, &data_val);
                        if !reasoning.is_empty()
                            && !writer
                                .delta(json!({"reasoning_content": reasoning}))
                                .await
                        {
                            return;
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) =
                            block_delta.get("partial_json").and_then(|v| v.as_str())
                        {
                            let tool_index =
                                tool_index_by_block.get(&index).copied().unwrap_or(0);
                            let delta = json!({
                                "tool_calls": [{
                                    "index": tool_index,
                                    "function": { "arguments": partial },
                                }],
                            });
                            if !writer.delta(delta).await {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = data_val
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    final_finish = Some(decode::anthropic::map_stop_reason(Some(reason)));
                }
                if let Some(out) = data_val
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    completion_tokens = out;
                    saw_usage = true;
                }
            }
            "message_stop" => {
                saw_stop = true;
                break;
            }
            _ => {}
        }
    }

    let usage = saw_usage.then(|| {
        decode::reconcile_usage(prompt_tokens, completion_tokens, None, cached_tokens, None)
    });
    let explicit = saw_stop || final_finish.is_some();
    if !explicit {
        debug!(provider = %ctx.provider_id, "upstream stream ended without message_stop");
    }
    writer
        .terminal(final_finish.unwrap_or(FinishReason::Stop), usage, explicit)
        .await;
}

/// Google streams whole generateContent-shaped objects per SSE frame.
pub async fn relay_google(
    upstream_resp: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
) {
    let mut writer = ChunkWriter::new(&ctx, tx, recorder);
    let mut next_tool_index: u64 = 0;
    let mut saw_tool_calls = false;
    let mut final_reason: Option<String> = None;
    let mut final_usage: Option<Usage> = None;

    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        let data_val: Value = serde_json::from_str(&ev.data).unwrap_or(Value::Null);

        if let Some(meta) = data_val.get("usageMetadata") {
            let prompt = meta
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let completion = meta
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let reasoning = meta.get("thoughtsTokenCount").and_then(|v| v.as_u64());
            let cached = meta
                .get("cachedContentTokenCount")
                .and_then(|v| v.as_u64())
                .filter(|n| *n > 0);
            let total = meta.get("totalTokenCount").and_then(|v| v.as_u64());
            final_usage = Some(decode::reconcile_usage(
                prompt, completion, reasoning, cached, total,
            ));
        }

        let candidate = data_val
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(candidate) = candidate else { continue };
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            final_reason = Some(reason.to_string());
        }

        let reasoning = extract_reasoning(ProviderKind::Google, &data_val);
        if !reasoning.is_empty()
            && !writer.delta(json!({"reasoning_content": reasoning})).await
        {
            return;
        }

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|v| v.as_array());
        let Some(parts) = parts else { continue };
        for part in parts {
            if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() && !writer.delta(json!({"content": text})).await {
                    return;
                }
            }
            if let Some(call) = part.get("functionCall") {
                saw_tool_calls = true;
                let tool_index = next_tool_index;
                next_tool_index += 1;
                let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let args = call.get("args").cloned().unwrap_or(json!({}));
                let delta = json!({
                    "tool_calls": [{
                        "index": tool_index,
                        "id": format!("call_{tool_index}"),
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": args.to_string(),
                        },
                    }],
                });
                if !writer.delta(delta).await {
                    return;
                }
            }
        }
    }

    let explicit = final_reason.is_some();
    if !explicit {
        debug!(provider = %ctx.provider_id, "upstream stream ended without finishReason");
    }
    let finish =
        decode::google::map_finish_reason(final_reason.as_deref(), saw_tool_calls);
    writer.terminal(finish, final_usage, explicit).await;
}

/// OpenAI responses streams use named events; only the delta and
/// lifecycle events matter for the canonical chunk shape.
pub async fn relay_openai_responses(
    upstream_resp: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
) {
    let mut writer = ChunkWriter::new(&ctx, tx, recorder);
    let mut tool_index_by_item: HashMap<String, u64> = HashMap::new();
    let mut next_tool_index: u64 = 0;
    let mut saw_tool_calls = false;
    let mut final_finish: Option<FinishReason> = None;
    let mut final_usage: Option<Usage> = None;
    let mut saw_completed = false;

    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        if ev.data.trim() == "[DONE]" {
            break;
        }
        let data_val: Value = serde_json::from_str(&ev.data).unwrap_or(Value::Null);
        let event_type = data_val
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ev.event.clone());

        match event_type.as_str() {
            "response.output_text.delta" => {
                if let Some(text) = data_val.get("delta").and_then(|v| v.as_str()) {
                    if !text.is_empty() && !writer.delta(json!({"content": text})).await {
                        return;
                    }
                }
            }
            "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                let reasoning = extract_reasoning(ProviderKind::OpenaiResponses, &data_val);
                let reasoning = if reasoning.is_empty() {
                    data_val
                        .get("delta")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string()
                } else {
                    reasoning
                };
                if !reasoning.is_empty()
                    && !writer.delta(json!({"reasoning_content": reasoning})).await
                {
                    return;
                }
            }
            "response.output_item.added" => {
                let item = data_val.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    saw_tool_calls = true;
                    let item_id = item
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let tool_index = next_tool_index;
                    next_tool_index += 1;
                    tool_index_by_item.insert(item_id, tool_index);
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": item.get("call_id").and_then(|v| v.as_str()).unwrap_or(""),
                            "type": "function",
                            "function": {
                                "name": item.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                "arguments": "",
                            },
                        }],
                    });
                    if !writer.delta(delta).await {
                        return;
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(partial) = data_val.get("delta").and_then(|v| v.as_str()) {
                    let tool_index = data_val
                        .get("item_id")
                        .and_then(|v| v.as_str())
                        .and_then(|id| tool_index_by_item.get(id).copied())
                        .unwrap_or(next_tool_index.saturating_sub(1));
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "function": { "arguments": partial },
                        }],
                    });
                    if !writer.delta(delta).await {
                        return;
                    }
                }
            }
            "response.completed" | "response.incomplete" => {
                saw_completed = true;
                let response = data_val.get("response").cloned().unwrap_or(Value::Null);
                if let Some(usage) = response.get("usage") {
                    let prompt = usage
                        .get("input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let completion = usage
                        .get("output_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let reasoning = usage
                        .get("output_tokens_details")
                        .and_then(|d| d.get("reasoning_tokens"))
                        .and_then(|v| v.as_u64());
                    let total = usage.get("total_tokens").and_then(|v| v.as_u64());
                    final_usage = Some(decode::reconcile_usage(
                        prompt, completion, reasoning, None, total,
                    ));
                }
                let truncated = response
                    .get("incomplete_details")
                    .and_then(|d| d.get("reason"))
                    .and_then(|v| v.as_str())
                    == Some("max_output_tokens");
                final_finish = Some(if truncated {
                    FinishReason::Length
                } else if saw_tool_calls {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                });
                break;
            }
            _ => {}
        }
    }

    if !saw_completed {
        debug!(provider = %ctx.provider_id, "upstream stream ended without response.completed");
    }
    writer
        .terminal(final_finish.unwrap_or(FinishReason::Stop), final_usage, saw_completed)
        .await;
}

/// Replays a cached chunk buffer to a fresh client connection.
pub async fn replay_buffer(buffer: StreamBuffer, tx: mpsc::Sender<Event>) {
    for chunk in buffer.chunks {
        if tx.send(Event::default().data(chunk.data)).await.is_err() {
            return;
        }
    }
}

pub async fn relay(
    kind: ProviderKind,
    upstream_resp: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Event>,
    recorder: SharedRecorder,
) {
    match kind {
        ProviderKind::OpenaiChat | ProviderKind::OpenaiCompatible => {
            relay_openai_chat(upstream_resp, ctx, tx, recorder).await
        }
        ProviderKind::OpenaiResponses => {
            relay_openai_responses(upstream_resp, ctx, tx, recorder).await
        }
        ProviderKind::Anthropic => relay_anthropic(upstream_resp, ctx, tx, recorder).await,
        ProviderKind::Google => relay_google(upstream_resp, ctx, tx, recorder).await,
    }
}
