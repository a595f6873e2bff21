use crate::decode::{UnifyContext, malformed, reconcile_usage};
use crate::error::AppResult;
use crate::openai::{
    ChatResponse, Choice, FinishReason, FunctionCall, ResponseMessage, Role, ToolCall, now_ts,
};
use serde_json::Value;

pub fn unify(raw: &Value, ctx: &UnifyContext<'_>) -> AppResult<ChatResponse> {
    let obj = raw
        .as_object()
        .ok_or_else(|| malformed(ctx.provider_id, "expected message object"))?;

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(blocks) = obj.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        content.push_str(text);
                    }
                }
                "thinking" => {
                    if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                        reasoning.push_str(text);
                    }
                }
                "tool_use" => {
                    let arguments = block
                        .get("input")
                        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments,
                        },
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = map_stop_reason(obj.get("stop_reason").and_then(|v| v.as_str()));

    let usage = obj.get("usage").and_then(|v| v.as_object());
    let prompt = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cached = usage
        .and_then(|u| u.get("cache_read_input_tokens"))
        .and_then(|v| v.as_u64());

    Ok(ChatResponse {
        id: obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(crate::openai::new_completion_id),
        object: "chat.completion".to_string(),
        created: now_ts(),
        model: ctx.requested_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content: (!content.is_empty() || tool_calls.is_empty()).then_some(content),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
        }],
        usage: reconcile_usage(prompt, completion, None, cached, None),
        metadata: Some(ctx.metadata()),
    })
}

/// Every Anthropic stop signal maps to exactly one canonical finish
/// reason; anything unrecognized falls through to `stop`.
pub fn map_stop_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}
