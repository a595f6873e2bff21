use crate::decode::{UnifyContext, malformed, reconcile_usage};
use crate::error::AppResult;
use crate::openai::{
    ChatResponse, Choice, FinishReason, FunctionCall, ResponseMessage, Role, ToolCall,
    new_completion_id, now_ts,
};
use serde_json::Value;

/// OpenAI-compatible responses are already near-canonical; rewrite the
/// model echo, normalize reasoning fields, and apply the usage floors
/// instead of reconstructing the whole body.
pub fn unify_chat(raw: &Value, ctx: &UnifyContext<'_>) -> AppResult<ChatResponse> {
    let choice = raw
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| malformed(ctx.provider_id, "missing choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| malformed(ctx.provider_id, "missing message"))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    // vendors disagree on the reasoning field name
    let reasoning_content = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| serde_json::from_value::<Vec<ToolCall>>(v.clone()).ok())
        .filter(|calls| !calls.is_empty());

    let finish_reason = map_finish_reason(
        choice.get("finish_reason").and_then(|v| v.as_str()),
        tool_calls.is_some(),
    );

    let usage = raw.get("usage").and_then(|v| v.as_object());
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let provider_total = usage
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64())
        .filter(|total| *total > 0);
    let reasoning_tokens = usage
        .and_then(|u| u.get("completion_tokens_details"))
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|v| v.as_u64());
    let cached = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64());

    Ok(ChatResponse {
        id: raw
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(new_completion_id),
        object: "chat.completion".to_string(),
        created: raw
            .get("created")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_ts),
        model: ctx.requested_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content,
                reasoning_content,
                tool_calls,
            },
            finish_reason,
        }],
        usage: reconcile_usage(prompt, completion, reasoning_tokens, cached, provider_total),
        metadata: Some(ctx.metadata()),
    })
}

/// OpenAI responses-API output items folded back into a chat message.
pub fn unify_responses(raw: &Value, ctx: &UnifyContext<'_>) -> AppResult<ChatResponse> {
    let output = raw
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| malformed(ctx.provider_id, "missing output"))?;

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in output {
        match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message" => {
                if let Some(parts) = item.get("content").and_then(|v| v.as_array()) {
                    for part in parts {
                        if part.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                content.push_str(text);
                            }
                        }
                    }
                }
            }
            "reasoning" => {
                if let Some(summaries) = item.get("summary").and_then(|v| v.as_array()) {
                    for summary in summaries {
                        if let Some(text) = summary.get("text").and_then(|v| v.as_str()) {
                            reasoning.push_str(text);
                        }
                    }
                }
            }
            "function_call" => {
                tool_calls.push(ToolCall {
                    id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: item
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else if raw
        .get("incomplete_details")
        .and_then(|d| d.get("reason"))
        .and_then(|v| v.as_str())
        == Some("max_output_tokens")
    {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };

    let usage = raw.get("usage").and_then(|v| v.as_object());
    let prompt = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let provider_total = usage
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64())
        .filter(|total| *total > 0);
    let reasoning_tokens = usage
        .and_then(|u| u.get("output_tokens_details"))
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|v| v.as_u64());

    Ok(ChatResponse {
        id: raw
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(new_completion_id),
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
        usage: reconcile_usage(prompt, completion, reasoning_tokens, None, provider_total),
        metadata: Some(ctx.metadata()),
    })
}

pub fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("stop") => FinishReason::Stop,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}
