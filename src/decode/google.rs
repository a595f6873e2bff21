use crate::decode::{UnifyContext, fallback_prompt_tokens, malformed, reconcile_usage};
use crate::error::AppResult;
use crate::openai::{
    ChatResponse, Choice, FinishReason, FunctionCall, ResponseMessage, Role, ToolCall,
    new_completion_id, now_ts,
};
use serde_json::Value;

pub fn unify(raw: &Value, ctx: &UnifyContext<'_>) -> AppResult<ChatResponse> {
    let candidate = raw
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| malformed(ctx.provider_id, "missing candidates"))?;

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(parts) = candidate
        .get("content")
        .and_then(|v| v.get("parts"))
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
            }
            if let Some(call) = part.get("functionCall").and_then(|v| v.as_object()) {
                let name = call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arguments = call
                    .get("args")
                    .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()))
                    .unwrap_or_else(|| "{}".to_string());
                let id = call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("call_{}", tool_calls.len()));
                tool_calls.push(ToolCall {
                    id,
                    call_type: "function".to_string(),
                    function: FunctionCall { name, arguments },
                });
            }
        }
    }

    let finish_reason = map_finish_reason(
        candidate.get("finishReason").and_then(|v| v.as_str()),
        !tool_calls.is_empty(),
    );

    let usage = raw.get("usageMetadata").and_then(|v| v.as_object());
    let mut prompt = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if prompt == 0 {
        // known quirk: Google sometimes reports zero prompt tokens
        prompt = fallback_prompt_tokens(ctx.request_messages);
    }
    let completion = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let reasoning_tokens = usage
        .and_then(|u| u.get("thoughtsTokenCount"))
        .and_then(|v| v.as_u64());
    let provider_total = usage
        .and_then(|u| u.get("totalTokenCount"))
        .and_then(|v| v.as_u64())
        .filter(|total| *total > 0);
    let cached = usage
        .and_then(|u| u.get("cachedContentTokenCount"))
        .and_then(|v| v.as_u64());

    Ok(ChatResponse {
        id: new_completion_id(),
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
        usage: reconcile_usage(prompt, completion, reasoning_tokens, cached, provider_total),
        metadata: Some(ctx.metadata()),
    })
}

/// STOP with function calls present means tool_calls; safety blocks map
/// to content_filter; unmapped signals default to stop.
pub fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    match reason {
        Some("STOP") | None if has_tool_calls => FinishReason::ToolCalls,
        Some("STOP") | None => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
            FinishReason::ContentFilter
        }
        Some(_) => FinishReason::Stop,
    }
}
