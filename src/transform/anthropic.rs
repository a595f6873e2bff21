use crate::openai::{ChatMessage, ContentPart, MessageContent, Role};
use crate::transform::{
    IMAGE_FETCH_CONCURRENCY, ImageFetcher, TransformContext, cache_hint_eligible,
    image_failure_placeholder,
};
use futures_util::StreamExt;
use serde_json::{Value, json};

/// Anthropic messages-API shape: a separate system block list plus
/// strictly user/assistant turns.
#[derive(Debug, Default)]
pub struct AnthropicMessages {
    pub system: Vec<Value>,
    pub messages: Vec<Value>,
}

/// Converts canonical messages into Anthropic content blocks. Tool calls
/// become tool_use blocks with request-unique ids, tool messages become
/// tool_result blocks following the id remap, oversized text blocks get
/// cache_control hints within the shared 4-block budget, and image
/// fetches degrade to placeholder text instead of failing the request.
pub async fn convert_messages(
    messages: &[ChatMessage],
    ctx: &mut TransformContext,
    fetcher: &ImageFetcher,
) -> AnthropicMessages {
    let mut out = AnthropicMessages::default();

    for message in messages {
        match message.role {
            Role::System => {
                let text = message.content_text();
                if !text.is_empty() {
                    out.system.push(text_block(&text, ctx));
                }
            }
            Role::Tool => {
                if let Some(item) = convert_tool_result(message, ctx) {
                    push_merged(&mut out.messages, item);
                }
            }
            Role::User => {
                let content = convert_user_content(message, ctx, fetcher).await;
                if !content.is_empty() {
                    push_merged(&mut out.messages, json!({ "role": "user", "content": content }));
                }
            }
            Role::Assistant => {
                let content = convert_assistant_content(message, ctx);
                if !content.is_empty() {
                    push_merged(
                        &mut out.messages,
                        json!({ "role": "assistant", "content": content }),
                    );
                }
            }
        }
    }

    out
}

fn text_block(text: &str, ctx: &mut TransformContext) -> Value {
    if cache_hint_eligible(text) && ctx.try_reserve_cache_hint() {
        json!({ "type": "text", "text": text, "cache_control": { "type": "ephemeral" } })
    } else {
        json!({ "type": "text", "text": text })
    }
}

async fn convert_user_content(
    message: &ChatMessage,
    ctx: &mut TransformContext,
    fetcher: &ImageFetcher,
) -> Vec<Value> {
    enum Pending {
        Ready(Value),
        Image { url: String },
    }

    let mut pending = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                pending.push(Pending::Ready(text_block(text, ctx)));
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            pending.push(Pending::Ready(text_block(text, ctx)));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => pending.push(Pending::Image {
                        url: image_url.url.clone(),
                    }),
                }
            }
        }
        None => {}
    }

    // Image fetches fan out concurrently but each part fails on its own.
    futures_util::stream::iter(pending.into_iter().map(|item| async move {
        match item {
            Pending::Ready(value) => value,
            Pending::Image { url } => match fetcher.fetch(&url).await {
                Ok(img) => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": img.media_type,
                        "data": img.data_b64
                    }
                }),
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "image fetch failed, degrading to placeholder");
                    json!({ "type": "text", "text": image_failure_placeholder(&url) })
                }
            },
        }
    }))
    .buffered(IMAGE_FETCH_CONCURRENCY)
    .collect()
    .await
}

fn convert_assistant_content(message: &ChatMessage, ctx: &mut TransformContext) -> Vec<Value> {
    let mut content = Vec::new();
    let text = message.content_text();
    if !text.is_empty() {
        content.push(json!({ "type": "text", "text": text }));
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            let id = ctx.assign_tool_use_id(&call.id);
            let input = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({ "_raw": call.function.arguments }));
            content.push(json!({
                "type": "tool_use",
                "id": id,
                "name": call.function.name,
                "input": input
            }));
        }
    }
    content
}

fn convert_tool_result(message: &ChatMessage, ctx: &mut TransformContext) -> Option<Value> {
    let call_id = message.tool_call_id.as_deref()?;
    let text = message.content_text();
    let inner = if text.is_empty() {
        json!([{ "type": "text", "text": "" }])
    } else {
        json!([{ "type": "text", "text": text }])
    };
    let blocks: Vec<Value> = ctx
        .result_ids_for(call_id)
        .into_iter()
        .map(|id| {
            json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": inner
            })
        })
        .collect();
    Some(json!({ "role": "user", "content": blocks }))
}

/// Anthropic expects alternating roles; consecutive same-role turns are
/// merged into one.
fn push_merged(messages: &mut Vec<Value>, item: Value) {
    if let Some(last) = messages.last_mut() {
        if last.get("role") == item.get("role") {
            if let (Some(dst), Some(src)) = (
                last.get_mut("content").and_then(|v| v.as_array_mut()),
                item.get("content").and_then(|v| v.as_array()),
            ) {
                dst.extend(src.iter().cloned());
                return;
            }
        }
    }
    messages.push(item);
}
