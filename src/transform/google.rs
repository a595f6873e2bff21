use crate::openai::{ChatMessage, ContentPart, MessageContent, Role};
use crate::transform::{IMAGE_FETCH_CONCURRENCY, ImageFetcher, image_failure_placeholder};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Google generateContent shape: an optional systemInstruction plus
/// role-tagged contents with typed parts.
#[derive(Debug, Default)]
pub struct GoogleContents {
    pub system_instruction: Option<Value>,
    pub contents: Vec<Value>,
}

/// Flattens OpenAI message history into Google's contents/parts shape.
/// Assistant tool calls become functionCall parts; tool messages become
/// functionResponse parts correlated by call id.
pub async fn convert_contents(messages: &[ChatMessage], fetcher: &ImageFetcher) -> GoogleContents {
    let mut out = GoogleContents::default();
    let mut system_parts: Vec<Value> = Vec::new();
    // Google addresses function responses by name, not call id.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in messages {
        match message.role {
            Role::System => {
                let text = message.content_text();
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
            }
            Role::User => {
                let parts = convert_user_parts(message, fetcher).await;
                if !parts.is_empty() {
                    push_merged(&mut out.contents, "user", parts);
                }
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                let text = message.content_text();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        call_names.insert(call.id.clone(), call.function.name.clone());
                        let args = serde_json::from_str::<Value>(&call.function.arguments)
                            .unwrap_or_else(|_| json!({ "_raw": call.function.arguments }));
                        parts.push(json!({
                            "functionCall": { "name": call.function.name, "args": args }
                        }));
                    }
                }
                if !parts.is_empty() {
                    push_merged(&mut out.contents, "model", parts);
                }
            }
            Role::Tool => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .unwrap_or_else(|| "function".to_string());
                let text = message.content_text();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(|v| v.is_object())
                    .unwrap_or_else(|| json!({ "content": text }));
                push_merged(
                    &mut out.contents,
                    "user",
                    vec![json!({
                        "functionResponse": { "name": name, "response": response }
                    })],
                );
            }
        }
    }

    if !system_parts.is_empty() {
        out.system_instruction = Some(json!({ "parts": system_parts }));
    }
    out
}

async fn convert_user_parts(message: &ChatMessage, fetcher: &ImageFetcher) -> Vec<Value> {
    enum Pending {
        Ready(Value),
        Image { url: String },
    }

    let mut pending = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                pending.push(Pending::Ready(json!({ "text": text })));
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            pending.push(Pending::Ready(json!({ "text": text })));
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

    futures_util::stream::iter(pending.into_iter().map(|item| async move {
        match item {
            Pending::Ready(value) => value,
            Pending::Image { url } => match fetcher.fetch(&url).await {
                Ok(img) => json!({
                    "inlineData": { "mimeType": img.media_type, "data": img.data_b64 }
                }),
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "image fetch failed, degrading to placeholder");
                    json!({ "text": image_failure_placeholder(&url) })
                }
            },
        }
    }))
    .buffered(IMAGE_FETCH_CONCURRENCY)
    .collect()
    .await
}

fn push_merged(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(|v| v.as_str()) == Some(role) {
            if let Some(dst) = last.get_mut("parts").and_then(|v| v.as_array_mut()) {
                dst.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": role, "parts": parts }));
}

/// Google's schema validator rejects JSON-schema metadata fields; strip
/// them recursively from tool parameter schemas.
pub fn scrub_schema(schema: &mut Value) {
    match schema {
        Value::Object(obj) => {
            obj.remove("additionalProperties");
            obj.remove("$schema");
            for (_, child) in obj.iter_mut() {
                scrub_schema(child);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_schema(item);
            }
        }
        _ => {}
    }
}
