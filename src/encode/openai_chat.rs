use crate::openai::ChatRequest;
use crate::registry::ModelCapabilities;
use serde_json::{Value, json};

/// OpenAI chat-completions wire format is the canonical format, so this
/// arm serializes the prepared request and rewrites the model id. It
/// also serves the OpenAI-compatible long tail.
pub fn build(upstream_model: &str, caps: &ModelCapabilities, req: &ChatRequest) -> Value {
    let mut body = serde_json::to_value(req).unwrap_or_else(|_| json!({}));
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "model".to_string(),
            Value::String(upstream_model.to_string()),
        );
        if !caps.reasoning {
            obj.remove("reasoning_effort");
        }
        if req.stream.unwrap_or(false) {
            // ask for the final usage frame on streaming responses
            obj.entry("stream_options".to_string())
                .or_insert_with(|| json!({ "include_usage": true }));
        }
    }
    body
}
