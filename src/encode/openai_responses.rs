use crate::openai::{ChatRequest, ContentPart, MessageContent, Role, ToolChoice};
use crate::registry::ModelCapabilities;
use serde_json::{Value, json};

/// OpenAI responses-API wire format: flat `input` item list with
/// function_call / function_call_output items instead of message-level
/// tool_calls.
pub fn build(upstream_model: &str, caps: &ModelCapabilities, req: &ChatRequest) -> Value {
    let mut instructions = String::new();
    let mut input: Vec<Value> = Vec::new();

    for message in &req.messages {
        match message.role {
            Role::System => {
                let text = message.content_text();
                if !text.is_empty() {
                    if !instructions.is_empty() {
                        instructions.push('\n');
                    }
                    instructions.push_str(&text);
                }
            }
            Role::User => {
                input.push(json!({
                    "role": "user",
                    "content": user_content_items(message),
                }));
            }
            Role::Assistant => {
                let text = message.content_text();
                if !text.is_empty() {
                    input.push(json!({
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": text }],
                    }));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }));
                    }
                }
            }
            Role::Tool => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": message.tool_call_id.clone().unwrap_or_default(),
                    "output": message.content_text(),
                }));
            }
        }
    }

    let mut obj = serde_json::Map::new();
    obj.insert("model".to_string(), Value::String(upstream_model.to_string()));
    obj.insert("input".to_string(), Value::Array(input));

    if !instructions.is_empty() {
        obj.insert("instructions".to_string(), Value::String(instructions));
    }
    if let Some(stream) = req.stream {
        obj.insert("stream".to_string(), Value::Bool(stream));
    }
    if let Some(temp) = req.temperature {
        obj.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max) = req.max_tokens {
        obj.insert("max_output_tokens".to_string(), Value::from(max));
    }
    if let Some(effort) = req.reasoning_effort.filter(|_| caps.reasoning) {
        obj.insert(
            "reasoning".to_string(),
            json!({ "effort": effort.as_str() }),
        );
    }
    if caps.tools {
        if let Some(tools) = &req.tools {
            let encoded: Vec<Value> = tools
                .iter()
                .filter(|tool| tool.tool_type == "function")
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "parameters": tool.function.parameters,
                    })
                })
                .collect();
            if !encoded.is_empty() {
                obj.insert("tools".to_string(), Value::Array(encoded));
            }
        }
        if let Some(choice) = &req.tool_choice {
            match choice {
                // auto is implicit for the responses API
                ToolChoice::Mode(mode) if mode == "auto" => {}
                ToolChoice::Mode(mode) => {
                    obj.insert("tool_choice".to_string(), Value::String(mode.clone()));
                }
                ToolChoice::Specific(value) => {
                    if let Some(name) = value
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                    {
                        obj.insert(
                            "tool_choice".to_string(),
                            json!({ "type": "function", "name": name }),
                        );
                    }
                }
            }
        }
    }
    Value::Object(obj)
}

fn user_content_items(message: &crate::openai::ChatMessage) -> Vec<Value> {
    match &message.content {
        Some(MessageContent::Text(text)) => {
            vec![json!({ "type": "input_text", "text": text })]
        }
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "type": "input_text", "text": text }),
                ContentPart::ImageUrl { image_url } => json!({
                    "type": "input_image",
                    "image_url": image_url.url,
                }),
            })
            .collect(),
        None => Vec::new(),
    }
}
