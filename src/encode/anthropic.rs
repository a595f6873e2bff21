use crate::encode::{effort_to_budget, floor_max_tokens, specific_tool_name, tool_choice_mode};
use crate::openai::{ChatRequest, ToolDefinition};
use crate::registry::ModelCapabilities;
use crate::transform::{ImageFetcher, TransformContext};
use serde_json::{Value, json};

const DEFAULT_MAX_TOKENS: u64 = 4096;

pub async fn build(
    upstream_model: &str,
    caps: &ModelCapabilities,
    req: &ChatRequest,
    fetcher: &ImageFetcher,
) -> Value {
    let mut ctx = TransformContext::new(&req.messages);
    let converted = crate::transform::anthropic::convert_messages(&req.messages, &mut ctx, fetcher).await;

    let thinking_budget = req
        .reasoning_effort
        .filter(|_| caps.reasoning)
        .map(effort_to_budget);
    let max_tokens = match thinking_budget {
        Some(budget) => floor_max_tokens(req.max_tokens, budget),
        None => req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    };

    let mut obj = serde_json::Map::new();
    obj.insert("model".to_string(), Value::String(upstream_model.to_string()));
    obj.insert("messages".to_string(), Value::Array(converted.messages));
    obj.insert("max_tokens".to_string(), Value::from(max_tokens));

    if !converted.system.is_empty() {
        obj.insert("system".to_string(), Value::Array(converted.system));
    }
    if let Some(stream) = req.stream {
        obj.insert("stream".to_string(), Value::Bool(stream));
    }
    // Extended thinking rejects caller-tuned sampling.
    if thinking_budget.is_none() {
        if let Some(temp) = req.temperature {
            obj.insert("temperature".to_string(), Value::from(temp));
        }
        if let Some(top_p) = req.top_p {
            obj.insert("top_p".to_string(), Value::from(top_p));
        }
    }
    if caps.tools {
        if let Some(tools) = &req.tools {
            if !tools.is_empty() {
                obj.insert("tools".to_string(), Value::Array(encode_tools(tools)));
            }
        }
        if let Some(choice) = &req.tool_choice {
            // "auto" is Anthropic's implicit default; omit it.
            match tool_choice_mode(choice) {
                Some("auto") => {}
                Some("required") => {
                    obj.insert("tool_choice".to_string(), json!({ "type": "any" }));
                }
                Some("none") => {
                    obj.insert("tool_choice".to_string(), json!({ "type": "none" }));
                }
                Some(other) => {
                    obj.insert("tool_choice".to_string(), json!({ "type": other }));
                }
                None => {
                    if let Some(name) = specific_tool_name(choice) {
                        obj.insert(
                            "tool_choice".to_string(),
                            json!({ "type": "tool", "name": name }),
                        );
                    }
                }
            }
        }
    }
    if let Some(budget) = thinking_budget {
        obj.insert(
            "thinking".to_string(),
            json!({ "type": "enabled", "budget_tokens": budget }),
        );
    }
    Value::Object(obj)
}

fn encode_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .filter(|tool| tool.tool_type == "function")
        .map(|tool| {
            json!({
                "name": tool.function.name,
                "description": tool.function.description,
                "input_schema": tool.function.parameters.clone().unwrap_or(json!({
                    "type": "object",
                    "properties": {},
                })),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, FunctionSpec, ReasoningEffort, Role, ToolChoice};
    use std::collections::HashMap;

    fn fetcher() -> ImageFetcher {
        ImageFetcher::new(reqwest::Client::new(), 1_000)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "sonnet".to_string(),
            messages: vec![
                ChatMessage::text(Role::System, "terse"),
                ChatMessage::text(Role::User, "hi"),
            ],
            stream: None,
            temperature: Some(0.3),
            top_p: None,
            max_tokens: Some(100),
            frequency_penalty: None,
            presence_penalty: None,
            reasoning_effort: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            extra: HashMap::new(),
        }
    }

    fn reasoning_caps() -> ModelCapabilities {
        ModelCapabilities {
            reasoning: true,
            ..ModelCapabilities::default()
        }
    }

    #[tokio::test]
    async fn basic_body_shape() {
        let body = build("claude-x", &ModelCapabilities::default(), &request(), &fetcher()).await;
        assert_eq!(body["model"], "claude-x");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["system"][0]["text"], "terse");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("thinking").is_none());
    }

    #[tokio::test]
    async fn reasoning_effort_becomes_thinking_budget_with_token_floor() {
        let mut req = request();
        req.reasoning_effort = Some(ReasoningEffort::High);
        let body = build("claude-x", &reasoning_caps(), &req, &fetcher()).await;
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 16384);
        // caller asked for 100; floor raises it past budget + margin
        assert_eq!(body["max_tokens"], 16384 + 1024);
        // thinking drops caller-supplied sampling
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn tools_translate_to_input_schema_and_auto_is_omitted() {
        let mut req = request();
        req.tools = Some(vec![ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionSpec {
                name: "get_weather".to_string(),
                description: Some("weather".to_string()),
                parameters: Some(json!({ "type": "object", "properties": { "q": { "type": "string" } } })),
                strict: None,
            },
        }]);
        req.tool_choice = Some(ToolChoice::Mode("auto".to_string()));
        let body = build("claude-x", &ModelCapabilities::default(), &req, &fetcher()).await;
        assert_eq!(body["tools"][0]["name"], "get_weather");
        assert!(body["tools"][0].get("input_schema").is_some());
        assert!(body["tools"][0].get("parameters").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[tokio::test]
    async fn required_and_specific_tool_choice_translate() {
        let mut req = request();
        req.tool_choice = Some(ToolChoice::Mode("required".to_string()));
        let body = build("claude-x", &ModelCapabilities::default(), &req, &fetcher()).await;
        assert_eq!(body["tool_choice"]["type"], "any");

        req.tool_choice = Some(ToolChoice::Specific(
            json!({ "type": "function", "function": { "name": "get_weather" } }),
        ));
        let body = build("claude-x", &ModelCapabilities::default(), &req, &fetcher()).await;
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "get_weather");
    }
}
