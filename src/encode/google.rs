use crate::encode::{effort_to_budget, floor_max_tokens, specific_tool_name, tool_choice_mode};
use crate::openai::{ChatRequest, ToolDefinition};
use crate::registry::ModelCapabilities;
use crate::transform::ImageFetcher;
use crate::transform::google::scrub_schema;
use serde_json::{Value, json};

pub async fn build(
    _upstream_model: &str,
    caps: &ModelCapabilities,
    req: &ChatRequest,
    fetcher: &ImageFetcher,
) -> Value {
    let converted = crate::transform::google::convert_contents(&req.messages, fetcher).await;

    // the model is addressed in the URL path, not the body
    let mut obj = serde_json::Map::new();
    obj.insert("contents".to_string(), Value::Array(converted.contents));

    if let Some(system) = converted.system_instruction {
        obj.insert("systemInstruction".to_string(), system);
    }

    let thinking_budget = req
        .reasoning_effort
        .filter(|_| caps.reasoning)
        .map(effort_to_budget);

    let mut generation = serde_json::Map::new();
    if let Some(temp) = req.temperature {
        generation.insert("temperature".to_string(), Value::from(temp));
    }
    if let Some(top_p) = req.top_p {
        generation.insert("topP".to_string(), Value::from(top_p));
    }
    match thinking_budget {
        Some(budget) => {
            generation.insert(
                "maxOutputTokens".to_string(),
                Value::from(floor_max_tokens(req.max_tokens, budget)),
            );
            generation.insert(
                "thinkingConfig".to_string(),
                json!({ "thinkingBudget": budget, "includeThoughts": true }),
            );
        }
        None => {
            if let Some(max) = req.max_tokens {
                generation.insert("maxOutputTokens".to_string(), Value::from(max));
            }
        }
    }
    if req
        .response_format
        .as_ref()
        .and_then(|f| f.get("type"))
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == "json_object" || t == "json_schema")
    {
        generation.insert(
            "responseMimeType".to_string(),
            Value::String("application/json".to_string()),
        );
    }
    if !generation.is_empty() {
        obj.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if caps.tools {
        if let Some(tools) = &req.tools {
            if !tools.is_empty() {
                obj.insert(
                    "tools".to_string(),
                    json!([{ "functionDeclarations": encode_declarations(tools) }]),
                );
            }
        }
        if let Some(choice) = &req.tool_choice {
            // AUTO is Google's implicit default; omit it.
            match tool_choice_mode(choice) {
                Some("auto") => {}
                Some("none") => {
                    obj.insert(
                        "toolConfig".to_string(),
                        json!({ "functionCallingConfig": { "mode": "NONE" } }),
                    );
                }
                Some("required") => {
                    obj.insert(
                        "toolConfig".to_string(),
                        json!({ "functionCallingConfig": { "mode": "ANY" } }),
                    );
                }
                _ => {
                    if let Some(name) = specific_tool_name(choice) {
                        obj.insert(
                            "toolConfig".to_string(),
                            json!({
                                "functionCallingConfig": {
                                    "mode": "ANY",
                                    "allowedFunctionNames": [name]
                                }
                            }),
                        );
                    }
                }
            }
        }
    }

    Value::Object(obj)
}

fn encode_declarations(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .filter(|tool| tool.tool_type == "function")
        .map(|tool| {
            let mut declaration = json!({ "name": tool.function.name });
            if let Some(description) = &tool.function.description {
                declaration["description"] = Value::String(description.clone());
            }
            if let Some(parameters) = &tool.function.parameters {
                let mut schema = parameters.clone();
                scrub_schema(&mut schema);
                declaration["parameters"] = schema;
            }
            declaration
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
            model: "gemini".to_string(),
            messages: vec![
                ChatMessage::text(Role::System, "terse"),
                ChatMessage::text(Role::User, "hi"),
            ],
            stream: None,
            temperature: Some(0.5),
            top_p: Some(0.8),
            max_tokens: Some(256),
            frequency_penalty: None,
            presence_penalty: None,
            reasoning_effort: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn generation_config_and_system_instruction() {
        let body = build("gemini-pro", &ModelCapabilities::default(), &request(), &fetcher()).await;
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "terse");
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
        assert_eq!(body["generationConfig"]["topP"], 0.8);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[tokio::test]
    async fn reasoning_effort_sets_thinking_budget() {
        let mut req = request();
        req.reasoning_effort = Some(ReasoningEffort::Medium);
        let caps = ModelCapabilities {
            reasoning: true,
            ..ModelCapabilities::default()
        };
        let body = build("gemini-pro", &caps, &req, &fetcher()).await;
        let config = &body["generationConfig"];
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], 4096);
        assert_eq!(config["maxOutputTokens"], 4096 + 1024);
    }

    #[tokio::test]
    async fn tool_declarations_are_scrubbed() {
        let mut req = request();
        req.tools = Some(vec![ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionSpec {
                name: "search".to_string(),
                description: None,
                parameters: Some(json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": { "q": { "type": "string" } }
                })),
                strict: None,
            },
        }]);
        req.tool_choice = Some(ToolChoice::Mode("required".to_string()));
        let body = build("gemini-pro", &ModelCapabilities::default(), &req, &fetcher()).await;
        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "search");
        assert!(declaration["parameters"].get("$schema").is_none());
        assert!(declaration["parameters"].get("additionalProperties").is_none());
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
    }

    #[tokio::test]
    async fn auto_tool_choice_is_omitted() {
        let mut req = request();
        req.tool_choice = Some(ToolChoice::Mode("auto".to_string()));
        let body = build("gemini-pro", &ModelCapabilities::default(), &req, &fetcher()).await;
        assert!(body.get("toolConfig").is_none());
    }
}
