use crate::config::ProviderKind;
use crate::openai::{ChatRequest, ReasoningEffort, Role, ToolChoice};
use crate::registry::ModelCapabilities;
use crate::transform::ImageFetcher;
use serde_json::Value;

pub mod anthropic;
pub mod google;
pub mod openai_chat;
pub mod openai_responses;

/// Headroom added on top of a thinking budget so the visible answer is
/// not truncated before the model finishes reasoning.
pub const THINKING_MARGIN_TOKENS: u64 = 1024;

/// Builds the provider wire-format body for one request. Total over the
/// supported provider set; the OpenAI-compatible long tail shares the
/// chat-completions arm. System folding and sampling overrides apply
/// uniformly before the provider switch.
pub async fn build_request(
    kind: ProviderKind,
    upstream_model: &str,
    caps: &ModelCapabilities,
    req: &ChatRequest,
    fetcher: &ImageFetcher,
) -> Value {
    let req = prepare(req, upstream_model, caps);
    match kind {
        ProviderKind::Anthropic => anthropic::build(upstream_model, caps, &req, fetcher).await,
        ProviderKind::Google => google::build(upstream_model, caps, &req, fetcher).await,
        ProviderKind::OpenaiResponses => openai_responses::build(upstream_model, caps, &req),
        ProviderKind::OpenaiChat | ProviderKind::OpenaiCompatible => {
            openai_chat::build(upstream_model, caps, &req)
        }
    }
}

/// Provider-independent normalization: system-role folding for models
/// without a system role, and fixed sampling parameters for model
/// families that reject caller-supplied values.
fn prepare(req: &ChatRequest, upstream_model: &str, caps: &ModelCapabilities) -> ChatRequest {
    let mut req = req.clone();
    if !caps.system_role {
        for message in &mut req.messages {
            if message.role == Role::System {
                message.role = Role::User;
            }
        }
    }
    if let Some(forced) = forced_temperature(upstream_model) {
        if req.temperature.is_some() {
            req.temperature = Some(forced);
        }
        req.top_p = None;
    }
    if !caps.reasoning {
        req.reasoning_effort = None;
    }
    req
}

/// Reasoning model families accept exactly one temperature.
fn forced_temperature(model: &str) -> Option<f64> {
    let base = model.rsplit('/').next().unwrap_or(model);
    ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|family| {
            base == *family
                || base
                    .strip_prefix(family)
                    .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('.'))
        })
        .then_some(1.0)
}

/// Effort level to Anthropic/Google thinking-token budget.
pub fn effort_to_budget(effort: ReasoningEffort) -> u64 {
    match effort {
        ReasoningEffort::Minimal => 512,
        ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 4096,
        ReasoningEffort::High => 16384,
    }
}

/// Raise max_tokens to at least budget + margin unless the caller asked
/// for more.
pub fn floor_max_tokens(requested: Option<u64>, budget: u64) -> u64 {
    let floor = budget + THINKING_MARGIN_TOKENS;
    requested.map_or(floor, |v| v.max(floor))
}

pub fn tool_choice_mode(choice: &ToolChoice) -> Option<&str> {
    match choice {
        ToolChoice::Mode(mode) => Some(mode.as_str()),
        ToolChoice::Specific(_) => None,
    }
}

pub fn specific_tool_name(choice: &ToolChoice) -> Option<&str> {
    match choice {
        ToolChoice::Specific(value) => value
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str()),
        ToolChoice::Mode(_) => None,
    }
}
