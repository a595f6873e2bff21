use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::openai::ChatRequest;
use crate::registry::{CapabilityRegistry, ModelRecord};
use std::collections::HashMap;

/// Resolved (provider, model) pair for one request.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub provider: ProviderConfig,
    pub record: ModelRecord,
}

/// Pluggable selection among capable registry records for a bare model
/// id. The default picks the first capable record.
pub trait RoutePolicy: Send + Sync {
    fn select(&self, candidates: &[ModelRecord]) -> Option<ModelRecord>;
}

pub struct FirstCapable;

impl RoutePolicy for FirstCapable {
    fn select(&self, candidates: &[ModelRecord]) -> Option<ModelRecord> {
        candidates.first().cloned()
    }
}

/// What the request actually needs from the target, derived once and
/// re-checked defensively by the request builder.
#[derive(Debug, Clone, Copy)]
pub struct RequiredCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
}

impl RequiredCapabilities {
    pub fn of(req: &ChatRequest) -> Self {
        Self {
            streaming: req.stream.unwrap_or(false),
            tools: req.tools.as_ref().is_some_and(|t| !t.is_empty()),
            vision: req.messages.iter().any(|m| m.has_image_parts()),
        }
    }
}

/// Resolve the target provider/model pair. `"provider/model"` pins the
/// provider (when the prefix names a configured provider); a bare model
/// id consults the registry and defers to the routing policy. Pure
/// selection, no side effects.
pub async fn resolve_route(
    req: &ChatRequest,
    registry: &CapabilityRegistry,
    providers: &HashMap<String, ProviderConfig>,
    policy: &dyn RoutePolicy,
) -> AppResult<RouteTarget> {
    let record = match split_pinned(&req.model, providers) {
        Some((provider_id, model)) => registry
            .find(model, provider_id)
            .await
            .ok_or_else(|| AppError::unsupported_model(&req.model))?,
        None => {
            let candidates = registry.providers_for_model(&req.model).await;
            if candidates.is_empty() {
                return Err(AppError::unsupported_model(&req.model));
            }
            let required = RequiredCapabilities::of(req);
            let capable: Vec<ModelRecord> = candidates
                .into_iter()
                .filter(|record| satisfies(record, required))
                .collect();
            policy
                .select(&capable)
                .ok_or_else(|| first_mismatch_error(&req.model, required))?
        }
    };

    check_capabilities(&record, RequiredCapabilities::of(req))?;

    let provider = providers
        .get(&record.provider_id)
        .cloned()
        .ok_or_else(|| AppError::unsupported_model(&req.model))?;

    Ok(RouteTarget { provider, record })
}

fn split_pinned<'a>(
    model: &'a str,
    providers: &HashMap<String, ProviderConfig>,
) -> Option<(&'a str, &'a str)> {
    let (prefix, rest) = model.split_once('/')?;
    providers.contains_key(prefix).then_some((prefix, rest))
}

fn satisfies(record: &ModelRecord, required: RequiredCapabilities) -> bool {
    let caps = &record.capabilities;
    (!required.streaming || caps.streaming)
        && (!required.tools || caps.tools)
        && (!required.vision || caps.vision)
}

pub fn check_capabilities(record: &ModelRecord, required: RequiredCapabilities) -> AppResult<()> {
    let caps = &record.capabilities;
    if required.streaming && !caps.streaming {
        return Err(AppError::unsupported_capability(&record.model, "streaming"));
    }
    if required.tools && !caps.tools {
        return Err(AppError::unsupported_capability(
            &record.model,
            "tool calling",
        ));
    }
    if required.vision && !caps.vision {
        return Err(AppError::unsupported_capability(
            &record.model,
            "image input",
        ));
    }
    Ok(())
}

fn first_mismatch_error(model: &str, required: RequiredCapabilities) -> AppError {
    let capability = if required.vision {
        "image input"
    } else if required.tools {
        "tool calling"
    } else if required.streaming {
        "streaming"
    } else {
        "the requested features"
    };
    AppError::unsupported_capability(model, capability)
}
