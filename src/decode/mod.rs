use crate::config::ProviderKind;
use crate::error::{AppError, AppResult};
use crate::openai::{ChatMessage, ChatResponse, ResponseMetadata, Usage};
use serde_json::Value;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

pub mod anthropic;
pub mod google;
pub mod openai;

/// Per-request context the unifiers need: the model echo for metadata
/// and the original messages for the local-tokenization fallback.
pub struct UnifyContext<'a> {
    pub requested_model: &'a str,
    pub upstream_model: &'a str,
    pub provider_id: &'a str,
    pub request_messages: &'a [ChatMessage],
}

impl UnifyContext<'_> {
    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            requested_model: self.requested_model.to_string(),
            used_model: self.upstream_model.to_string(),
            provider: self.provider_id.to_string(),
        }
    }
}

/// Converts a provider's complete JSON response into the canonical
/// chat-completion shape.
pub fn unify(kind: ProviderKind, raw: &Value, ctx: &UnifyContext<'_>) -> AppResult<ChatResponse> {
    match kind {
        ProviderKind::Anthropic => anthropic::unify(raw, ctx),
        ProviderKind::Google => google::unify(raw, ctx),
        ProviderKind::OpenaiResponses => openai::unify_responses(raw, ctx),
        ProviderKind::OpenaiChat | ProviderKind::OpenaiCompatible => openai::unify_chat(raw, ctx),
    }
}

/// Usage reconciliation: floors of 1 on prompt and total so zero-usage
/// responses never break client-side cost math, and the total always
/// covers prompt + completion (+ reasoning when the provider bills it
/// separately).
pub fn reconcile_usage(
    prompt_tokens: u64,
    completion_tokens: u64,
    reasoning_tokens: Option<u64>,
    cached_tokens: Option<u64>,
    provider_total: Option<u64>,
) -> Usage {
    let prompt_tokens = prompt_tokens.max(1);
    let computed = prompt_tokens + completion_tokens + reasoning_tokens.unwrap_or(0);
    let total_tokens = provider_total
        .unwrap_or(computed)
        .max(prompt_tokens + completion_tokens)
        .max(1);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        reasoning_tokens,
        cached_tokens,
    }
}

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer"))
}

/// Local prompt-token estimate for providers that report zero prompt
/// tokens (known Google quirk). An estimate only; never used to lower a
/// nonzero provider count.
pub fn fallback_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    let mut total: u64 = 0;
    for message in messages {
        // rough per-message framing overhead
        total += 4;
        let text = message.content_text();
        if !text.is_empty() {
            total += bpe().encode_with_special_tokens(&text).len() as u64;
        }
    }
    total.max(1)
}

pub fn malformed(provider_id: &str, what: &str) -> AppError {
    AppError::upstream(provider_id, format!("malformed response: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::Role;

    #[test]
    fn usage_floors_and_total_invariant() {
        let usage = reconcile_usage(0, 0, None, None, None);
        assert_eq!(usage.prompt_tokens, 1);
        assert_eq!(usage.total_tokens, 1);

        let usage = reconcile_usage(10, 5, None, None, None);
        assert_eq!(usage.total_tokens, 15);

        // provider-reported total below prompt+completion is corrected
        let usage = reconcile_usage(10, 5, None, None, Some(3));
        assert_eq!(usage.total_tokens, 15);

        // reasoning billed alongside completion tokens
        let usage = reconcile_usage(10, 5, Some(7), None, None);
        assert_eq!(usage.total_tokens, 22);

        // provider total wins when it already covers everything
        let usage = reconcile_usage(10, 5, Some(7), None, Some(30));
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn fallback_prompt_tokens_is_positive_and_grows() {
        let short = fallback_prompt_tokens(&[ChatMessage::text(Role::User, "hi")]);
        let long = fallback_prompt_tokens(&[ChatMessage::text(
            Role::User,
            "a considerably longer prompt with many more words in it",
        )]);
        assert!(short >= 1);
        assert!(long > short);
    }
}
