use crate::registry::ModelRecord;
use serde::{Deserialize, Serialize};

/// Upstream wire format. `OpenaiCompatible` covers the long tail of
/// vendors (Groq, Mistral, Moonshot, xAI, ...) that speak the OpenAI
/// chat-completions dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiChat,
    OpenaiResponses,
    Anthropic,
    Google,
    OpenaiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiChat => "openai_chat",
            Self::OpenaiResponses => "openai_responses",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::OpenaiCompatible => "openai_compatible",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth: ProviderAuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: ProviderAuthType,
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAuthType {
    Bearer,
    Header,
    Query,
}

/// On-disk gateway configuration: providers plus the model registry
/// records they serve.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelRecord>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub config_path: String,
    pub request_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    /// Test mode: cache writes become no-ops, reads always miss.
    pub cache_disabled: bool,
    /// Gate raw request/response payloads in log records.
    pub debug_payloads: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("OMNIRELAY_LISTEN", "0.0.0.0:8080"),
            config_path: env_or("OMNIRELAY_CONFIG", "omnirelay.json"),
            request_timeout_ms: env_or("OMNIRELAY_TIMEOUT_MS", "120000")
                .parse()
                .unwrap_or(120_000),
            cache_ttl_secs: env_or("OMNIRELAY_CACHE_TTL_SECS", "300")
                .parse()
                .unwrap_or(300),
            cache_disabled: env_flag("OMNIRELAY_TEST_MODE"),
            debug_payloads: env_flag("OMNIRELAY_DEBUG_PAYLOADS"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}
