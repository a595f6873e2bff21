use crate::config::{ProviderAuthConfig, ProviderAuthType, ProviderConfig, ProviderKind};
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    /// Client-facing mapping. The raw upstream body stays out of the
    /// response: upstream 4xx relays the status with the upstream's
    /// error code only, everything else collapses to 502/504.
    pub fn into_app_error(self, provider_id: &str) -> AppError {
        warn!(
            provider = provider_id,
            status = ?self.status,
            code = ?self.code,
            "upstream call failed: {}",
            self.message
        );
        match self.kind {
            UpstreamErrorKind::Timeout => AppError::upstream_timeout(provider_id),
            UpstreamErrorKind::Network => {
                AppError::upstream(provider_id, "upstream request failed")
            }
            UpstreamErrorKind::Http => match self.status {
                Some(status) if status.is_client_error() => {
                    let detail = match &self.code {
                        Some(code) => format!("upstream rejected the request ({code})"),
                        None => "upstream rejected the request".to_string(),
                    };
                    AppError::new(status, "upstream_error", detail).with_type("api_error")
                }
                Some(status) => AppError::upstream(
                    provider_id,
                    format!("upstream returned status {status}"),
                ),
                None => AppError::upstream(provider_id, self.message),
            },
        }
    }
}

/// Upstream endpoint for one call. Google embeds the model and the
/// stream mode in the path; the OpenAI-shaped dialects use a fixed
/// path and a `stream` body flag.
pub fn endpoint_path(kind: ProviderKind, upstream_model: &str, stream: bool) -> String {
    match kind {
        ProviderKind::OpenaiChat | ProviderKind::OpenaiCompatible => {
            "/v1/chat/completions".to_string()
        }
        ProviderKind::OpenaiResponses => "/v1/responses".to_string(),
        ProviderKind::Anthropic => "/v1/messages".to_string(),
        ProviderKind::Google => {
            if stream {
                format!("/v1beta/models/{upstream_model}:streamGenerateContent?alt=sse")
            } else {
                format!("/v1beta/models/{upstream_model}:generateContent")
            }
        }
    }
}

fn extra_headers(kind: ProviderKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ProviderKind::Anthropic => &[("anthropic-version", "2023-06-01")],
        _ => &[],
    }
}

pub async fn call_json(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    upstream_model: &str,
    body: &Value,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = send(client, provider, upstream_model, body, timeout_ms, false).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })?;
    Ok(value)
}

pub async fn call_stream(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    upstream_model: &str,
    body: &Value,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    send(client, provider, upstream_model, body, timeout_ms, true).await
}

async fn send(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    upstream_model: &str,
    body: &Value,
    timeout_ms: u64,
    stream: bool,
) -> Result<reqwest::Response, UpstreamCallError> {
    let path = endpoint_path(provider.kind, upstream_model, stream);
    let url = join_url(&provider.base_url, &path);
    let mut req = client
        .post(url)
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .json(body);
    req = apply_auth(req, &provider.auth);
    for (k, v) in extra_headers(provider.kind) {
        req = req.header(*k, *v);
    }
    let resp = req.send().await.map_err(|err| {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        UpstreamCallError::new(kind, err.status(), err.to_string())
    })?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {status}: {text}"),
        )
        .with_code(code));
    }
    Ok(resp)
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &ProviderAuthConfig) -> reqwest::RequestBuilder {
    let value = resolve_auth_value(&auth.value);
    match auth.auth_type {
        ProviderAuthType::Bearer => req.bearer_auth(value),
        ProviderAuthType::Header => {
            let header_name = auth
                .header_name
                .clone()
                .unwrap_or_else(|| "x-api-key".to_string());
            req.header(header_name, value)
        }
        ProviderAuthType::Query => {
            let query_name = auth.query_name.clone().unwrap_or_else(|| "key".to_string());
            req.query(&[(query_name, value)])
        }
    }
}

/// `env:NAME` indirection keeps keys out of the config file.
fn resolve_auth_value(raw: &str) -> String {
    match raw.strip_prefix("env:") {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => raw.to_string(),
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code").or_else(|| v.get("type")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_deduplicates_v1() {
        assert_eq!(
            join_url("https://api.example.com/v1", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.example.com", "/v1/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            join_url("https://api.example.com/", "v1/responses"),
            "https://api.example.com/v1/responses"
        );
    }

    #[test]
    fn google_endpoint_embeds_model_and_stream_mode() {
        assert_eq!(
            endpoint_path(ProviderKind::Google, "gemini-2.5-pro", false),
            "/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            endpoint_path(ProviderKind::Google, "gemini-2.5-pro", true),
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            endpoint_path(ProviderKind::Anthropic, "claude", true),
            "/v1/messages"
        );
    }

    #[test]
    fn client_errors_relay_status_without_upstream_body() {
        let err = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::BAD_REQUEST),
            "upstream status 400: {\"error\":{\"code\":\"invalid_request\",\"message\":\"secret detail\"}}".to_string(),
        )
        .with_code(Some("invalid_request".to_string()));
        let app = err.into_app_error("p1");
        assert_eq!(app.status, StatusCode::BAD_REQUEST);
        assert!(app.message.contains("invalid_request"));
        assert!(!app.message.contains("secret detail"));
    }

    #[test]
    fn timeouts_become_504() {
        let err = UpstreamCallError::new(UpstreamErrorKind::Timeout, None, "timed out".to_string());
        let app = err.into_app_error("p1");
        assert_eq!(app.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn auth_value_env_indirection() {
        unsafe { std::env::set_var("OMNIRELAY_TEST_AUTH_VALUE", "sk-123") };
        assert_eq!(resolve_auth_value("env:OMNIRELAY_TEST_AUTH_VALUE"), "sk-123");
        assert_eq!(resolve_auth_value("literal-key"), "literal-key");
        unsafe { std::env::remove_var("OMNIRELAY_TEST_AUTH_VALUE") };
    }
}
