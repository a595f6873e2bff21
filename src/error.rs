use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

/// Client-facing error in the OpenAI envelope. `code` is stable and
/// machine-readable; `message` never carries raw upstream bodies or
/// provider credentials.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn unsupported_model(model: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "unsupported_model",
            format!("model '{model}' is not mapped to any provider"),
        )
        .with_param("model")
    }

    pub fn unsupported_capability(model: &str, capability: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "unsupported_capability",
            format!("model '{model}' does not support {capability}"),
        )
        .with_param("model")
    }

    pub fn upstream_timeout(provider: &str) -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            format!("upstream provider '{provider}' timed out"),
        )
        .with_type("api_error")
    }

    pub fn upstream(provider: &str, detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            format!("upstream provider '{provider}': {}", detail.into()),
        )
        .with_type("api_error")
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "param": self.param,
                "code": self.code,
            }
        });
        (self.status, axum::Json(body)).into_response()
    }
}
