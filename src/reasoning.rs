use crate::config::ProviderKind;
use serde_json::Value;

/// Pulls reasoning text out of one provider delta. Returns an empty
/// string when the delta carries none, so callers can concatenate
/// unconditionally.
pub fn extract_reasoning(kind: ProviderKind, delta: &Value) -> String {
    match kind {
        ProviderKind::Anthropic => delta
            .get("delta")
            .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("thinking_delta"))
            .and_then(|d| d.get("thinking"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        ProviderKind::Google => {
            let mut out = String::new();
            if let Some(parts) = delta
                .get("candidates")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|c| c.get("content"))
                .and_then(|c| c.get("parts"))
                .and_then(|v| v.as_array())
            {
                for part in parts {
                    if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            out.push_str(text);
                        }
                    }
                }
            }
            out
        }
        ProviderKind::OpenaiResponses => {
            if delta.get("type").and_then(|t| t.as_str())
                == Some("response.reasoning_text.delta")
            {
                delta
                    .get("delta")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            } else {
                String::new()
            }
        }
        ProviderKind::OpenaiChat | ProviderKind::OpenaiCompatible => delta
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("delta"))
            .map(|d| {
                d.get("reasoning_content")
                    .or_else(|| d.get("reasoning"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            })
            .unwrap_or_default(),
    }
}
