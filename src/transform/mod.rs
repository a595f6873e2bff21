use crate::openai::{ChatMessage, Role};
use base64::Engine;
use std::collections::HashMap;

pub mod anthropic;
pub mod google;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("image fetch failed: {0}")]
    ImageFetch(String),
    #[error("unsupported content: {0}")]
    Unsupported(String),
}

/// Provider-imposed ceiling on cache_control blocks per request.
pub const MAX_CACHE_BREAKPOINTS: usize = 4;
/// Text blocks at or above this approximate token count get a cache hint.
pub const CACHE_HINT_MIN_TOKENS: u64 = 1024;
const APPROX_CHARS_PER_TOKEN: u64 = 4;
/// Fan-out bound for image fetches within one request.
pub const IMAGE_FETCH_CONCURRENCY: usize = 4;

/// Request-scoped mutable state threaded through one transformation
/// pass: the cache-hint budget and the tool_use id-uniqueness
/// bookkeeping. Never shared across requests.
pub struct TransformContext {
    cache_breakpoints: usize,
    tool_id_counts: HashMap<String, u32>,
    tool_id_assignments: HashMap<String, Vec<String>>,
    tool_results_taken: HashMap<String, usize>,
    tool_result_counts: HashMap<String, usize>,
}

impl TransformContext {
    /// Pre-scans the message list so tool_result fan-out can tell a
    /// single orphaned result from a sequentially paired one.
    pub fn new(messages: &[ChatMessage]) -> Self {
        let mut tool_result_counts: HashMap<String, usize> = HashMap::new();
        for message in messages {
            if message.role == Role::Tool {
                if let Some(id) = &message.tool_call_id {
                    *tool_result_counts.entry(id.clone()).or_default() += 1;
                }
            }
        }
        Self {
            cache_breakpoints: 0,
            tool_id_counts: HashMap::new(),
            tool_id_assignments: HashMap::new(),
            tool_results_taken: HashMap::new(),
            tool_result_counts,
        }
    }

    /// Returns a globally unique tool_use id for this request. The first
    /// occurrence keeps the caller-supplied id; later duplicates are
    /// suffixed `_2`, `_3`, ... deterministically. Every assignment is
    /// recorded so tool_result correlation can follow the remap.
    pub fn assign_tool_use_id(&mut self, id: &str) -> String {
        let count = self.tool_id_counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        let assigned = if *count == 1 {
            id.to_string()
        } else {
            format!("{id}_{count}")
        };
        self.tool_id_assignments
            .entry(id.to_string())
            .or_default()
            .push(assigned.clone());
        assigned
    }

    /// The (possibly remapped) tool_use ids a tool_result with this
    /// correlation id must target. A single result for N duplicated
    /// tool_use ids fans out to all N; otherwise results pair with
    /// assignments in order.
    pub fn result_ids_for(&mut self, id: &str) -> Vec<String> {
        let assigned = match self.tool_id_assignments.get(id) {
            Some(ids) if !ids.is_empty() => ids.clone(),
            _ => return vec![id.to_string()],
        };
        let result_count = self.tool_result_counts.get(id).copied().unwrap_or(1);
        let taken = self.tool_results_taken.entry(id.to_string()).or_insert(0);
        if result_count == 1 && assigned.len() > 1 {
            *taken = assigned.len();
            return assigned;
        }
        let index = (*taken).min(assigned.len() - 1);
        *taken += 1;
        vec![assigned[index].clone()]
    }

    /// Claims one of the 4 cache_control slots; false once exhausted.
    pub fn try_reserve_cache_hint(&mut self) -> bool {
        if self.cache_breakpoints >= MAX_CACHE_BREAKPOINTS {
            return false;
        }
        self.cache_breakpoints += 1;
        true
    }

    pub fn cache_hints_used(&self) -> usize {
        self.cache_breakpoints
    }
}

/// chars/4 heuristic, not exact tokenization; only used for the cache
/// hint threshold.
pub fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64) / APPROX_CHARS_PER_TOKEN
}

pub fn cache_hint_eligible(text: &str) -> bool {
    approx_tokens(text) >= CACHE_HINT_MIN_TOKENS
}

pub fn image_failure_placeholder(url: &str) -> String {
    format!("[Image failed to load: {url}]")
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub media_type: String,
    pub data_b64: String,
}

/// Fetches remote images and re-encodes them as base64 for providers
/// that do not take URLs. `data:` URLs are decoded locally.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl ImageFetcher {
    pub fn new(client: reqwest::Client, timeout_ms: u64) -> Self {
        Self { client, timeout_ms }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedImage, TransformError> {
        if let Some(rest) = url.strip_prefix("data:") {
            return decode_data_url(rest);
        }
        let resp = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .send()
            .await
            .map_err(|err| TransformError::ImageFetch(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransformError::ImageFetch(format!(
                "status {} for {url}",
                resp.status()
            )));
        }
        let media_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
            .filter(|s| s.starts_with("image/"))
            .unwrap_or_else(|| {
                mime_guess::from_path(url)
                    .first()
                    .map(|m| m.essence_str().to_string())
                    .unwrap_or_else(|| "image/png".to_string())
            });
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| TransformError::ImageFetch(err.to_string()))?;
        Ok(FetchedImage {
            media_type,
            data_b64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }
}

fn decode_data_url(rest: &str) -> Result<FetchedImage, TransformError> {
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| TransformError::ImageFetch("malformed data url".to_string()))?;
    let media_type = header
        .split(';')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("image/png")
        .to_string();
    if header.ends_with(";base64") {
        Ok(FetchedImage {
            media_type,
            data_b64: data.to_string(),
        })
    } else {
        Ok(FetchedImage {
            media_type,
            data_b64: base64::engine::general_purpose::STANDARD.encode(data.as_bytes()),
        })
    }
}
