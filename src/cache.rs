use crate::openai::{ChatRequest, ChatResponse, FinishReason};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// One buffered SSE frame of a completed stream, replayable verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedChunk {
    pub data: String,
    pub event_id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub model: String,
    pub provider: String,
    pub finish_reason: Option<FinishReason>,
    pub total_chunks: u64,
    pub duration_ms: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub chunks: Vec<BufferedChunk>,
    pub meta: StreamMeta,
}

#[derive(Debug, Clone)]
pub enum CacheEntry {
    Response(ChatResponse),
    Stream(StreamBuffer),
}

struct StoredEntry {
    value: CacheEntry,
    expires_at: Instant,
}

/// Content-addressed memoization of whole responses and replayable
/// stream chunk buffers. Single-key get/put; a get-then-put race for
/// the same key overwrites idempotently (the value is a deterministic
/// function of the key), so no cross-key locking is needed.
pub struct ResponseCache {
    entries: DashMap<String, StoredEntry>,
    ttl: Duration,
    disabled: bool,
}

impl ResponseCache {
    pub fn new(ttl: Duration, disabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            disabled,
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        if self.disabled {
            return None;
        }
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        }
        // expired: drop lazily
        self.entries
            .remove_if(key, |_, stored| stored.expires_at <= Instant::now());
        None
    }

    pub fn put(&self, key: String, value: CacheEntry) {
        if self.disabled {
            return;
        }
        self.entries.insert(
            key,
            StoredEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn put_response(&self, key: String, response: ChatResponse) {
        self.put(key, CacheEntry::Response(response));
    }

    /// Streams are only cached when the upstream completed normally.
    pub fn put_stream(&self, key: String, buffer: StreamBuffer) {
        if buffer.meta.completed {
            self.put(key, CacheEntry::Stream(buffer));
        }
    }

    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, stored| stored.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SHA-256 over the canonical JSON of the semantically relevant request
/// fields. Volatile inputs (request ids, headers, timestamps) never
/// reach this value, and the stream flag is excluded so a streaming and
/// a non-streaming request share upstream work only through their own
/// entry kinds.
pub fn canonical_key(req: &ChatRequest) -> String {
    let mut canonical = req.clone();
    canonical.stream = None;
    let mut value = serde_json::to_value(&canonical).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("stream");
        obj.remove("user");
    }
    // serde_json maps serialize with sorted keys, so this is canonical
    let serialized = serde_json::to_string(&value).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, Choice, ResponseMessage, Role, Usage};
    use serde_json::json;
    use std::collections::HashMap;

    fn request(model: &str, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::text(Role::User, prompt)],
            stream: None,
            temperature: Some(0.0),
            top_p: None,
            max_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            reasoning_effort: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            extra: HashMap::new(),
        }
    }

    fn response(id: &str) -> ChatResponse {
        ChatResponse {
            id: id.to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: Role::Assistant,
                    content: Some("ok".to_string()),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: FinishReason::Stop,
            }],
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                reasoning_tokens: None,
                cached_tokens: None,
            },
            metadata: None,
        }
    }

    #[test]
    fn identical_requests_collide_and_volatile_fields_do_not_matter() {
        let a = request("m", "hello");
        let mut b = request("m", "hello");
        b.stream = Some(true);
        b.extra
            .insert("user".to_string(), json!("someone-else"));
        assert_eq!(canonical_key(&a), canonical_key(&b));

        let c = request("m", "different prompt");
        assert_ne!(canonical_key(&a), canonical_key(&c));
        let d = request("other-model", "hello");
        assert_ne!(canonical_key(&a), canonical_key(&d));
    }

    #[test]
    fn sampling_params_are_part_of_the_key() {
        let a = request("m", "hello");
        let mut b = request("m", "hello");
        b.temperature = Some(0.9);
        assert_ne!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn get_put_roundtrip_and_overwrite() {
        let cache = ResponseCache::new(Duration::from_secs(60), false);
        let key = "k".to_string();
        assert!(cache.get(&key).is_none());
        cache.put_response(key.clone(), response("one"));
        cache.put_response(key.clone(), response("two"));
        match cache.get(&key) {
            Some(CacheEntry::Response(resp)) => assert_eq!(resp.id, "two"),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn ttl_expiry_drops_entries() {
        let cache = ResponseCache::new(Duration::from_millis(0), false);
        cache.put_response("k".to_string(), response("one"));
        assert!(cache.get("k").is_none());
        cache.sweep_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResponseCache::new(Duration::from_secs(60), true);
        cache.put_response("k".to_string(), response("one"));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn incomplete_streams_are_not_cached() {
        let cache = ResponseCache::new(Duration::from_secs(60), false);
        let meta = StreamMeta {
            model: "m".to_string(),
            provider: "p".to_string(),
            finish_reason: None,
            total_chunks: 1,
            duration_ms: 5,
            completed: false,
        };
        cache.put_stream(
            "k".to_string(),
            StreamBuffer {
                chunks: vec![BufferedChunk {
                    data: "{}".to_string(),
                    event_id: 0,
                    timestamp: 0,
                }],
                meta,
            },
        );
        assert!(cache.get("k").is_none());
    }
}
