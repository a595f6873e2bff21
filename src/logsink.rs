use crate::openai::Usage;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

/// One structured record per completed request. Raw payloads are only
/// populated when debug payloads are enabled.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub requested_model: String,
    pub used_model: Option<String>,
    pub provider: Option<String>,
    pub streamed: bool,
    pub cache_hit: bool,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
}

#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<RequestLogRecord>,
}

impl LogSink {
    /// Spawns the drain task. The channel is unbounded so the response
    /// path never blocks on logging.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestLogRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                emit(&record);
            }
        });
        Self { tx }
    }

    /// Fire and forget. A closed drain task only means the record is
    /// dropped.
    pub fn push(&self, record: RequestLogRecord) {
        let _ = self.tx.send(record);
    }
}

fn emit(record: &RequestLogRecord) {
    info!(
        request_id = %record.request_id,
        requested_model = %record.requested_model,
        used_model = record.used_model.as_deref().unwrap_or(""),
        provider = record.provider.as_deref().unwrap_or(""),
        streamed = record.streamed,
        cache_hit = record.cache_hit,
        prompt_tokens = record.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        completion_tokens = record.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
        total_tokens = record.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
        cost_usd = record.cost_usd.unwrap_or(0.0),
        duration_ms = record.duration_ms,
        error = record.error.as_deref().unwrap_or(""),
        request_payload = %record
            .request_payload
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        response_payload = %record
            .response_payload
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        "request completed"
    );
}
