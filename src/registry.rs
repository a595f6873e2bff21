use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One (logical model, provider) mapping with its capability flags and
/// pricing. The registry is read-only data from the gateway's point of
/// view; records are replaced wholesale on config reload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRecord {
    pub model: String,
    pub provider_id: String,
    pub upstream_model: String,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub pricing: ModelPricing,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelCapabilities {
    pub max_context_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub streaming: bool,
    pub vision: bool,
    pub tools: bool,
    pub parallel_tool_calls: bool,
    pub reasoning: bool,
    /// Models without a system role get system messages folded into the
    /// user role before encoding.
    pub system_role: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            max_context_tokens: None,
            max_output_tokens: None,
            streaming: true,
            vision: false,
            tools: true,
            parallel_tool_calls: true,
            reasoning: false,
            system_role: true,
        }
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    #[serde(default)]
    pub prompt_usd_per_mtok: f64,
    #[serde(default)]
    pub completion_usd_per_mtok: f64,
}

impl ModelPricing {
    pub fn estimate_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.prompt_usd_per_mtok
            + completion_tokens as f64 * self.completion_usd_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RwLock<HashMap<(String, String), ModelRecord>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn all_records(&self) -> Vec<ModelRecord> {
        let guard = self.inner.read().await;
        guard.values().cloned().collect()
    }

    /// Everything that can serve `model`, in registration order.
    pub async fn providers_for_model(&self, model: &str) -> Vec<ModelRecord> {
        let guard = self.inner.read().await;
        let mut records: Vec<ModelRecord> = guard
            .values()
            .filter(|record| record.model == model)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        records
    }

    pub async fn find(&self, model: &str, provider_id: &str) -> Option<ModelRecord> {
        let guard = self.inner.read().await;
        guard
            .get(&(model.to_string(), provider_id.to_string()))
            .cloned()
    }

    pub async fn replace_records(&self, records: Vec<ModelRecord>) {
        let mut guard = self.inner.write().await;
        guard.clear();
        for record in records {
            guard.insert((record.model.clone(), record.provider_id.clone()), record);
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, provider: &str) -> ModelRecord {
        ModelRecord {
            model: model.to_string(),
            provider_id: provider.to_string(),
            upstream_model: model.to_string(),
            capabilities: ModelCapabilities::default(),
            pricing: ModelPricing::default(),
        }
    }

    #[tokio::test]
    async fn lookup_by_model_and_pair() {
        let registry = CapabilityRegistry::new();
        registry
            .replace_records(vec![
                record("sonnet", "anthropic"),
                record("sonnet", "bedrock"),
                record("gpt-4o", "openai"),
            ])
            .await;

        let candidates = registry.providers_for_model("sonnet").await;
        assert_eq!(candidates.len(), 2);
        assert!(registry.find("gpt-4o", "openai").await.is_some());
        assert!(registry.find("gpt-4o", "anthropic").await.is_none());
        assert!(registry.providers_for_model("nope").await.is_empty());
    }

    #[test]
    fn pricing_estimate() {
        let pricing = ModelPricing {
            prompt_usd_per_mtok: 3.0,
            completion_usd_per_mtok: 15.0,
        };
        let usd = pricing.estimate_usd(1_000_000, 100_000);
        assert!((usd - 4.5).abs() < 1e-9);
    }
}
