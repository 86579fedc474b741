pub mod gemini;
pub mod openai;
pub mod retry;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use retry::{Backoff, FailureReason, RetryPolicy};
pub use types::*;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// Provider Configuration
// ============================================================

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const CEREBRAS_API_BASE: &str = "https://api.cerebras.ai/v1";
pub const OLLAMA_API_BASE: &str = "http://localhost:11434/v1";

/// Provider type identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Gemini,
    OpenAI,
    Cerebras,
    Ollama,
    /// Custom OpenAI-compatible endpoint
    Custom,
}

impl ProviderType {
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

/// Configuration for a single provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider ID (e.g., "gemini", "cerebras")
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// API key (optional for Ollama)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Custom base URL (optional, uses default for each provider type)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            id: id.into(),
            provider_type,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Create a provider from configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Gemini => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("gemini requires api_key"))?;
            let mut provider = GeminiProvider::new(key.clone());
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        ProviderType::OpenAI => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("openai requires api_key"))?;
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_BASE);
            Arc::new(OpenAiProvider::new(key.clone(), base_url))
        }
        ProviderType::Cerebras => {
            let key = config
                .api_key
                .as_ref()
                .ok_or_else(|| anyhow!("cerebras requires api_key"))?;
            let base_url = config.base_url.as_deref().unwrap_or(CEREBRAS_API_BASE);
            Arc::new(OpenAiProvider::new(key.clone(), base_url))
        }
        ProviderType::Ollama => {
            let base_url = config.base_url.as_deref().unwrap_or(OLLAMA_API_BASE);
            Arc::new(OpenAiProvider::new("", base_url))
        }
        ProviderType::Custom => {
            let base_url = config
                .base_url
                .as_ref()
                .ok_or_else(|| anyhow!("custom provider requires base_url"))?;
            let key = config.api_key.clone().unwrap_or_default();
            Arc::new(OpenAiProvider::new(key, base_url.clone()))
        }
    };
    Ok(provider)
}

/// Splits a `provider_id/model` reference.
pub fn parse_model_ref(model_ref: &str) -> Result<(&str, &str)> {
    model_ref
        .split_once('/')
        .filter(|(provider, model)| !provider.is_empty() && !model.is_empty())
        .ok_or_else(|| anyhow!("invalid model reference (expected provider/model): {model_ref}"))
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config.id.clone(), create_provider(config)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    /// Resolve `provider_id/model` into the provider and the bare model name.
    pub fn resolve(&self, model_ref: &str) -> Result<(Arc<dyn LlmProvider>, String)> {
        let (provider_id, model) = parse_model_ref(model_ref)?;
        Ok((self.get(provider_id)?, model.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
