use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parlgraph_provider::{parse_model_ref, Backoff, ProviderConfig, RetryPolicy};
use parlgraph_store::{
    EmbeddingProvider, GeminiEmbeddingProvider, OpenAiEmbeddingProvider, StubEmbeddingProvider,
};
use serde::{Deserialize, Serialize};

use crate::agent::{
    AgentSettings, DEFAULT_AGENT_MAX_TOKENS, DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_HISTORY_LIMIT,
    DEFAULT_MAX_TOOL_ITERATIONS,
};
use crate::extractor::{
    ExtractorSettings, TwoPassMode, DEFAULT_EXTRACTION_MAX_TOKENS, DEFAULT_MAX_ADDED_EDGES,
    DEFAULT_MIN_EDGES,
};
use crate::known_nodes::DEFAULT_KNOWN_NODES_TOP_K;
use crate::pipeline::RunSettings;
use crate::retriever::{
    RetrievalParams, DEFAULT_HOPS, DEFAULT_MAX_CITATIONS, DEFAULT_MAX_EDGES, DEFAULT_SEED_K,
};
use crate::window::{DEFAULT_STRIDE, DEFAULT_WINDOW_SIZE};

pub const DEFAULT_CONFIG_FILE: &str = "parlgraph.yaml";

fn default_store_path() -> String {
    "parlgraph.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_model_ref() -> String {
    "gemini/gemini-2.5-flash".to_string()
}

/// Model references in `provider_id/model` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model_ref")]
    pub extraction: String,
    #[serde(default = "default_model_ref")]
    pub agent: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            extraction: default_model_ref(),
            agent: default_model_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Gemini,
    OpenAI,
    Stub,
}

fn default_embedding_api_key() -> String {
    "${GOOGLE_API_KEY}".to_string()
}

fn default_embedding_model() -> String {
    "gemini-embedding-001".to_string()
}

fn default_embedding_dimensions() -> usize {
    768
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingBackend,
    #[serde(default = "default_embedding_api_key")]
    pub api_key: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::default(),
            api_key: default_embedding_api_key(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            base_url: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    parlgraph_provider::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    parlgraph_provider::retry::DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    parlgraph_provider::retry::DEFAULT_MAX_BACKOFF_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_stride() -> usize {
    DEFAULT_STRIDE
}

fn default_true() -> bool {
    true
}

fn default_min_edges() -> usize {
    DEFAULT_MIN_EDGES
}

fn default_max_added_edges() -> usize {
    DEFAULT_MAX_ADDED_EDGES
}

fn default_known_nodes_top_k() -> usize {
    DEFAULT_KNOWN_NODES_TOP_K
}

fn default_concurrency() -> usize {
    1
}

fn default_extraction_max_tokens() -> u32 {
    DEFAULT_EXTRACTION_MAX_TOKENS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default = "default_true")]
    pub filter_short: bool,
    #[serde(default)]
    pub two_pass: TwoPassMode,
    #[serde(default = "default_min_edges")]
    pub min_edges: usize,
    #[serde(default = "default_max_added_edges")]
    pub max_added_edges: usize,
    #[serde(default = "default_known_nodes_top_k")]
    pub known_nodes_top_k: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_extraction_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            stride: default_stride(),
            filter_short: true,
            two_pass: TwoPassMode::default(),
            min_edges: default_min_edges(),
            max_added_edges: default_max_added_edges(),
            known_nodes_top_k: default_known_nodes_top_k(),
            concurrency: default_concurrency(),
            max_tokens: default_extraction_max_tokens(),
        }
    }
}

fn default_hops() -> usize {
    DEFAULT_HOPS
}

fn default_seed_k() -> usize {
    DEFAULT_SEED_K
}

fn default_max_edges() -> usize {
    DEFAULT_MAX_EDGES
}

fn default_max_citations() -> usize {
    DEFAULT_MAX_CITATIONS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_hops")]
    pub hops: usize,
    #[serde(default = "default_seed_k")]
    pub seed_k: usize,
    #[serde(default = "default_max_edges")]
    pub max_edges: usize,
    #[serde(default = "default_max_citations")]
    pub max_citations: usize,
    #[serde(default)]
    pub edge_rank_threshold: Option<f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hops: default_hops(),
            seed_k: default_seed_k(),
            max_edges: default_max_edges(),
            max_citations: default_max_citations(),
            edge_rank_threshold: None,
        }
    }
}

fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}

fn default_agent_max_tokens() -> u32 {
    DEFAULT_AGENT_MAX_TOKENS
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_agent_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            max_tokens: default_agent_max_tokens(),
            history_limit: default_history_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParlgraphConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl ParlgraphConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Backoff {
                initial: Duration::from_millis(self.retry.initial_backoff_ms),
                max: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: 2,
            },
        )
    }

    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            two_pass: self.extraction.two_pass,
            min_edges: self.extraction.min_edges,
            max_added_edges: self.extraction.max_added_edges,
            max_tokens: self.extraction.max_tokens,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            window_size: self.extraction.window_size,
            stride: self.extraction.stride,
            filter_short: self.extraction.filter_short,
            known_nodes_top_k: self.extraction.known_nodes_top_k,
            concurrency: self.extraction.concurrency.max(1),
        }
    }

    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            hops: self.retrieval.hops,
            seed_k: self.retrieval.seed_k,
            max_edges: self.retrieval.max_edges,
            max_citations: self.retrieval.max_citations,
            edge_rank_threshold: self.retrieval.edge_rank_threshold,
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_tool_iterations: self.agent.max_tool_iterations,
            max_tokens: self.agent.max_tokens,
            history_limit: self.agent.history_limit,
            timeout: Duration::from_secs(self.agent.timeout_secs),
        }
    }
}

pub fn create_embedding_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingBackend::Gemini => {
            let mut provider = GeminiEmbeddingProvider::with_model(
                config.api_key.clone(),
                config.model.clone(),
                config.dimensions,
            );
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        EmbeddingBackend::OpenAI => {
            let mut provider = OpenAiEmbeddingProvider::with_model(
                config.api_key.clone(),
                config.model.clone(),
                config.dimensions,
            );
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        EmbeddingBackend::Stub => Arc::new(StubEmbeddingProvider::new(config.dimensions)),
    }
}

pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_optional(value: &mut Option<String>) {
    if let Some(raw) = value.as_deref() {
        let resolved = resolve_env_var(raw);
        *value = if resolved.trim().is_empty() { None } else { Some(resolved) };
    }
}

fn resolve_config_env(config: &mut ParlgraphConfig) {
    config.store.path = resolve_env_var(&config.store.path);
    config.store.log_dir = resolve_env_var(&config.store.log_dir);
    for provider in &mut config.providers {
        resolve_optional(&mut provider.api_key);
        resolve_optional(&mut provider.base_url);
    }
    config.models.extraction = resolve_env_var(&config.models.extraction);
    config.models.agent = resolve_env_var(&config.models.agent);
    config.embedding.api_key = resolve_env_var(&config.embedding.api_key);
    resolve_optional(&mut config.embedding.base_url);
}

pub fn load_config(path: &Path) -> Result<ParlgraphConfig> {
    let mut config: ParlgraphConfig = read_yaml_file(path)?;
    resolve_config_env(&mut config);
    Ok(config)
}

pub fn validate_config(config: &ParlgraphConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for provider in &config.providers {
        if !seen.insert(provider.id.as_str()) {
            return Err(anyhow!("duplicate provider id: {}", provider.id));
        }
        let has_key = provider.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if provider.provider_type.requires_api_key() && !has_key {
            return Err(anyhow!("provider {} is missing api_key", provider.id));
        }
    }

    for (name, model_ref) in [("extraction", &config.models.extraction), ("agent", &config.models.agent)] {
        let (provider_id, _) = parse_model_ref(model_ref)
            .with_context(|| format!("invalid {name} model reference"))?;
        if !seen.contains(provider_id) {
            return Err(anyhow!("unknown provider in {name} model: {model_ref}"));
        }
    }

    if config.embedding.provider != EmbeddingBackend::Stub && config.embedding.api_key.trim().is_empty() {
        return Err(anyhow!("embedding provider is missing api_key"));
    }
    if config.embedding.dimensions == 0 {
        return Err(anyhow!("embedding.dimensions must be greater than zero"));
    }
    if config.extraction.window_size == 0 || config.extraction.stride == 0 {
        return Err(anyhow!("extraction.window_size and extraction.stride must be greater than zero"));
    }
    if config.retry.max_attempts == 0 {
        return Err(anyhow!("retry.max_attempts must be greater than zero"));
    }
    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        return Err(anyhow!(
            "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
            config.retry.initial_backoff_ms,
            config.retry.max_backoff_ms
        ));
    }

    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlgraph_provider::ProviderType;

    fn write_config(yaml: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, yaml).unwrap();
        (dir, path)
    }

    fn valid_config() -> ParlgraphConfig {
        ParlgraphConfig {
            providers: vec![ProviderConfig::new("gemini", ProviderType::Gemini).with_api_key("k")],
            embedding: EmbeddingConfig {
                api_key: "k".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let (_dir, path) = write_config("providers:\n  - id: gemini\n    type: gemini\n    api_key: abc\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.store.path, "parlgraph.db");
        assert_eq!(config.extraction.window_size, 10);
        assert_eq!(config.extraction.stride, 6);
        assert_eq!(config.extraction.two_pass, TwoPassMode::Always);
        assert_eq!(config.retrieval.seed_k, 8);
        assert_eq!(config.agent.max_tool_iterations, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.providers[0].api_key.as_deref(), Some("abc"));
    }

    #[test]
    fn env_placeholders_are_expanded() {
        let (_dir, path) = write_config(
            "providers:\n  - id: gemini\n    type: gemini\n    api_key: ${PATH}\nembedding:\n  provider: stub\n  api_key: x-${PARLGRAPH_NONEXISTENT_VAR_XYZ}\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.providers[0].api_key, Some(std::env::var("PATH").unwrap()));
        assert_eq!(config.embedding.api_key, "x-");
        assert_eq!(config.embedding.provider, EmbeddingBackend::Stub);
    }

    #[test]
    fn two_pass_mode_reads_aliases() {
        let (_dir, path) = write_config("extraction:\n  two_pass: on_fail\n  concurrency: 0\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.extraction.two_pass, TwoPassMode::OnParseFailure);
        assert_eq!(config.run_settings().concurrency, 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/parlgraph.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/parlgraph.yaml"));
    }

    #[test]
    fn validate_accepts_valid_config() {
        validate_config(&valid_config()).unwrap();
    }

    #[test]
    fn validate_detects_duplicate_provider() {
        let mut config = valid_config();
        config.providers.push(config.providers[0].clone());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate provider id"));
    }

    #[test]
    fn validate_detects_unknown_model_provider() {
        let mut config = valid_config();
        config.models.agent = "openai/gpt-4o".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown provider in agent model"));
    }

    #[test]
    fn validate_detects_missing_keys() {
        let mut config = valid_config();
        config.providers[0].api_key = None;
        assert!(validate_config(&config).unwrap_err().to_string().contains("missing api_key"));

        let mut config = valid_config();
        config.embedding.api_key = String::new();
        assert!(validate_config(&config).is_err());
        config.embedding.provider = EmbeddingBackend::Stub;
        validate_config(&config).unwrap();
    }

    #[test]
    fn validate_detects_bad_numbers() {
        let mut config = valid_config();
        config.extraction.stride = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.retry.initial_backoff_ms = 20_000;
        assert!(validate_config(&config).unwrap_err().to_string().contains("exceeds"));

        let mut config = valid_config();
        config.embedding.dimensions = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn resolve_env_var_unclosed_bracket() {
        assert_eq!(resolve_env_var("prefix_${UNCLOSED"), "prefix_${UNCLOSED");
        assert_eq!(resolve_env_var("plain-value"), "plain-value");
    }
}
