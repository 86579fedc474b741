pub mod agent;
pub mod answer;
pub mod canonicalizer;
pub mod citations;
pub mod config;
pub mod draft;
pub mod extractor;
pub mod known_nodes;
pub mod pipeline;
pub mod prompts;
pub mod retriever;
pub mod speaker_names;
pub mod tool;
pub mod validator;
pub mod vocab;
pub mod window;

#[cfg(test)]
mod testing;

pub use agent::{AgentAnswer, AgentLoop, AgentSettings};
pub use canonicalizer::{CanonicalizeStats, Canonicalizer};
pub use citations::{resolve_citation_ids, resolve_sources};
pub use config::{
    create_embedding_provider, load_config, validate_config, ParlgraphConfig, DEFAULT_CONFIG_FILE,
};
pub use draft::{DraftEdge, DraftGraph, DraftNode, JsonExtractError, ParseOutcome};
pub use extractor::{ExtractionResult, ExtractorSettings, TwoPassExtractor, TwoPassMode};
pub use pipeline::{ExtractionRun, RunSettings, RunStats};
pub use retriever::{Citation, HybridRetriever, RetrievalParams, RetrievalResult};
pub use tool::{HybridGraphRagTool, ToolExecutor, ToolOutput, ToolRegistry};
pub use validator::{validate, ValidationContext, ValidationIssue, ValidationReport};
pub use window::{build_windows, prepare_utterances, Window};
