use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parlgraph_provider::ToolDef;

use crate::retriever::{HybridRetriever, RetrievalParams};

pub const HYBRID_GRAPH_RAG: &str = "hybrid_graph_rag";

pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definition(&self) -> ToolDef;
    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn ToolExecutor>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    /// Definitions sorted by name so requests are stable.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow!("tool not found: {name}"))?;
        tool.execute(input).await
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exposes the hybrid retriever to the agent. The output is the retrieval
/// result serialized as JSON.
pub struct HybridGraphRagTool {
    retriever: Arc<HybridRetriever>,
    defaults: RetrievalParams,
}

impl HybridGraphRagTool {
    pub fn new(retriever: Arc<HybridRetriever>, defaults: RetrievalParams) -> Self {
        Self { retriever, defaults }
    }

    fn params(&self, input: &serde_json::Value) -> RetrievalParams {
        let count = |key: &str, default: usize| {
            input[key]
                .as_u64()
                .or_else(|| input[key].as_f64().map(|f| f.max(0.0) as u64))
                .map(|v| v as usize)
                .unwrap_or(default)
        };
        RetrievalParams {
            hops: count("hops", self.defaults.hops),
            seed_k: count("seed_k", self.defaults.seed_k),
            max_edges: count("max_edges", self.defaults.max_edges),
            max_citations: count("max_citations", self.defaults.max_citations),
            edge_rank_threshold: input["edge_rank_threshold"]
                .as_f64()
                .or(self.defaults.edge_rank_threshold),
        }
    }
}

#[async_trait]
impl ToolExecutor for HybridGraphRagTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: HYBRID_GRAPH_RAG.into(),
            description: "Search the parliamentary knowledge graph. Finds nodes matching the query, expands along related edges, and returns a compact subgraph with citations to the transcript utterances that support each edge.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Topic, bill, person, or question to search for"
                    },
                    "hops": {
                        "type": "integer",
                        "description": "Edge hops to expand from the seed nodes (default: 1)"
                    },
                    "seed_k": {
                        "type": "integer",
                        "description": "Maximum seed nodes (default: 8)"
                    },
                    "max_edges": {
                        "type": "integer",
                        "description": "Maximum edges returned (default: 60)"
                    },
                    "max_citations": {
                        "type": "integer",
                        "description": "Maximum cited utterances returned (default: 12)"
                    },
                    "edge_rank_threshold": {
                        "type": "number",
                        "description": "Drop edges whose rank score is below this value"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput> {
        let query = input["query"]
            .as_str()
            .ok_or_else(|| anyhow!("missing 'query' field"))?;
        let params = self.params(&input);

        match self.retriever.retrieve(query, params).await {
            Ok(result) => Ok(ToolOutput {
                content: serde_json::to_string(&result)?,
                is_error: false,
            }),
            Err(e) => Ok(ToolOutput {
                content: serde_json::json!({ "error": format!("retrieval failed: {e:#}") }).to_string(),
                is_error: true,
            }),
        }
    }
}
