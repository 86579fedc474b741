//! Hybrid graph retrieval: seed nodes by vector, full-text and alias search,
//! expand along ranked edges, then hydrate labels and citations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parlgraph_provider::RetryPolicy;
use parlgraph_store::{
    normalize_label, CitationRow, EdgeRecord, EmbeddingProvider, EmbeddingTask, GraphStore,
    NodeSummary, SeedHit,
};
use serde::{Deserialize, Serialize};

use crate::speaker_names::{SpeakerDirectory, ROSTER_SESSIONS};

pub const DEFAULT_HOPS: usize = 1;
pub const DEFAULT_SEED_K: usize = 8;
pub const DEFAULT_MAX_EDGES: usize = 60;
pub const DEFAULT_MAX_CITATIONS: usize = 12;
const ALIAS_SEED_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub hops: usize,
    pub seed_k: usize,
    pub max_edges: usize,
    pub max_citations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_rank_threshold: Option<f64>,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            hops: DEFAULT_HOPS,
            seed_k: DEFAULT_SEED_K,
            max_edges: DEFAULT_MAX_EDGES,
            max_citations: DEFAULT_MAX_CITATIONS,
            edge_rank_threshold: None,
        }
    }
}

impl RetrievalParams {
    /// Every count is at least 1.
    pub fn clamped(self) -> Self {
        Self {
            hops: self.hops.max(1),
            seed_k: self.seed_k.max(1),
            max_edges: self.max_edges.max(1),
            max_citations: self.max_citations.max(1),
            edge_rank_threshold: self.edge_rank_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEdge {
    pub id: String,
    pub source_id: String,
    pub source_label: Option<String>,
    pub predicate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate_raw: Option<String>,
    pub target_id: String,
    pub target_label: Option<String>,
    pub youtube_video_id: String,
    pub earliest_timestamp: Option<String>,
    pub earliest_seconds: Option<i64>,
    pub utterance_ids: Vec<String>,
    pub evidence: String,
    pub speaker_ids: Vec<String>,
    pub confidence: f64,
    pub edge_rank_score: Option<f64>,
}

impl RetrievedEdge {
    fn from_record(edge: EdgeRecord, labels: &HashMap<String, String>) -> Self {
        Self {
            source_label: labels.get(&edge.source_id).cloned(),
            target_label: labels.get(&edge.target_id).cloned(),
            id: edge.id,
            source_id: edge.source_id,
            predicate: edge.predicate,
            predicate_raw: edge.predicate_raw,
            target_id: edge.target_id,
            youtube_video_id: edge.youtube_video_id,
            earliest_timestamp: edge.earliest_timestamp,
            earliest_seconds: edge.earliest_seconds,
            utterance_ids: edge.utterance_ids,
            evidence: edge.evidence,
            speaker_ids: edge.speaker_ids,
            confidence: edge.confidence,
            edge_rank_score: edge.edge_rank_score,
        }
    }
}

/// A cited utterance with enough context to link and attribute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub utterance_id: String,
    pub text: String,
    pub seconds_since_start: i64,
    pub timestamp: String,
    pub youtube_video_id: String,
    pub youtube_url: String,
    pub video_date: Option<NaiveDate>,
    pub video_title: Option<String>,
    pub speaker_id: String,
    pub speaker_name: String,
    pub speaker_title: Option<String>,
}

impl Citation {
    pub fn from_row(row: CitationRow, speakers: &SpeakerDirectory) -> Self {
        let display = speakers.display(&row.speaker);
        Self {
            youtube_url: youtube_url(&row.youtube_video_id, row.seconds_since_start),
            utterance_id: row.utterance_id,
            text: row.text,
            seconds_since_start: row.seconds_since_start,
            timestamp: row.timestamp,
            youtube_video_id: row.youtube_video_id,
            video_date: row.video_date,
            video_title: row.video_title,
            speaker_id: row.speaker.id,
            speaker_name: display.name,
            speaker_title: display.title,
        }
    }
}

pub fn youtube_url(video_id: &str, seconds: i64) -> String {
    format!("https://www.youtube.com/watch?v={video_id}&t={}s", seconds.max(0))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDebug {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub vector_seeds: usize,
    pub fulltext_seeds: usize,
    pub alias_seeds: usize,
    pub hops_expanded: usize,
    pub edges_before_threshold: usize,
}

/// Self-contained subgraph answering one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub hops: usize,
    pub seeds: Vec<SeedHit>,
    pub nodes: Vec<NodeSummary>,
    pub edges: Vec<RetrievedEdge>,
    pub citations: Vec<Citation>,
    pub debug: RetrievalDebug,
}

/// Merges seed lists by node id keeping the best score, best first.
pub fn merge_seeds(lists: Vec<Vec<SeedHit>>, seed_k: usize) -> Vec<SeedHit> {
    let mut best: HashMap<String, SeedHit> = HashMap::new();
    for hit in lists.into_iter().flatten() {
        match best.get(&hit.id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.id.clone(), hit);
            }
        }
    }
    let mut seeds: Vec<SeedHit> = best.into_values().collect();
    seeds.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    seeds.truncate(seed_k);
    seeds
}

pub struct HybridRetriever {
    store: GraphStore,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
}

impl HybridRetriever {
    pub fn new(store: GraphStore, embedder: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Self {
        Self {
            store,
            embedder,
            retry,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    async fn vector_seeds(&self, query: &str, seed_k: usize) -> Result<Vec<SeedHit>> {
        let texts = vec![query.to_string()];
        let embedded = self
            .retry
            .run("embed query", || self.embedder.embed(&texts, EmbeddingTask::RetrievalQuery))
            .await
            .context("embedding query")?;
        match embedded.embeddings.into_iter().next() {
            Some(embedding) => self.store.vector_seeds(embedding, seed_k).await,
            None => Ok(Vec::new()),
        }
    }

    /// Vector seeding is best effort: when embedding or the vector lookup
    /// fails, full-text and alias seeds still run.
    async fn seeds(&self, query: &str, seed_k: usize, debug: &mut RetrievalDebug) -> Result<Vec<SeedHit>> {
        let vector = match self.vector_seeds(query, seed_k).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("vector seeding failed for {query:?}, using text seeds only: {e:#}");
                Vec::new()
            }
        };
        let fulltext = self.store.fulltext_seeds(query, seed_k).await?;
        let alias = self
            .store
            .alias_seeds(&normalize_label(query), ALIAS_SEED_LIMIT)
            .await?;

        debug.vector_seeds = vector.len();
        debug.fulltext_seeds = fulltext.len();
        debug.alias_seeds = alias.len();
        Ok(merge_seeds(vec![vector, fulltext, alias], seed_k))
    }

    pub async fn retrieve(&self, query: &str, params: RetrievalParams) -> Result<RetrievalResult> {
        let params = params.clamped();
        let query = query.trim();
        let mut debug = RetrievalDebug::default();
        if query.is_empty() {
            debug.reason = Some("empty_query".to_string());
            return Ok(RetrievalResult {
                hops: params.hops,
                debug,
                ..Default::default()
            });
        }

        let seeds = self.seeds(query, params.seed_k, &mut debug).await?;

        // Hop expansion
        let mut seen_nodes: HashSet<String> = seeds.iter().map(|s| s.id.clone()).collect();
        let mut frontier: Vec<String> = seeds.iter().map(|s| s.id.clone()).collect();
        let mut seen_edges: HashSet<String> = HashSet::new();
        let mut edges: Vec<EdgeRecord> = Vec::new();
        for _ in 0..params.hops {
            if frontier.is_empty() || edges.len() >= params.max_edges {
                break;
            }
            let exclude: Vec<String> = seen_edges.iter().cloned().collect();
            let batch = self
                .store
                .edges_touching(frontier, exclude, params.max_edges - edges.len())
                .await?;
            let mut next = Vec::new();
            for edge in batch {
                if !seen_edges.insert(edge.id.clone()) {
                    continue;
                }
                for endpoint in [&edge.source_id, &edge.target_id] {
                    if seen_nodes.insert(endpoint.clone()) {
                        next.push(endpoint.clone());
                    }
                }
                edges.push(edge);
            }
            frontier = next;
            debug.hops_expanded += 1;
        }

        debug.edges_before_threshold = edges.len();
        if let Some(threshold) = params.edge_rank_threshold {
            edges.retain(|e| e.edge_rank_score.unwrap_or(0.0) >= threshold);
        }
        edges.truncate(params.max_edges);

        // Hydration
        let mut node_ids: Vec<String> = seeds.iter().map(|s| s.id.clone()).collect();
        for edge in &edges {
            for endpoint in [&edge.source_id, &edge.target_id] {
                if !node_ids.contains(endpoint) {
                    node_ids.push(endpoint.clone());
                }
            }
        }
        let nodes = self.store.nodes_by_ids(node_ids).await?;
        let labels: HashMap<String, String> = nodes.iter().map(|n| (n.id.clone(), n.label.clone())).collect();

        let mut cited: Vec<String> = Vec::new();
        for uid in edges.iter().flat_map(|e| e.utterance_ids.iter()) {
            if cited.len() >= params.max_citations {
                break;
            }
            if !cited.contains(uid) {
                cited.push(uid.clone());
            }
        }
        let citations = self.citations(cited).await?;

        tracing::debug!(
            "retrieved {} seeds, {} nodes, {} edges, {} citations for {query:?}",
            seeds.len(),
            nodes.len(),
            edges.len(),
            citations.len()
        );

        Ok(RetrievalResult {
            query: query.to_string(),
            hops: params.hops,
            seeds,
            nodes,
            edges: edges
                .into_iter()
                .map(|e| RetrievedEdge::from_record(e, &labels))
                .collect(),
            citations,
            debug,
        })
    }

    /// Citation records for `ids`, ordered by video then time.
    pub async fn citations(&self, ids: Vec<String>) -> Result<Vec<Citation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.store.citation_rows(ids).await?;
        let speakers = SpeakerDirectory::new(self.store.recent_roster(ROSTER_SESSIONS).await?);
        let mut citations: Vec<Citation> = rows
            .into_iter()
            .map(|row| Citation::from_row(row, &speakers))
            .collect();
        citations.sort_by(|a, b| {
            a.video_date
                .cmp(&b.video_date)
                .then_with(|| a.youtube_video_id.cmp(&b.youtube_video_id))
                .then_with(|| a.seconds_since_start.cmp(&b.seconds_since_start))
        });
        Ok(citations)
    }
}
