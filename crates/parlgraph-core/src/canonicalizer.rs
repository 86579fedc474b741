//! Turns window-scoped extraction results into canonical nodes and edges.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parlgraph_provider::RetryPolicy;
use parlgraph_store::{
    edge_id, node_id, normalize_label, speaker_node_id, AliasRecord, EdgeRecord, EmbeddingProvider,
    EmbeddingTask, GraphStore, NodeRecord, Speaker,
};
use serde::Serialize;

use crate::extractor::ExtractionResult;
use crate::validator::{looks_like_speaker_ref, normalize_speaker_ref};
use crate::vocab::{is_node_type, PERSON_TYPE};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalizeStats {
    pub windows_processed: usize,
    pub windows_successful: usize,
    pub windows_failed: usize,
    pub new_nodes: usize,
    pub edges: usize,
    pub links_to_known: usize,
    pub edges_skipped_invalid_speaker_ref: usize,
    pub edges_skipped_missing_nodes: usize,
    pub nodes_embedded: usize,
}

/// Node record for a speaker, labelled with the best available name.
pub fn speaker_node(speaker_id: &str, speaker: Option<&Speaker>) -> NodeRecord {
    let full_name = speaker.and_then(|s| s.full_name.as_deref()).filter(|s| !s.trim().is_empty());
    let normalized = speaker
        .and_then(|s| s.normalized_name.as_deref())
        .filter(|s| !s.trim().is_empty());
    let title = speaker.and_then(|s| s.title.as_deref()).filter(|s| !s.trim().is_empty());

    let label = full_name.or(normalized).unwrap_or(speaker_id).trim().to_string();
    let mut aliases: Vec<String> = Vec::new();
    let candidates = [
        full_name.map(normalize_label),
        normalized.map(normalize_label),
        title.map(|t| t.trim().to_string()),
        Some(speaker_id.to_string()),
    ];
    for alias in candidates.into_iter().flatten() {
        if !alias.is_empty() && !aliases.contains(&alias) {
            aliases.push(alias);
        }
    }

    NodeRecord {
        id: speaker_node_id(speaker_id),
        node_type: PERSON_TYPE.to_string(),
        label,
        aliases,
    }
}

fn alias_records(node: &NodeRecord, source: &str) -> Vec<AliasRecord> {
    std::iter::once(&node.label)
        .chain(node.aliases.iter())
        .filter_map(|raw| {
            let alias_norm = normalize_label(raw);
            (!alias_norm.is_empty()).then(|| AliasRecord {
                alias_norm,
                alias_raw: raw.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                source: source.to_string(),
                confidence: None,
            })
        })
        .collect()
}

/// Nodes collected across windows, keyed by canonical id in first-seen order.
#[derive(Default)]
struct NodeBatch {
    order: Vec<String>,
    nodes: HashMap<String, NodeRecord>,
}

impl NodeBatch {
    fn add(&mut self, node: NodeRecord) {
        match self.nodes.get_mut(&node.id) {
            Some(existing) => {
                for alias in node.aliases {
                    if !existing.aliases.contains(&alias) {
                        existing.aliases.push(alias);
                    }
                }
            }
            None => {
                self.order.push(node.id.clone());
                self.nodes.insert(node.id.clone(), node);
            }
        }
    }

    fn into_vec(mut self) -> Vec<NodeRecord> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.remove(id))
            .collect()
    }
}

enum Resolved {
    Ref(String),
    InvalidSpeaker,
}

pub struct Canonicalizer {
    store: GraphStore,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
}

impl Canonicalizer {
    pub fn new(store: GraphStore, embedder: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Self {
        Self {
            store,
            embedder,
            retry,
        }
    }

    pub async fn canonicalize_and_store(
        &self,
        results: &[ExtractionResult<'_>],
        video_id: &str,
        run_id: &str,
        extractor_model: &str,
    ) -> Result<CanonicalizeStats> {
        let mut stats = CanonicalizeStats {
            windows_processed: results.len(),
            ..Default::default()
        };
        let successful: Vec<&ExtractionResult<'_>> = results.iter().filter(|r| r.parse_success).collect();
        stats.windows_successful = successful.len();
        stats.windows_failed = results.len() - successful.len();

        // Speaker nodes
        let mut speaker_ids: Vec<String> = Vec::new();
        for result in &successful {
            for sid in result.window.speaker_ids() {
                if !speaker_ids.iter().any(|s| s == sid) {
                    speaker_ids.push(sid.to_string());
                }
            }
        }
        let speakers = self.store.speakers_by_ids(speaker_ids.clone()).await?;
        let mut batch = NodeBatch::default();
        let mut aliases: Vec<AliasRecord> = Vec::new();
        for sid in &speaker_ids {
            let node = speaker_node(sid, speakers.get(sid));
            aliases.extend(alias_records(&node, "speaker"));
            batch.add(node);
        }

        // Draft nodes and edges
        let mut edges: Vec<EdgeRecord> = Vec::new();
        for result in &successful {
            let window = &result.window;
            let window_speakers = window.speaker_ids();
            let mut temp_ids: HashMap<String, String> = HashMap::new();

            for draft in &result.nodes_new {
                let temp_id = draft.temp_id.trim();
                let node_type = draft.node_type.trim();
                let label = draft.label.trim();
                if temp_id.is_empty() || label.is_empty() || !is_node_type(node_type) {
                    continue;
                }
                let mut node = NodeRecord {
                    id: node_id(node_type, label),
                    node_type: node_type.to_string(),
                    label: label.to_string(),
                    aliases: Vec::new(),
                };
                for alias in &draft.aliases {
                    let alias = alias.trim();
                    if !alias.is_empty() && !node.aliases.iter().any(|a| a == alias) {
                        node.aliases.push(alias.to_string());
                    }
                }
                temp_ids.insert(temp_id.to_string(), node.id.clone());
                aliases.extend(alias_records(&node, "llm"));
                batch.add(node);
            }

            let mut links_to_known = 0;
            let mut resolve = |reference: &str| -> Resolved {
                if looks_like_speaker_ref(reference) {
                    return match normalize_speaker_ref(reference, &window_speakers) {
                        Some(id) => Resolved::Ref(id),
                        None => Resolved::InvalidSpeaker,
                    };
                }
                match temp_ids.get(reference) {
                    Some(id) => Resolved::Ref(id.clone()),
                    None => {
                        links_to_known += 1;
                        Resolved::Ref(reference.to_string())
                    }
                }
            };

            for edge in &result.edges {
                let (Resolved::Ref(source_id), Resolved::Ref(target_id)) =
                    (resolve(&edge.source_ref), resolve(&edge.target_ref))
                else {
                    stats.edges_skipped_invalid_speaker_ref += 1;
                    continue;
                };

                let mut edge_speakers: Vec<String> = Vec::new();
                for uid in &edge.utterance_ids {
                    if let Some(u) = window.utterance(uid) {
                        if !edge_speakers.contains(&u.speaker_id) {
                            edge_speakers.push(u.speaker_id.clone());
                        }
                    }
                }

                let seconds = edge.earliest_seconds.or(window.earliest_seconds()).unwrap_or(0);
                edges.push(EdgeRecord {
                    id: edge_id(&source_id, &edge.predicate, &target_id, video_id, seconds, &edge.evidence),
                    source_id,
                    predicate: edge.predicate.clone(),
                    predicate_raw: None,
                    target_id,
                    youtube_video_id: video_id.to_string(),
                    earliest_timestamp: edge.earliest_timestamp.clone(),
                    earliest_seconds: edge.earliest_seconds,
                    utterance_ids: edge.utterance_ids.clone(),
                    evidence: edge.evidence.clone(),
                    speaker_ids: edge_speakers,
                    confidence: edge.confidence,
                    edge_rank_score: None,
                    extractor_model: Some(extractor_model.to_string()),
                    run_id: Some(run_id.to_string()),
                });
            }
            stats.links_to_known += links_to_known;
        }

        let nodes = batch.into_vec();
        let touched: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        stats.new_nodes = self.store.upsert_nodes(nodes).await.context("upserting nodes")?;
        self.store.insert_aliases(aliases).await.context("inserting aliases")?;

        // Referential integrity
        let endpoint_ids: Vec<String> = edges
            .iter()
            .flat_map(|e| [e.source_id.clone(), e.target_id.clone()])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let existing = self.store.existing_node_ids(endpoint_ids).await?;
        let mut seen = HashSet::new();
        let mut surviving = Vec::with_capacity(edges.len());
        for edge in edges {
            if !existing.contains(&edge.source_id) || !existing.contains(&edge.target_id) {
                stats.edges_skipped_missing_nodes += 1;
                continue;
            }
            if seen.insert(edge.id.clone()) {
                surviving.push(edge);
            }
        }
        stats.edges = self.store.insert_edges(surviving).await.context("inserting edges")?;

        stats.nodes_embedded = match self.embed_missing(touched).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("node embedding failed for video {video_id}, will retry next run: {e:#}");
                0
            }
        };

        tracing::info!(
            "canonicalized video {video_id}: {} windows ({} failed), {} new nodes, {} edges, {} links to known, {} invalid speaker refs, {} missing endpoints",
            stats.windows_processed,
            stats.windows_failed,
            stats.new_nodes,
            stats.edges,
            stats.links_to_known,
            stats.edges_skipped_invalid_speaker_ref,
            stats.edges_skipped_missing_nodes
        );
        Ok(stats)
    }

    /// Embeds the labels of nodes in `ids` that have no embedding yet.
    pub async fn embed_missing(&self, ids: Vec<String>) -> Result<usize> {
        let pending = self.store.nodes_missing_embedding(ids).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let labels: Vec<String> = pending.iter().map(|(_, label)| label.clone()).collect();
        let embedded = self
            .retry
            .run("embed node labels", || {
                self.embedder.embed(&labels, EmbeddingTask::RetrievalDocument)
            })
            .await?;
        let vectors: Vec<(String, Vec<f32>)> = pending
            .into_iter()
            .map(|(id, _)| id)
            .zip(embedded.embeddings)
            .collect();
        self.store.store_node_embeddings(vectors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftNode;
    use crate::extractor::{ExtractedEdge, ExtractionDiagnostics};
    use crate::window::{build_windows, tests::utterance, Window};
    use parlgraph_provider::Backoff;
    use parlgraph_store::{ImportBundle, StubEmbeddingProvider, Utterance};

    fn canonicalizer(store: &GraphStore) -> Canonicalizer {
        Canonicalizer::new(
            store.clone(),
            Arc::new(StubEmbeddingProvider::new(8)),
            RetryPolicy::new(1, Backoff::default()),
        )
    }

    fn draft_node(temp_id: &str, node_type: &str, label: &str) -> DraftNode {
        DraftNode {
            temp_id: temp_id.into(),
            node_type: node_type.into(),
            label: label.into(),
            aliases: vec!["FPR".into()],
        }
    }

    fn extracted(source: &str, target: &str) -> ExtractedEdge {
        ExtractedEdge {
            source_ref: source.into(),
            predicate: "PROPOSES".into(),
            target_ref: target.into(),
            evidence: "introduce a fixed penalty regime".into(),
            utterance_ids: vec!["vid:10".into()],
            earliest_timestamp: Some("00:00:10".into()),
            earliest_seconds: Some(10),
            confidence: 0.8,
        }
    }

    fn result<'a>(window: Window<'a>, edges: Vec<ExtractedEdge>, success: bool) -> ExtractionResult<'a> {
        ExtractionResult {
            window,
            nodes_new: vec![draft_node("n1", "skos:Concept", "Fixed Penalty Regime")],
            edges,
            parse_success: success,
            error: (!success).then(|| "Could not parse JSON from response".to_string()),
            diagnostics: ExtractionDiagnostics::default(),
        }
    }

    fn transcript() -> Vec<Utterance> {
        vec![
            utterance("vid", 10, "s_a", "We will introduce a fixed penalty regime for traffic offences."),
            utterance("vid", 20, "s_b", "The Road Traffic Act must be amended first, Madam Speaker."),
        ]
    }

    #[test]
    fn speaker_node_prefers_full_name() {
        let speaker = Speaker {
            id: "s_jane_doe_1".into(),
            full_name: Some("Jane  Doe".into()),
            normalized_name: Some("jane doe".into()),
            title: Some("Minister of Transport".into()),
            position: None,
        };
        let node = speaker_node("s_jane_doe_1", Some(&speaker));
        assert_eq!(node.id, "speaker_s_jane_doe_1");
        assert_eq!(node.label, "Jane  Doe");
        assert_eq!(node.node_type, "foaf:Person");
        assert_eq!(node.aliases, vec!["jane doe", "Minister of Transport", "s_jane_doe_1"]);

        assert_eq!(speaker_node("s_x", None).label, "s_x");
    }

    #[tokio::test]
    async fn stores_nodes_edges_and_counts_drops() -> Result<()> {
        let store = GraphStore::open_in_memory()?;
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let results = vec![
            result(
                window,
                vec![
                    extracted("speaker_s_a", "n1"),
                    extracted("s_b", "n1"),
                    extracted("speaker_s_nobody", "n1"),
                    extracted("speaker_s_a", "kg_000000000000"),
                ],
                true,
            ),
            result(window, vec![], false),
        ];

        let stats = canonicalizer(&store)
            .canonicalize_and_store(&results, "vid", "run-1", "test-model")
            .await?;

        assert_eq!(stats.windows_processed, 2);
        assert_eq!(stats.windows_successful, 1);
        assert_eq!(stats.windows_failed, 1);
        assert_eq!(stats.new_nodes, 3);
        assert_eq!(stats.edges, 2);
        assert_eq!(stats.edges_skipped_invalid_speaker_ref, 1);
        assert_eq!(stats.links_to_known, 1);
        assert_eq!(stats.edges_skipped_missing_nodes, 1);
        assert_eq!(stats.nodes_embedded, 3);

        let concept = node_id("skos:Concept", "Fixed Penalty Regime");
        let hits = store.alias_seeds("fpr", 5).await?;
        assert_eq!(hits[0].id, concept);
        let edges = store.edges_touching(vec![concept], vec![], 10).await?;
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.run_id.as_deref() == Some("run-1")));
        Ok(())
    }

    #[tokio::test]
    async fn rerunning_a_window_is_idempotent() -> Result<()> {
        let store = GraphStore::open_in_memory()?;
        store
            .import(ImportBundle {
                speakers: vec![Speaker {
                    id: "s_a".into(),
                    full_name: Some("Jane Doe".into()),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await?;
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];
        let results = vec![result(window, vec![extracted("speaker_s_a", "n1")], true)];
        let canonicalizer = canonicalizer(&store);

        let first = canonicalizer.canonicalize_and_store(&results, "vid", "run-1", "m").await?;
        let second = canonicalizer.canonicalize_and_store(&results, "vid", "run-2", "m").await?;

        assert_eq!(first.edges, 1);
        assert_eq!(second.edges, 0);
        assert_eq!(second.new_nodes, 0);
        assert_eq!(second.nodes_embedded, 0);
        let counts = store.counts().await?;
        assert_eq!(counts.edges, 1);
        let speaker = store.node_records(vec!["speaker_s_a".into()]).await?;
        assert_eq!(speaker[0].label, "Jane Doe");
        Ok(())
    }
}
