//! Canonical nodes offered to the model so it can reuse existing ids.

use std::collections::HashSet;

use anyhow::{Context, Result};
use parlgraph_store::{speaker_node_id, EmbeddingProvider, EmbeddingTask, GraphStore, NodeRecord};

pub const DEFAULT_KNOWN_NODES_TOP_K: usize = 25;
const MAX_ALIASES_SHOWN: usize = 3;

/// Speaker nodes for the window's speakers first, then the nodes nearest
/// to the window text. Speaker nodes are never cut by `top_k`.
pub async fn candidate_nodes(
    store: &GraphStore,
    embedder: &dyn EmbeddingProvider,
    window_text: &str,
    speaker_ids: &[&str],
    top_k: usize,
) -> Result<Vec<NodeRecord>> {
    let speaker_node_ids: Vec<String> = speaker_ids.iter().map(|s| speaker_node_id(s)).collect();
    let mut candidates = store.node_records(speaker_node_ids.clone()).await?;
    let fixed = candidates.len();

    let embedding = embedder
        .embed(&[window_text.to_string()], EmbeddingTask::RetrievalQuery)
        .await
        .context("embedding window text for known nodes")?;
    if let Some(query) = embedding.embeddings.into_iter().next() {
        let hits = store.vector_seeds(query, top_k).await?;
        candidates.extend(hits.into_iter().map(|hit| NodeRecord {
            id: hit.id,
            node_type: hit.node_type,
            label: hit.label,
            aliases: hit.aliases,
        }));
    }

    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.id.clone()));
    candidates.truncate(top_k.max(fixed));
    Ok(candidates)
}

/// `| ID | Type | Label | Aliases |` table with up to three aliases per row.
pub fn format_known_nodes(candidates: &[NodeRecord]) -> String {
    let mut lines = vec![
        "| ID | Type | Label | Aliases |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    for c in candidates {
        let aliases = c
            .aliases
            .iter()
            .take(MAX_ALIASES_SHOWN)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("| {} | {} | {} | {} |", c.id, c.node_type, c.label, aliases));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlgraph_store::{node_id, StubEmbeddingProvider};

    fn record(id: &str, node_type: &str, label: &str, aliases: &[&str]) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            node_type: node_type.to_string(),
            label: label.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn table_shows_three_aliases() {
        let table = format_known_nodes(&[record(
            "kg_abc",
            "skos:Concept",
            "Road Safety",
            &["road safety", "safety on roads", "traffic safety", "extra"],
        )]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| ID | Type | Label | Aliases |");
        assert_eq!(lines[1], "|---|---|---|---|");
        assert_eq!(
            lines[2],
            "| kg_abc | skos:Concept | Road Safety | road safety, safety on roads, traffic safety |"
        );
    }

    #[test]
    fn empty_table_has_header_only() {
        assert_eq!(format_known_nodes(&[]).lines().count(), 2);
    }

    #[tokio::test]
    async fn speakers_come_first_and_survive_top_k() -> Result<()> {
        let store = GraphStore::open_in_memory()?;
        let embedder = StubEmbeddingProvider::new(8);
        let concept_id = node_id("skos:Concept", "Road Safety");
        store
            .upsert_nodes(vec![
                record("speaker_s_a", "foaf:Person", "Jane Doe", &[]),
                record(&concept_id, "skos:Concept", "Road Safety", &[]),
            ])
            .await?;
        let vectors = embedder
            .embed(&["Road Safety".to_string()], EmbeddingTask::RetrievalDocument)
            .await?;
        store
            .store_node_embeddings(vec![(concept_id.clone(), vectors.embeddings[0].clone())])
            .await?;

        let candidates = candidate_nodes(&store, &embedder, "road safety debate", &["s_a", "s_missing"], 1).await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "speaker_s_a");

        let wider = candidate_nodes(&store, &embedder, "road safety debate", &["s_a"], 5).await?;
        let ids: Vec<&str> = wider.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["speaker_s_a", concept_id.as_str()]);
        Ok(())
    }
}
