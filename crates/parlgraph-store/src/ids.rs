//! Content-addressed identifiers for graph nodes and edges.

use sha2::{Digest, Sha256};

const HASH_PREFIX_LEN: usize = 12;

/// Lowercase, trim, and collapse whitespace runs to a single space.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_PREFIX_LEN);
    hex
}

/// `kg_` + 12 hex chars of the hash of `"{type}:{normalized label}"`.
pub fn node_id(node_type: &str, label: &str) -> String {
    format!("kg_{}", short_hash(&format!("{}:{}", node_type, normalize_label(label))))
}

pub fn speaker_node_id(speaker_id: &str) -> String {
    format!("speaker_{speaker_id}")
}

pub fn edge_id(
    source_id: &str,
    predicate: &str,
    target_id: &str,
    video_id: &str,
    earliest_seconds: i64,
    evidence: &str,
) -> String {
    let key = format!("{source_id}|{predicate}|{target_id}|{video_id}|{earliest_seconds}|{evidence}");
    format!("kge_{}", short_hash(&key))
}

/// Utterance ids have the form `{video_id}:{seconds}`.
pub fn utterance_id(video_id: &str, seconds: i64) -> String {
    format!("{video_id}:{seconds}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_label_collapses_whitespace() {
        assert_eq!(normalize_label("  Fixed   Penalty\tRegime "), "fixed penalty regime");
        assert_eq!(normalize_label(""), "");
    }

    #[test]
    fn node_id_is_stable_and_fifteen_chars() {
        let first = node_id("skos:Concept", "Fixed Penalty Regime");
        let second = node_id("skos:Concept", "fixed  penalty regime");
        assert_eq!(first, second);
        assert_eq!(first.len(), 15);
        assert!(first.starts_with("kg_"));
        assert_ne!(first, node_id("schema:Legislation", "Fixed Penalty Regime"));
    }

    #[test]
    fn edge_id_depends_on_every_component() {
        let base = edge_id("kg_a", "AMENDS", "kg_b", "vid", 10, "amends the act");
        assert_eq!(base.len(), 16);
        assert_eq!(base, edge_id("kg_a", "AMENDS", "kg_b", "vid", 10, "amends the act"));
        assert_ne!(base, edge_id("kg_a", "AMENDS", "kg_b", "vid", 11, "amends the act"));
        assert_ne!(base, edge_id("kg_a", "GOVERNS", "kg_b", "vid", 10, "amends the act"));
    }

    #[test]
    fn speaker_and_utterance_ids() {
        assert_eq!(speaker_node_id("s_jane_doe_1"), "speaker_s_jane_doe_1");
        assert_eq!(utterance_id("abc123", 42), "abc123:42");
    }
}
