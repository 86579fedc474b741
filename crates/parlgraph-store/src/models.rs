use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub youtube_video_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub video_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub normalized_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// One transcribed utterance. Ids have the form `{video_id}:{seconds}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub id: String,
    pub youtube_video_id: String,
    pub seconds_since_start: i64,
    #[serde(alias = "timestamp_str")]
    pub timestamp: String,
    pub speaker_id: String,
    pub text: String,
}

/// A speaker listed in a sitting's order paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub session_date: NaiveDate,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Already-parsed records accepted by the import command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportBundle {
    #[serde(default)]
    pub videos: Vec<Video>,
    #[serde(default)]
    pub speakers: Vec<Speaker>,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub videos: usize,
    pub speakers: usize,
    pub utterances: usize,
    pub roster: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub alias_norm: String,
    pub alias_raw: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub source: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: String,
    pub source_id: String,
    pub predicate: String,
    #[serde(default)]
    pub predicate_raw: Option<String>,
    pub target_id: String,
    pub youtube_video_id: String,
    pub earliest_timestamp: Option<String>,
    pub earliest_seconds: Option<i64>,
    pub utterance_ids: Vec<String>,
    pub evidence: String,
    #[serde(default)]
    pub speaker_ids: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub edge_rank_score: Option<f64>,
    #[serde(default)]
    pub extractor_model: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Vector,
    Fulltext,
    Alias,
}

/// A node found by one of the seed searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedHit {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    pub aliases: Vec<String>,
    pub score: f64,
    pub match_reason: MatchReason,
}

/// Utterance joined with its speaker and video, before name resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationRow {
    pub utterance_id: String,
    pub text: String,
    pub seconds_since_start: i64,
    pub timestamp: String,
    pub youtube_video_id: String,
    pub video_title: Option<String>,
    pub video_date: Option<NaiveDate>,
    pub speaker: Speaker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub videos: i64,
    pub speakers: i64,
    pub utterances: i64,
    pub nodes: i64,
    pub embedded_nodes: i64,
    pub aliases: i64,
    pub edges: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_bundle_accepts_partial_documents() {
        let bundle: ImportBundle = serde_json::from_value(serde_json::json!({
            "videos": [{"youtube_video_id": "abc", "video_date": "2024-03-05"}],
            "utterances": [{
                "id": "abc:12",
                "youtube_video_id": "abc",
                "seconds_since_start": 12,
                "timestamp_str": "00:00:12",
                "speaker_id": "s_jane_doe_1",
                "text": "The Water Authority will be restructured."
            }]
        }))
        .unwrap();

        assert_eq!(bundle.videos[0].video_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(bundle.utterances[0].timestamp, "00:00:12");
        assert!(bundle.speakers.is_empty());
        assert!(bundle.roster.is_empty());
    }

    #[test]
    fn match_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(MatchReason::Fulltext).unwrap(),
            serde_json::json!("fulltext")
        );
    }
}
