//! Tolerant decoding of model output into window-scoped drafts.
//!
//! Model responses are free text that usually, but not always, contain one
//! JSON object. Everything here is pure: no I/O and no model calls.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::validator::ValidationIssue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonExtractError {
    #[error("Empty response")]
    Empty,
    #[error("Could not parse JSON from response")]
    NoObject,
    #[error("Invalid JSON: {0}")]
    Invalid(String),
}

/// Result of decoding one model response at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Failed { error: String },
}

impl<T> ParseOutcome<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Parsed(_) => None,
            Self::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftNode {
    pub temp_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftEdge {
    pub source_ref: String,
    pub predicate: String,
    pub target_ref: String,
    pub evidence: String,
    #[serde(default)]
    pub utterance_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DraftEdge {
    pub fn signature(&self) -> EdgeSignature {
        EdgeSignature {
            source_ref: self.source_ref.clone(),
            predicate: self.predicate.clone(),
            target_ref: self.target_ref.clone(),
        }
    }
}

/// Nodes and edges proposed for one window. Structural problems found while
/// decoding (a non-list `edges`, a non-object element) are kept aside in
/// `shape_issues` so the validator can report them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftGraph {
    #[serde(default)]
    pub nodes_new: Vec<DraftNode>,
    #[serde(default)]
    pub edges: Vec<DraftEdge>,
    #[serde(skip)]
    pub shape_issues: Vec<ValidationIssue>,
}

impl DraftGraph {
    /// Pretty JSON used when the draft is shown back to the model.
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSignature {
    pub source_ref: String,
    pub predicate: String,
    pub target_ref: String,
}

/// Delta returned by the additions-only second pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdditionsDelta {
    pub nodes_new_add: Vec<DraftNode>,
    pub edges_add: Vec<DraftEdge>,
    pub edges_delete: Vec<EdgeSignature>,
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let end = text[start..].find("```")?;
    Some(text[start..start + end].trim())
}

/// Returns the balanced `{...}` starting at the first `{`, honouring strings.
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Pulls one JSON object out of a model response. Tries a ```json fence, a
/// bare ``` fence, the outermost braces, then the whole text.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, JsonExtractError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(JsonExtractError::Empty);
    }

    let mut candidates: Vec<&str> = Vec::new();
    if let Some(block) = fenced_block(text, "```json") {
        candidates.push(block);
    }
    if let Some(block) = fenced_block(text, "```") {
        candidates.push(block.trim_start_matches("json").trim());
    }
    if let Some(object) = outermost_object(text) {
        candidates.push(object);
    }
    candidates.push(text);

    let mut last_error = None;
    for candidate in candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(_) => {}
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    match last_error {
        Some(_) if text.contains('{') => Err(JsonExtractError::NoObject),
        Some(e) => Err(JsonExtractError::Invalid(e)),
        None => Err(JsonExtractError::NoObject),
    }
}

// ---------------------------------------------------------------------------
// Lenient field access
// ---------------------------------------------------------------------------

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn confidence_field(obj: &Map<String, Value>) -> Option<f64> {
    match obj.get("confidence")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decode_node(obj: &Map<String, Value>) -> DraftNode {
    DraftNode {
        temp_id: str_field(obj, "temp_id"),
        node_type: str_field(obj, "type"),
        label: str_field(obj, "label"),
        aliases: string_list(obj.get("aliases")),
    }
}

fn decode_edge(obj: &Map<String, Value>) -> DraftEdge {
    DraftEdge {
        source_ref: str_field(obj, "source_ref"),
        predicate: str_field(obj, "predicate"),
        target_ref: str_field(obj, "target_ref"),
        evidence: str_field(obj, "evidence"),
        utterance_ids: string_list(obj.get("utterance_ids")),
        confidence: confidence_field(obj),
    }
}

/// Decodes the objects of a list-valued field, recording shape problems.
fn decode_list<T>(
    obj: &Map<String, Value>,
    key: &str,
    element: &str,
    issues: &mut Vec<ValidationIssue>,
    decode: impl Fn(&Map<String, Value>) -> T,
) -> Vec<T> {
    let Some(Value::Array(items)) = obj.get(key) else {
        issues.push(ValidationIssue::new(
            format!("{key}_not_list"),
            format!("{key} must be a list"),
        ));
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item {
            Value::Object(map) => out.push(decode(map)),
            _ => {
                let issue = ValidationIssue::new(
                    format!("{element}_not_object"),
                    format!("{element} must be an object"),
                );
                issues.push(if element == "node" {
                    issue.at_node(index)
                } else {
                    issue.at_edge(index)
                });
            }
        }
    }
    out
}

fn signature_list(value: Option<&Value>) -> Vec<EdgeSignature> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|obj| EdgeSignature {
            source_ref: str_field(obj, "source_ref"),
            predicate: str_field(obj, "predicate"),
            target_ref: str_field(obj, "target_ref"),
        })
        .collect()
}

fn object_list<T>(value: Option<&Value>, decode: impl Fn(&Map<String, Value>) -> T) -> Vec<T> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).map(decode).collect(),
        _ => Vec::new(),
    }
}

pub fn draft_from_object(obj: &Map<String, Value>) -> DraftGraph {
    let mut shape_issues = Vec::new();
    let nodes_new = decode_list(obj, "nodes_new", "node", &mut shape_issues, decode_node);
    let edges = decode_list(obj, "edges", "edge", &mut shape_issues, decode_edge);
    DraftGraph {
        nodes_new,
        edges,
        shape_issues,
    }
}

/// Decodes a draft or repair response.
pub fn parse_draft(text: &str) -> ParseOutcome<DraftGraph> {
    match extract_json_object(text) {
        Ok(obj) => ParseOutcome::Parsed(draft_from_object(&obj)),
        Err(e) => ParseOutcome::Failed {
            error: e.to_string(),
        },
    }
}

/// Decodes an additions-only response. Missing or malformed lists are empty.
pub fn parse_additions(text: &str) -> ParseOutcome<AdditionsDelta> {
    match extract_json_object(text) {
        Ok(obj) => ParseOutcome::Parsed(AdditionsDelta {
            nodes_new_add: object_list(obj.get("nodes_new_add"), decode_node),
            edges_add: object_list(obj.get("edges_add"), decode_edge),
            edges_delete: signature_list(obj.get("edges_delete")),
        }),
        Err(e) => ParseOutcome::Failed {
            error: e.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Rewrites bare-second utterance references to `{video_id}:{seconds}`.
pub fn normalize_utterance_ids(edges: &mut [DraftEdge], video_id: &str) {
    for edge in edges {
        for uid in &mut edge.utterance_ids {
            let trimmed = uid.trim();
            *uid = if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                format!("{video_id}:{trimmed}")
            } else {
                trimmed.to_string()
            };
        }
    }
}

const EVIDENCE_NGRAMS: [usize; 4] = [6, 5, 4, 3];
const EVIDENCE_MIN_CHARS: usize = 60;
const EVIDENCE_MAX_CHARS: usize = 220;
const EVIDENCE_SLACK_CHARS: usize = 40;

/// Maps each `[utterance_id=...]` line of the window text to its raw text.
fn utterance_contents(window_text: &str) -> Vec<(&str, &str)> {
    window_text
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("[utterance_id=")?;
            let (header, content) = rest.split_once("] ")?;
            let uid = header.split(' ').next()?;
            Some((uid, content))
        })
        .collect()
}

/// Replaces evidence that is not a verbatim quote with a slice of the first
/// cited utterance, anchored at the longest shared word n-gram.
pub fn normalize_evidence(edges: &mut [DraftEdge], window_text: &str) {
    let contents = utterance_contents(window_text);
    for edge in edges {
        if !edge.evidence.is_empty() && window_text.contains(&edge.evidence) {
            continue;
        }
        let Some(first) = edge.utterance_ids.first() else {
            continue;
        };
        let first = first.trim();
        let Some(content) = contents
            .iter()
            .find(|(uid, _)| *uid == first)
            .map(|(_, content)| *content)
        else {
            continue;
        };
        if content.is_empty() || content.contains(&edge.evidence) {
            continue;
        }

        let flattened = edge.evidence.replace('\n', " ");
        let words: Vec<&str> = flattened.split_whitespace().collect();
        let mut start = None;
        for n in EVIDENCE_NGRAMS {
            if words.len() < n {
                continue;
            }
            start = words
                .windows(n)
                .find_map(|gram| content.find(&gram.join(" ")));
            if start.is_some() {
                break;
            }
        }
        let start = start.unwrap_or(0);

        let evidence_chars = edge.evidence.chars().count();
        let max_chars = (evidence_chars + EVIDENCE_SLACK_CHARS)
            .max(EVIDENCE_MIN_CHARS)
            .min(EVIDENCE_MAX_CHARS);
        let snippet: String = content[start..].chars().take(max_chars).collect();
        let snippet = snippet.trim_end();
        if !snippet.is_empty() {
            edge.evidence = snippet.to_string();
        }
    }
}
