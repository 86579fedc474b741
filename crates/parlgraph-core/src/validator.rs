//! Local constraint checks on a decoded draft. Violations never fail a
//! window by themselves; they decide which second pass runs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::draft::DraftGraph;
use crate::vocab::{self, render_list};
use crate::window::Window;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_index: Option<usize>,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            edge_index: None,
            node_index: None,
        }
    }

    pub fn at_edge(mut self, index: usize) -> Self {
        self.edge_index = Some(index);
        self
    }

    pub fn at_node(mut self, index: usize) -> Self {
        self.node_index = Some(index);
        self
    }

    /// `- code: message (edge_index=i) (node_index=j)`
    pub fn prompt_line(&self) -> String {
        let mut line = format!("- {}: {}", self.code, self.message);
        if let Some(i) = self.edge_index {
            line.push_str(&format!(" (edge_index={i})"));
        }
        if let Some(j) = self.node_index {
            line.push_str(&format!(" (node_index={j})"));
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub edge_count: usize,
    pub node_count: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn violations_count(&self) -> usize {
        self.issues.len()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// What a draft is checked against.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    pub window_text: &'a str,
    pub utterance_ids: HashSet<&'a str>,
    pub speaker_ids: Vec<&'a str>,
    pub predicates: &'a [&'a str],
    pub node_types: &'a [&'a str],
}

impl<'a> ValidationContext<'a> {
    /// Context for `window` using the closed vocabularies. `window_text` is
    /// the rendered `window.text()`.
    pub fn for_window(window: &Window<'a>, window_text: &'a str) -> Self {
        Self {
            window_text,
            utterance_ids: window.utterance_ids().into_iter().collect(),
            speaker_ids: window.speaker_ids(),
            predicates: vocab::PREDICATES,
            node_types: vocab::NODE_TYPES,
        }
    }
}

/// Resolves a speaker reference against the window's speakers.
///
/// `speaker_X` is kept when `X` spoke in the window, a bare `s_X` becomes
/// `speaker_s_X` under the same condition, and any other non-empty ref is
/// returned unchanged.
pub fn normalize_speaker_ref<S: AsRef<str>>(reference: &str, speaker_ids: &[S]) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    let in_window = |id: &str| speaker_ids.iter().any(|s| s.as_ref() == id);

    if let Some(speaker_id) = reference.strip_prefix("speaker_") {
        return in_window(speaker_id).then(|| reference.to_string());
    }
    if reference.starts_with("s_") {
        return in_window(reference).then(|| format!("speaker_{reference}"));
    }
    Some(reference.to_string())
}

pub fn looks_like_speaker_ref(reference: &str) -> bool {
    reference.starts_with("speaker_") || reference.starts_with("s_")
}

fn sorted(values: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    out.sort();
    out
}

fn render_owned(values: &[String]) -> String {
    render_list(&values.iter().map(String::as_str).collect::<Vec<_>>())
}

pub fn validate(draft: &DraftGraph, ctx: &ValidationContext<'_>) -> ValidationReport {
    let mut issues = draft.shape_issues.clone();

    for (i, node) in draft.nodes_new.iter().enumerate() {
        if node.temp_id.trim().is_empty() {
            issues.push(ValidationIssue::new("node_missing_temp_id", "node missing temp_id").at_node(i));
        }
        if !ctx.node_types.contains(&node.node_type.trim()) {
            issues.push(
                ValidationIssue::new(
                    "node_type_invalid",
                    format!("node type must be one of: {}", render_owned(&sorted(ctx.node_types))),
                )
                .at_node(i),
            );
        }
        if node.label.trim().is_empty() {
            issues.push(ValidationIssue::new("node_missing_label", "node missing label").at_node(i));
        }
    }

    for (i, edge) in draft.edges.iter().enumerate() {
        let source_ref = edge.source_ref.trim();
        let target_ref = edge.target_ref.trim();

        if source_ref.is_empty() {
            issues.push(ValidationIssue::new("edge_missing_source_ref", "edge missing source_ref").at_edge(i));
        }
        if !ctx.predicates.contains(&edge.predicate.trim()) {
            issues.push(
                ValidationIssue::new(
                    "edge_predicate_invalid",
                    format!("predicate must be one of: {}", render_owned(&sorted(ctx.predicates))),
                )
                .at_edge(i),
            );
        }
        if target_ref.is_empty() {
            issues.push(ValidationIssue::new("edge_missing_target_ref", "edge missing target_ref").at_edge(i));
        }

        if edge.evidence.trim().is_empty() {
            issues.push(ValidationIssue::new("edge_missing_evidence", "edge missing evidence").at_edge(i));
        } else if !ctx.window_text.contains(&edge.evidence) {
            issues.push(
                ValidationIssue::new(
                    "edge_evidence_not_substring",
                    "evidence must be a direct substring of the transcript window",
                )
                .at_edge(i),
            );
        }

        if edge.utterance_ids.is_empty() {
            issues.push(
                ValidationIssue::new(
                    "edge_missing_utterance_ids",
                    "edge must include non-empty utterance_ids list",
                )
                .at_edge(i),
            );
        } else {
            let bad: Vec<String> = edge
                .utterance_ids
                .iter()
                .filter(|uid| !ctx.utterance_ids.contains(uid.as_str()))
                .cloned()
                .collect();
            if !bad.is_empty() {
                issues.push(
                    ValidationIssue::new(
                        "edge_bad_utterance_ids",
                        format!("utterance_ids not in window: {}", render_owned(&bad)),
                    )
                    .at_edge(i),
                );
            }
        }

        for (name, value) in [("source_ref", source_ref), ("target_ref", target_ref)] {
            if looks_like_speaker_ref(value) && normalize_speaker_ref(value, &ctx.speaker_ids).is_none() {
                issues.push(
                    ValidationIssue::new(
                        "edge_invalid_speaker_ref",
                        format!("{name} references speaker not present in window"),
                    )
                    .at_edge(i),
                );
            }
        }
    }

    ValidationReport {
        edge_count: draft.edges.len(),
        node_count: draft.nodes_new.len(),
        issues,
    }
}
