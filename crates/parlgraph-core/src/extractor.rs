//! Two-pass window extraction: draft, validate, then either add missing
//! edges or repair the draft, and fall back to pass 1 when pass 2 fails.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use parlgraph_provider::{LlmProvider, LlmRequest, RetryPolicy};
use parlgraph_store::normalize_label;
use serde::{Deserialize, Serialize};

use crate::draft::{
    normalize_evidence, normalize_utterance_ids, parse_additions, parse_draft, AdditionsDelta,
    DraftEdge, DraftGraph, DraftNode, ParseOutcome,
};
use crate::prompts::{self, PromptContext, EXTRACTION_SYSTEM_PROMPT};
use crate::validator::{validate, ValidationContext, ValidationReport};
use crate::vocab::{self, is_predicate};
use crate::window::Window;

pub const DEFAULT_MIN_EDGES: usize = 3;
pub const DEFAULT_MAX_ADDED_EDGES: usize = 3;
pub const DEFAULT_EXTRACTION_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// When the second pass runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoPassMode {
    None,
    #[default]
    Always,
    #[serde(alias = "on_fail")]
    OnParseFailure,
    #[serde(alias = "on_low_edges")]
    OnLowEdgeCount,
    OnViolations,
}

impl FromStr for TwoPassMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "always" => Ok(Self::Always),
            "on_parse_failure" | "on_fail" => Ok(Self::OnParseFailure),
            "on_low_edge_count" | "on_low_edges" => Ok(Self::OnLowEdgeCount),
            "on_violations" => Ok(Self::OnViolations),
            other => Err(anyhow!("unknown two-pass mode: {other}")),
        }
    }
}

impl fmt::Display for TwoPassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Always => "always",
            Self::OnParseFailure => "on_parse_failure",
            Self::OnLowEdgeCount => "on_low_edge_count",
            Self::OnViolations => "on_violations",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondPassKind {
    Additions,
    Repair,
}

/// Returns the trigger label when a second pass should run.
pub fn plan_second_pass(
    mode: TwoPassMode,
    pass1_parsed: bool,
    edge_count: usize,
    violations: usize,
    min_edges: usize,
) -> Option<&'static str> {
    match mode {
        TwoPassMode::None => None,
        TwoPassMode::Always => Some("always"),
        TwoPassMode::OnParseFailure => (!pass1_parsed).then_some("parse_fail"),
        TwoPassMode::OnLowEdgeCount => (pass1_parsed && edge_count < min_edges).then_some("low_edges"),
        TwoPassMode::OnViolations => (pass1_parsed && violations > 0).then_some("violations"),
    }
}

/// Merges an additions delta into the pass-1 draft.
///
/// An added node with the same type and normalized label as a draft node is
/// folded into that node. Other added temp ids that collide with draft ids
/// are renamed `a1`, `a2`, ... and the added edges follow the renaming.
/// Deletions remove draft edges with an exact `(source, predicate, target)`
/// match.
pub fn merge_additions(base: DraftGraph, delta: AdditionsDelta) -> DraftGraph {
    let DraftGraph {
        mut nodes_new,
        edges,
        shape_issues,
    } = base;

    let mut by_label: HashMap<(String, String), String> = nodes_new
        .iter()
        .map(|n| {
            (
                (n.node_type.trim().to_string(), normalize_label(&n.label)),
                n.temp_id.trim().to_string(),
            )
        })
        .collect();
    let mut taken: Vec<String> = nodes_new
        .iter()
        .map(|n| n.temp_id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    let mut remap: HashMap<String, String> = HashMap::new();
    let mut counter = 0;
    for node in delta.nodes_new_add {
        let old = node.temp_id.trim().to_string();
        let key = (node.node_type.trim().to_string(), normalize_label(&node.label));
        if let Some(existing) = by_label.get(&key) {
            if !old.is_empty() {
                remap.insert(old, existing.clone());
            }
            continue;
        }

        let mut new = old.clone();
        while new.is_empty() || taken.contains(&new) {
            counter += 1;
            new = format!("a{counter}");
        }
        if !old.is_empty() {
            remap.insert(old, new.clone());
        }
        taken.push(new.clone());
        by_label.insert(key, new.clone());
        nodes_new.push(DraftNode {
            temp_id: new,
            ..node
        });
    }

    let deletes = delta.edges_delete;
    let mut merged: Vec<DraftEdge> = edges
        .into_iter()
        .filter(|e| !deletes.contains(&e.signature()))
        .collect();

    let remap_ref = |r: String| remap.get(r.trim()).cloned().unwrap_or(r);
    for edge in delta.edges_add {
        merged.push(DraftEdge {
            source_ref: remap_ref(edge.source_ref),
            target_ref: remap_ref(edge.target_ref),
            ..edge
        });
    }

    DraftGraph {
        nodes_new,
        edges: merged,
        shape_issues,
    }
}

/// A draft edge that survived finalization, with provenance timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEdge {
    pub source_ref: String,
    pub predicate: String,
    pub target_ref: String,
    pub evidence: String,
    pub utterance_ids: Vec<String>,
    pub earliest_timestamp: Option<String>,
    pub earliest_seconds: Option<i64>,
    pub confidence: f64,
}

/// Drops edges without refs, evidence, utterance ids or a known predicate
/// and stamps the rest with the earliest cited utterance.
pub fn finalize_edges(window: &Window<'_>, edges: Vec<DraftEdge>) -> Vec<ExtractedEdge> {
    edges
        .into_iter()
        .filter_map(|edge| {
            let predicate = edge.predicate.trim().to_string();
            if edge.source_ref.trim().is_empty()
                || edge.target_ref.trim().is_empty()
                || edge.evidence.trim().is_empty()
                || edge.utterance_ids.is_empty()
                || !is_predicate(&predicate)
            {
                return None;
            }
            let earliest = edge
                .utterance_ids
                .iter()
                .filter_map(|uid| window.utterance(uid))
                .min_by_key(|u| u.seconds_since_start);
            let (earliest_timestamp, earliest_seconds) = match earliest {
                Some(u) => (Some(u.timestamp.clone()), Some(u.seconds_since_start)),
                None => (
                    window.earliest_timestamp().map(str::to_string),
                    window.earliest_seconds(),
                ),
            };
            Some(ExtractedEdge {
                source_ref: edge.source_ref.trim().to_string(),
                predicate,
                target_ref: edge.target_ref.trim().to_string(),
                evidence: edge.evidence,
                utterance_ids: edge.utterance_ids,
                earliest_timestamp,
                earliest_seconds,
                confidence: edge.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionDiagnostics {
    pub pass1_ms: u64,
    pub pass2_ms: Option<u64>,
    pub trigger: Option<&'static str>,
    pub pass1_edge_count: usize,
    pub pass1_violations: usize,
    pub pass1_error: Option<String>,
    pub pass2_error: Option<String>,
    pub pass2_kind: Option<SecondPassKind>,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult<'a> {
    pub window: Window<'a>,
    pub nodes_new: Vec<DraftNode>,
    pub edges: Vec<ExtractedEdge>,
    pub parse_success: bool,
    pub error: Option<String>,
    pub diagnostics: ExtractionDiagnostics,
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub two_pass: TwoPassMode,
    pub min_edges: usize,
    pub max_added_edges: usize,
    pub max_tokens: u32,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            two_pass: TwoPassMode::default(),
            min_edges: DEFAULT_MIN_EDGES,
            max_added_edges: DEFAULT_MAX_ADDED_EDGES,
            max_tokens: DEFAULT_EXTRACTION_MAX_TOKENS,
        }
    }
}

pub struct TwoPassExtractor {
    provider: Arc<dyn LlmProvider>,
    model: String,
    retry: RetryPolicy,
    settings: ExtractorSettings,
}

impl TwoPassExtractor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        retry: RetryPolicy,
        settings: ExtractorSettings,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            retry,
            settings,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn settings(&self) -> &ExtractorSettings {
        &self.settings
    }

    async fn complete(&self, prompt: String) -> anyhow::Result<String> {
        let request = LlmRequest::simple(
            self.model.clone(),
            Some(EXTRACTION_SYSTEM_PROMPT.to_string()),
            prompt,
        )
        .with_temperature(0.0)
        .with_max_tokens(self.settings.max_tokens);
        let response = self.retry.chat(self.provider.as_ref(), request).await?;
        Ok(response.text)
    }

    fn normalize(draft: &mut DraftGraph, video_id: &str, window_text: &str) {
        normalize_utterance_ids(&mut draft.edges, video_id);
        normalize_evidence(&mut draft.edges, window_text);
    }

    /// Extracts one window. Never returns an error: failures are reported
    /// through `parse_success` and `error`.
    pub async fn extract<'a>(&self, window: Window<'a>, known_nodes_table: &str) -> ExtractionResult<'a> {
        let window_text = window.text();
        let video_id = window.video_id();
        let ctx = PromptContext {
            window_text: &window_text,
            known_nodes_table,
            predicates: vocab::PREDICATES,
            node_types: vocab::NODE_TYPES,
        };
        let target_edges = window.utterances.len() + 2;
        let mut diagnostics = ExtractionDiagnostics::default();

        // Pass 1
        let started = Instant::now();
        let mut pass1_raw = None;
        let pass1 = match self.complete(prompts::draft_prompt(&ctx, target_edges)).await {
            Ok(text) => {
                let outcome = parse_draft(&text);
                pass1_raw = Some(text);
                outcome
            }
            Err(e) => ParseOutcome::Failed {
                error: format!("{e:#}"),
            },
        };
        diagnostics.pass1_ms = started.elapsed().as_millis() as u64;

        let (pass1_draft, report) = match pass1 {
            ParseOutcome::Parsed(mut draft) => {
                Self::normalize(&mut draft, video_id, &window_text);
                let report = validate(&draft, &ValidationContext::for_window(&window, &window_text));
                (Some(draft), report)
            }
            ParseOutcome::Failed { error } => {
                tracing::warn!(
                    "window {} pass 1 failed for video {video_id}: {error}",
                    window.window_index
                );
                diagnostics.pass1_error = Some(error);
                (None, ValidationReport::default())
            }
        };
        diagnostics.pass1_edge_count = report.edge_count;
        diagnostics.pass1_violations = report.violations_count();

        let trigger = plan_second_pass(
            self.settings.two_pass,
            pass1_draft.is_some(),
            report.edge_count,
            report.violations_count(),
            self.settings.min_edges,
        );
        diagnostics.trigger = trigger;

        let mut final_draft = pass1_draft.clone();
        if trigger.is_some() {
            let started = Instant::now();
            let kind = match &pass1_draft {
                Some(_) if report.is_clean() => SecondPassKind::Additions,
                _ => SecondPassKind::Repair,
            };
            diagnostics.pass2_kind = Some(kind);
            let draft_json = match (&pass1_draft, &pass1_raw) {
                (Some(draft), _) => draft.to_prompt_json(),
                (None, Some(raw)) => raw.clone(),
                (None, None) => "{}".to_string(),
            };

            match self
                .second_pass(kind, &ctx, &draft_json, &report, target_edges, pass1_draft.clone(), video_id)
                .await
            {
                Ok(draft) => final_draft = Some(draft),
                Err(error) => {
                    tracing::warn!(
                        "window {} pass 2 failed, keeping pass 1: {error}",
                        window.window_index
                    );
                    diagnostics.pass2_error = Some(error);
                }
            }
            diagnostics.pass2_ms = Some(started.elapsed().as_millis() as u64);
        }

        match final_draft {
            Some(draft) => ExtractionResult {
                window,
                edges: finalize_edges(&window, draft.edges),
                nodes_new: draft.nodes_new,
                parse_success: true,
                error: None,
                diagnostics,
            },
            None => ExtractionResult {
                window,
                nodes_new: Vec::new(),
                edges: Vec::new(),
                parse_success: false,
                error: diagnostics.pass1_error.clone(),
                diagnostics,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn second_pass(
        &self,
        kind: SecondPassKind,
        ctx: &PromptContext<'_>,
        draft_json: &str,
        report: &ValidationReport,
        target_edges: usize,
        base: Option<DraftGraph>,
        video_id: &str,
    ) -> Result<DraftGraph, String> {
        let prompt = match kind {
            SecondPassKind::Additions => {
                prompts::additions_prompt(ctx, draft_json, target_edges, self.settings.max_added_edges)
            }
            SecondPassKind::Repair => {
                prompts::repair_prompt(ctx, draft_json, &report.issues, self.settings.max_added_edges)
            }
        };
        let text = self.complete(prompt).await.map_err(|e| format!("{e:#}"))?;

        match kind {
            SecondPassKind::Additions => {
                let mut delta = match parse_additions(&text) {
                    ParseOutcome::Parsed(delta) => delta,
                    ParseOutcome::Failed { error } => return Err(error),
                };
                normalize_utterance_ids(&mut delta.edges_add, video_id);
                normalize_evidence(&mut delta.edges_add, ctx.window_text);
                Ok(merge_additions(base.unwrap_or_default(), delta))
            }
            SecondPassKind::Repair => match parse_draft(&text) {
                ParseOutcome::Parsed(mut draft) => {
                    Self::normalize(&mut draft, video_id, ctx.window_text);
                    Ok(draft)
                }
                ParseOutcome::Failed { error } => Err(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::EdgeSignature;
    use crate::testing::ScriptedProvider;
    use crate::window::{build_windows, tests::utterance};
    use parlgraph_provider::Backoff;
    use parlgraph_store::Utterance;

    fn node(temp_id: &str, node_type: &str, label: &str) -> DraftNode {
        DraftNode {
            temp_id: temp_id.into(),
            node_type: node_type.into(),
            label: label.into(),
            aliases: vec![],
        }
    }

    fn edge(source: &str, predicate: &str, target: &str) -> DraftEdge {
        DraftEdge {
            source_ref: source.into(),
            predicate: predicate.into(),
            target_ref: target.into(),
            evidence: "fixed penalty regime".into(),
            utterance_ids: vec!["vid:10".into()],
            confidence: None,
        }
    }

    #[test]
    fn second_pass_triggers() {
        assert_eq!(plan_second_pass(TwoPassMode::None, false, 0, 5, 3), None);
        assert_eq!(plan_second_pass(TwoPassMode::Always, true, 9, 0, 3), Some("always"));
        assert_eq!(plan_second_pass(TwoPassMode::OnParseFailure, false, 0, 0, 3), Some("parse_fail"));
        assert_eq!(plan_second_pass(TwoPassMode::OnParseFailure, true, 0, 0, 3), None);
        assert_eq!(plan_second_pass(TwoPassMode::OnLowEdgeCount, true, 2, 0, 3), Some("low_edges"));
        assert_eq!(plan_second_pass(TwoPassMode::OnLowEdgeCount, false, 0, 0, 3), None);
        assert_eq!(plan_second_pass(TwoPassMode::OnViolations, true, 4, 1, 3), Some("violations"));
        assert_eq!(plan_second_pass(TwoPassMode::OnViolations, true, 4, 0, 3), None);
    }

    #[test]
    fn two_pass_mode_parses_aliases() {
        assert_eq!("on_fail".parse::<TwoPassMode>().unwrap(), TwoPassMode::OnParseFailure);
        assert_eq!("ON_VIOLATIONS".parse::<TwoPassMode>().unwrap(), TwoPassMode::OnViolations);
        assert!("sometimes".parse::<TwoPassMode>().is_err());
        assert_eq!(TwoPassMode::OnLowEdgeCount.to_string(), "on_low_edge_count");
    }

    #[test]
    fn merge_remaps_colliding_temp_ids() {
        let base = DraftGraph {
            nodes_new: vec![node("n1", "skos:Concept", "Road Safety"), node("a1", "schema:Place", "Nassau")],
            edges: vec![edge("speaker_s_a", "ADDRESSES", "n1")],
            ..Default::default()
        };
        let delta = AdditionsDelta {
            nodes_new_add: vec![node("n1", "skos:Concept", "Speed Cameras")],
            edges_add: vec![edge("n1", "AIMS_TO_REDUCE", "a1")],
            edges_delete: vec![],
        };
        let merged = merge_additions(base, delta);

        let ids: Vec<&str> = merged.nodes_new.iter().map(|n| n.temp_id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "a1", "a2"]);
        assert_eq!(merged.edges[1].source_ref, "a2");
        assert_eq!(merged.edges[1].target_ref, "a1");
        assert_eq!(merged.edges[0].target_ref, "n1");
    }

    #[test]
    fn merge_folds_duplicate_labels_into_draft_nodes() {
        let base = DraftGraph {
            nodes_new: vec![node("n1", "skos:Concept", "Road Safety")],
            edges: vec![],
            ..Default::default()
        };
        let delta = AdditionsDelta {
            nodes_new_add: vec![node("a1", "skos:Concept", "  road   SAFETY ")],
            edges_add: vec![edge("speaker_s_a", "ADDRESSES", "a1")],
            edges_delete: vec![],
        };
        let merged = merge_additions(base, delta);
        assert_eq!(merged.nodes_new.len(), 1);
        assert_eq!(merged.edges[0].target_ref, "n1");
    }

    #[test]
    fn merge_folds_repeated_additions_into_one_node() {
        let base = DraftGraph {
            nodes_new: vec![node("n1", "skos:Concept", "Road Safety")],
            edges: vec![],
            ..Default::default()
        };
        let delta = AdditionsDelta {
            nodes_new_add: vec![
                node("a1", "skos:Concept", "Speed Cameras"),
                node("a2", "skos:Concept", "speed  cameras"),
                node("a3", "schema:Place", "Speed Cameras"),
            ],
            edges_add: vec![
                edge("speaker_s_a", "PROPOSES", "a1"),
                edge("a2", "AIMS_TO_REDUCE", "n1"),
            ],
            edges_delete: vec![],
        };
        let merged = merge_additions(base, delta);

        let ids: Vec<&str> = merged.nodes_new.iter().map(|n| n.temp_id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "a1", "a3"]);
        assert_eq!(merged.edges[0].target_ref, "a1");
        assert_eq!(merged.edges[1].source_ref, "a1");
    }

    #[test]
    fn merge_applies_exact_deletions() {
        let base = DraftGraph {
            nodes_new: vec![],
            edges: vec![edge("a", "CAUSES", "b"), edge("a", "CAUSES", "c")],
            ..Default::default()
        };
        let delta = AdditionsDelta {
            edges_delete: vec![
                EdgeSignature {
                    source_ref: "a".into(),
                    predicate: "CAUSES".into(),
                    target_ref: "b".into(),
                },
                EdgeSignature {
                    source_ref: "a".into(),
                    predicate: "causes".into(),
                    target_ref: "c".into(),
                },
            ],
            ..Default::default()
        };
        let merged = merge_additions(base, delta);
        assert_eq!(merged.edges.len(), 1);
        assert_eq!(merged.edges[0].target_ref, "c");
    }

    fn transcript() -> Vec<Utterance> {
        vec![
            utterance("vid", 10, "s_a", "We will introduce a fixed penalty regime for traffic offences."),
            utterance("vid", 20, "s_b", "The Road Traffic Act must be amended first, Madam Speaker."),
        ]
    }

    #[test]
    fn finalize_drops_unusable_edges_and_stamps_time() {
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let mut cited_late = edge("speaker_s_b", "AMENDS", "n1");
        cited_late.utterance_ids = vec!["vid:20".into()];
        cited_late.confidence = Some(0.9);
        let mut no_ids = edge("speaker_s_a", "PROPOSES", "n1");
        no_ids.utterance_ids.clear();
        let mut unknown_uid = edge("speaker_s_a", "PROPOSES", "n1");
        unknown_uid.utterance_ids = vec!["vid:999".into()];

        let edges = finalize_edges(
            &window,
            vec![cited_late, no_ids, edge("speaker_s_a", "LIKES", "n1"), unknown_uid],
        );
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].earliest_seconds, Some(20));
        assert_eq!(edges[0].earliest_timestamp.as_deref(), Some("00:00:20"));
        assert_eq!(edges[0].confidence, 0.9);
        assert_eq!(edges[1].earliest_seconds, Some(10));
        assert_eq!(edges[1].confidence, DEFAULT_CONFIDENCE);
    }

    fn extractor(provider: Arc<ScriptedProvider>, mode: TwoPassMode) -> TwoPassExtractor {
        TwoPassExtractor::new(
            provider,
            "test-model",
            RetryPolicy::new(1, Backoff::default()),
            ExtractorSettings {
                two_pass: mode,
                ..Default::default()
            },
        )
    }

    const CLEAN_DRAFT: &str = r#"{"nodes_new": [{"temp_id": "n1", "type": "skos:Concept", "label": "Fixed Penalty Regime"}],
        "edges": [{"source_ref": "speaker_s_a", "predicate": "PROPOSES", "target_ref": "n1",
                   "evidence": "introduce a fixed penalty regime", "utterance_ids": ["10"], "confidence": 0.8}]}"#;

    #[tokio::test]
    async fn clean_draft_runs_additions_and_merges() {
        let provider = Arc::new(ScriptedProvider::texts(&[
            CLEAN_DRAFT,
            r#"```json
            {"nodes_new_add": [{"temp_id": "n1", "type": "schema:Legislation", "label": "Road Traffic Act"}],
             "edges_add": [{"source_ref": "speaker_s_b", "predicate": "ASSOCIATED_WITH", "target_ref": "n1",
                            "evidence": "The Road Traffic Act must be amended", "utterance_ids": ["vid:20"]}],
             "edges_delete": []}
            ```"#,
        ]));
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let result = extractor(provider.clone(), TwoPassMode::Always).extract(window, "").await;

        assert!(result.parse_success);
        assert_eq!(result.diagnostics.trigger, Some("always"));
        assert_eq!(result.diagnostics.pass2_kind, Some(SecondPassKind::Additions));
        assert_eq!(result.nodes_new.len(), 2);
        assert_eq!(result.edges.len(), 2);
        assert_eq!(result.edges[0].utterance_ids, vec!["vid:10"]);
        assert_eq!(result.edges[1].target_ref, result.nodes_new[1].temp_id);
        assert_ne!(result.nodes_new[1].temp_id, "n1");

        let request = provider.request(0);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.system.as_deref(), Some(EXTRACTION_SYSTEM_PROMPT));
        assert!(provider.request(1).messages[0].text().contains("CURRENT DRAFT JSON"));
    }

    #[tokio::test]
    async fn violations_run_repair_which_replaces_draft() {
        let provider = Arc::new(ScriptedProvider::texts(&[
            r#"{"nodes_new": [], "edges": [{"source_ref": "speaker_s_zz", "predicate": "PROPOSES",
                "target_ref": "kg_aaaaaaaaaaaa", "evidence": "introduce a fixed penalty regime", "utterance_ids": ["vid:10"]}]}"#,
            CLEAN_DRAFT,
        ]));
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let result = extractor(provider.clone(), TwoPassMode::OnViolations).extract(window, "").await;

        assert_eq!(result.diagnostics.trigger, Some("violations"));
        assert_eq!(result.diagnostics.pass1_violations, 1);
        assert_eq!(result.diagnostics.pass2_kind, Some(SecondPassKind::Repair));
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].source_ref, "speaker_s_a");
        assert!(provider
            .request(1)
            .messages[0]
            .text()
            .contains("- edge_invalid_speaker_ref: source_ref references speaker not present in window (edge_index=0)"));
    }

    #[tokio::test]
    async fn failed_second_pass_keeps_first() {
        let provider = Arc::new(ScriptedProvider::texts(&[CLEAN_DRAFT, "no json here"]));
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let result = extractor(provider, TwoPassMode::Always).extract(window, "").await;

        assert!(result.parse_success);
        assert!(result.diagnostics.pass2_error.is_some());
        assert_eq!(result.edges.len(), 1);
    }

    #[tokio::test]
    async fn unparsable_first_pass_can_be_repaired() {
        let provider = Arc::new(ScriptedProvider::texts(&["Sorry, here it is: {broken", CLEAN_DRAFT]));
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let result = extractor(provider.clone(), TwoPassMode::OnParseFailure).extract(window, "").await;

        assert!(result.parse_success);
        assert_eq!(result.diagnostics.trigger, Some("parse_fail"));
        assert!(result.diagnostics.pass1_error.is_some());
        assert!(provider.request(1).messages[0].text().contains("{broken"));
    }

    #[tokio::test]
    async fn window_fails_when_no_pass_parses() {
        let provider = Arc::new(ScriptedProvider::texts(&["nothing useful"]));
        let utterances = transcript();
        let refs: Vec<&Utterance> = utterances.iter().collect();
        let window = build_windows(&refs, 2, 2)[0];

        let result = extractor(provider.clone(), TwoPassMode::None).extract(window, "").await;

        assert!(!result.parse_success);
        assert!(result.error.is_some());
        assert!(result.edges.is_empty());
        assert_eq!(provider.request_count(), 1);
    }
}
