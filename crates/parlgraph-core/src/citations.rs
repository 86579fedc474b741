//! Resolving the utterance ids an answer cites against the citations a
//! retrieval actually returned.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::retriever::{Citation, HybridRetriever, RetrievalResult};

pub const MIN_SOURCES: usize = 8;
pub const MAX_SOURCES: usize = 24;

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\]\(([^)\s]+)\)").expect("static regex is valid"));
static URL_FRAGMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^https?://[^#]+#").expect("static regex is valid"));
static SRC_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^#?src:").expect("static regex is valid"));
static SOURCE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^source:").expect("static regex is valid"));
static INLINE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:#src:|\bsource:)([A-Za-z0-9_:\-]+)").expect("static regex is valid"));
static ORDINAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("static regex is valid"));

/// Strips link decorations (`#src:`, `source:`, URL fragments) and
/// percent-encoding from a cited id.
pub fn normalize_citation_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let decoded = urlencoding::decode(trimmed)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| trimmed.to_string());
    let id = URL_FRAGMENT_RE.replace(decoded.trim(), "");
    let id = SRC_PREFIX_RE.replace(&id, "");
    let id = SOURCE_PREFIX_RE.replace(&id, "");
    id.trim().to_string()
}

/// Equivalent spellings of an id: as given, lowercased, and with or
/// without the `utt_` prefix.
pub fn citation_lookup_keys(id: &str) -> Vec<String> {
    let normalized = normalize_citation_id(id);
    if normalized.is_empty() {
        return Vec::new();
    }
    let lower = normalized.to_lowercase();
    let mut keys = vec![normalized.clone(), lower.clone()];
    match normalized.strip_prefix("utt_") {
        Some(bare) if !bare.is_empty() => {
            keys.push(bare.to_string());
            keys.push(bare.to_lowercase());
        }
        Some(_) => {}
        None => {
            keys.push(format!("utt_{normalized}"));
            keys.push(format!("utt_{lower}"));
        }
    }
    let mut seen = HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}

/// Ids named by source links in the answer text, e.g. `[1](#src:utt_1)`,
/// `[a](source:vid:12)` or `[b](https://host/page#src:vid:12)`.
pub fn linked_citation_ids(answer: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in LINK_RE.captures_iter(answer) {
        let href = caps[1].trim();
        let href = urlencoding::decode(href)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| href.to_string());
        let lower = href.to_ascii_lowercase();
        let id = if lower.starts_with("#src:") {
            &href[5..]
        } else if lower.starts_with("source:") {
            &href[7..]
        } else if URL_FRAGMENT_RE.is_match(&href) {
            match lower.find("#src:") {
                Some(pos) => &href[pos + 5..],
                None => "",
            }
        } else {
            ""
        };
        let id = id.trim();
        if !id.is_empty() && !out.iter().any(|o| o == id) {
            out.push(id.to_string());
        }
    }
    out
}

/// `#src:` and `source:` tokens written outside of links.
fn inline_citation_ids(answer: &str) -> Vec<String> {
    INLINE_TOKEN_RE
        .captures_iter(answer)
        .map(|caps| caps[1].trim_end_matches([':', '-']).to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Bracketed ordinals `[n]` that are not link text, mapped to the n-th
/// citation.
fn ordinal_citation_ids(answer: &str, citations: &[Citation]) -> Vec<String> {
    ORDINAL_RE
        .captures_iter(answer)
        .filter(|caps| {
            let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            !answer[end..].starts_with('(')
        })
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .filter_map(|n| n.checked_sub(1).and_then(|i| citations.get(i)))
        .map(|c| c.utterance_id.clone())
        .collect()
}

/// Lookup from every spelling of a known citation id to the id itself.
struct KnownCitations<'a> {
    by_key: HashMap<String, &'a str>,
    ids: Vec<&'a str>,
}

impl<'a> KnownCitations<'a> {
    fn new(citations: &'a [Citation]) -> Self {
        let mut by_key = HashMap::new();
        let mut ids = Vec::new();
        for citation in citations {
            let id = citation.utterance_id.trim();
            if id.is_empty() {
                continue;
            }
            ids.push(id);
            for key in citation_lookup_keys(id) {
                by_key.insert(key, id);
            }
        }
        Self { by_key, ids }
    }

    fn resolve(&self, id: &str) -> Option<&'a str> {
        if let Some(found) = citation_lookup_keys(id).iter().find_map(|k| self.by_key.get(k).copied()) {
            return Some(found);
        }
        // A bare seconds value matches `{video}:{seconds}` only when unambiguous.
        let bare = id.strip_prefix("utt_").unwrap_or(id);
        if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let suffix = format!(":{bare}");
        let mut matches = self.ids.iter().filter(|known| known.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(*only),
            _ => None,
        }
    }
}

/// Final cited ids for an answer: the schema ids first, then ids inferred
/// from source links, inline tokens and bracketed ordinals. Against a
/// retrieval, only ids that resolve to one of its citations survive and are
/// replaced by the canonical citation id. Without one, ids are only
/// normalized.
pub fn resolve_citation_ids(
    answer: &str,
    schema_ids: &[String],
    retrieval: Option<&RetrievalResult>,
) -> Vec<String> {
    let citations = retrieval.map(|r| r.citations.as_slice()).unwrap_or_default();
    let known = KnownCitations::new(citations);

    let mut candidates: Vec<String> = schema_ids.to_vec();
    candidates.extend(linked_citation_ids(answer));
    candidates.extend(inline_citation_ids(answer));
    candidates.extend(ordinal_citation_ids(answer, citations));

    let mut out: Vec<String> = Vec::new();
    for raw in candidates {
        let id = normalize_citation_id(&raw);
        if id.is_empty() {
            continue;
        }
        let resolved = if known.ids.is_empty() {
            id
        } else {
            match known.resolve(&id) {
                Some(found) => found.to_string(),
                None => continue,
            }
        };
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    out
}

/// How many sources to attach for `cited` resolved ids.
pub fn desired_sources(cited: usize) -> usize {
    if cited == 0 {
        MIN_SOURCES
    } else {
        cited.clamp(MIN_SOURCES, MAX_SOURCES)
    }
}

/// Source records for the cited ids, in citation order. Ids the retrieval
/// did not return are looked up in the store; lookup failures only shrink
/// the list.
pub async fn resolve_sources(
    retriever: &HybridRetriever,
    retrieval: Option<&RetrievalResult>,
    cite_ids: &[String],
    max_sources: usize,
) -> Vec<Citation> {
    let citations = retrieval.map(|r| r.citations.as_slice()).unwrap_or_default();
    let mut by_key: HashMap<String, &Citation> = HashMap::new();
    for citation in citations {
        for key in citation_lookup_keys(&citation.utterance_id) {
            by_key.insert(key, citation);
        }
    }

    let wanted: Vec<String> = cite_ids
        .iter()
        .map(|id| normalize_citation_id(id))
        .filter(|id| !id.is_empty())
        .collect();
    let missing: Vec<String> = wanted
        .iter()
        .filter(|id| !citation_lookup_keys(id).iter().any(|k| by_key.contains_key(k)))
        .cloned()
        .collect();

    let fetched: HashMap<String, Citation> = if missing.is_empty() {
        HashMap::new()
    } else {
        match retriever.citations(missing).await {
            Ok(rows) => rows.into_iter().map(|c| (c.utterance_id.clone(), c)).collect(),
            Err(e) => {
                tracing::warn!("source lookup failed: {e:#}");
                HashMap::new()
            }
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<Citation> = Vec::new();
    for id in &wanted {
        if out.len() >= max_sources {
            break;
        }
        let found = citation_lookup_keys(id)
            .iter()
            .find_map(|k| by_key.get(k).copied())
            .or_else(|| fetched.get(id));
        if let Some(citation) = found {
            if seen.insert(citation.utterance_id.clone()) {
                out.push(citation.clone());
            }
        }
    }
    out
}
