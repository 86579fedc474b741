//! Display names for speakers cited in answers.

use parlgraph_store::{normalize_label, RosterEntry, Speaker};

/// Sittings of roster data consulted when naming speakers.
pub const ROSTER_SESSIONS: usize = 3;

const HONOURABLE: &str = "The Honourable";
const HONORIFICS: &[&str] = &["the honourable", "hon.", "hon", "mr.", "mr", "mrs.", "mrs", "ms.", "ms", "dr.", "dr", "sir"];

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Title-cases a lowercase name, expanding a leading `hon`.
fn title_case_name(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    match words.split_first() {
        Some((first, rest)) if matches!(first.to_lowercase().as_str(), "hon" | "hon.") => {
            let rest: Vec<String> = rest.iter().map(|w| title_case(w)).collect();
            format!("{HONOURABLE} {}", rest.join(" ")).trim().to_string()
        }
        _ => words.iter().map(|w| title_case(w)).collect::<Vec<_>>().join(" "),
    }
}

/// `s_santia_bradshaw_1` becomes `Santia Bradshaw`.
pub fn name_from_speaker_id(speaker_id: &str) -> String {
    let stem = speaker_id.strip_prefix("s_").unwrap_or(speaker_id);
    let parts: Vec<&str> = stem.split('_').filter(|p| !p.is_empty()).collect();
    let parts = match parts.split_last() {
        Some((last, rest)) if last.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => &parts[..],
    };
    title_case_name(&parts.join(" "))
}

/// Stored full name, else the normalized name or the speaker id rendered
/// as a title-cased name.
pub fn format_speaker_name(full_name: Option<&str>, normalized_name: Option<&str>, speaker_id: &str) -> String {
    if let Some(full) = full_name.map(str::trim).filter(|s| !s.is_empty()) {
        return full.to_string();
    }
    if let Some(normalized) = normalized_name.map(str::trim).filter(|s| !s.is_empty()) {
        return title_case_name(normalized);
    }
    name_from_speaker_id(speaker_id)
}

/// Lowercased name with leading honorifics removed, for matching.
fn match_key(name: &str) -> String {
    let mut key = normalize_label(name);
    loop {
        let stripped = HONORIFICS
            .iter()
            .find_map(|h| key.strip_prefix(h).and_then(|rest| rest.strip_prefix(' ')));
        match stripped {
            Some(rest) => key = rest.to_string(),
            None => return key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerDisplay {
    pub name: String,
    pub title: Option<String>,
}

/// Names speakers from recent roster data first, then from stored fields.
#[derive(Debug, Clone, Default)]
pub struct SpeakerDirectory {
    roster: Vec<(String, RosterEntry)>,
}

impl SpeakerDirectory {
    /// `roster` is expected newest session first; earlier entries win.
    pub fn new(roster: Vec<RosterEntry>) -> Self {
        Self {
            roster: roster
                .into_iter()
                .map(|entry| (match_key(&entry.name), entry))
                .filter(|(key, _)| !key.is_empty())
                .collect(),
        }
    }

    fn roster_entry(&self, speaker: &Speaker) -> Option<&RosterEntry> {
        let keys: Vec<String> = [
            speaker.full_name.as_deref().map(match_key),
            speaker.normalized_name.as_deref().map(match_key),
            Some(match_key(&name_from_speaker_id(&speaker.id))),
        ]
        .into_iter()
        .flatten()
        .filter(|k| !k.is_empty())
        .collect();
        self.roster
            .iter()
            .find(|(key, _)| keys.contains(key))
            .map(|(_, entry)| entry)
    }

    pub fn display(&self, speaker: &Speaker) -> SpeakerDisplay {
        let non_empty = |s: Option<&String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(entry) = self.roster_entry(speaker) {
            let name = entry.name.trim();
            let honourable = entry
                .title
                .as_deref()
                .is_some_and(|t| t.trim().to_lowercase().starts_with("hon"));
            return SpeakerDisplay {
                name: if honourable {
                    format!("{HONOURABLE} {name}")
                } else {
                    name.to_string()
                },
                title: non_empty(entry.role.as_ref())
                    .or_else(|| non_empty(speaker.position.as_ref()))
                    .or_else(|| non_empty(speaker.title.as_ref())),
            };
        }

        SpeakerDisplay {
            name: format_speaker_name(
                speaker.full_name.as_deref(),
                speaker.normalized_name.as_deref(),
                &speaker.id,
            ),
            title: non_empty(speaker.position.as_ref()).or_else(|| non_empty(speaker.title.as_ref())),
        }
    }
}
