//! Cleanup applied to model answers before they are returned.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_FOLLOWUPS: usize = 4;
const MAX_HEADING_CHARS: usize = 60;
const MAX_HEADING_WORDS: usize = 8;
const MIN_TRAILING_QUESTIONS: usize = 2;

static FILLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:wuhloss|wuhlaw|well|so|okay|ok|alright|sure|certainly|absolutely|great question)\s*[,!.:]+\s*",
    )
    .expect("static regex is valid")
});
static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex is valid"));

const MINOR_WORDS: &[&str] = &["a", "an", "and", "as", "at", "by", "for", "in", "of", "on", "or", "the", "to", "vs", "with"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedAnswer {
    pub answer: String,
    pub followup_questions: Vec<String>,
}

/// Runs every cleanup step in order and merges follow-ups found in the text
/// with the ones the model returned separately.
pub fn postprocess_answer(answer: &str, schema_followups: &[String]) -> ProcessedAnswer {
    let text = strip_filler_opener(answer);
    let text = remove_key_connections(&text);
    let text = promote_headings(&text);
    let (text, trailing) = extract_trailing_followups(&text);
    ProcessedAnswer {
        answer: text.trim().to_string(),
        followup_questions: merge_followups(schema_followups, &trailing),
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Drops interjections such as "Wuhloss," or "Well," at the very start.
pub fn strip_filler_opener(text: &str) -> String {
    let mut current = text.trim_start().to_string();
    loop {
        let stripped = FILLER_RE.replace(&current, "").into_owned();
        if stripped.len() == current.len() {
            break;
        }
        current = stripped;
    }
    if current.len() == text.trim_start().len() {
        return text.to_string();
    }
    capitalize_first(&current)
}

fn is_bullet(line: &str) -> bool {
    let line = line.trim_start();
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("• ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (line[digits..].starts_with(". ") || line[digits..].starts_with(") "))
}

fn strip_bullet(line: &str) -> &str {
    let line = line.trim();
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim();
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ").or_else(|| line[digits..].strip_prefix(") ")) {
            return rest.trim();
        }
    }
    line
}

/// Heading text with markdown emphasis and a trailing colon removed,
/// lowercased.
fn heading_key(line: &str) -> String {
    line.trim()
        .trim_start_matches('#')
        .trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .trim_end_matches(':')
        .trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .to_lowercase()
}

/// Removes a "Key connections" heading together with the bullet list under it.
pub fn remove_key_connections(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if heading_key(lines[i]) != "key connections" {
            out.push(lines[i]);
            i += 1;
            continue;
        }
        i += 1;
        let mut saw_bullet = false;
        while i < lines.len() {
            let line = lines[i];
            if is_bullet(line) {
                saw_bullet = true;
            } else if !line.trim().is_empty() || saw_bullet {
                break;
            }
            i += 1;
        }
    }
    BLANK_RUN_RE.replace_all(&out.join("\n"), "\n\n").trim().to_string()
}

fn is_title_case(line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() || words.len() > MAX_HEADING_WORDS {
        return false;
    }
    words.iter().enumerate().all(|(i, word)| {
        let Some(first) = word.chars().find(|c| c.is_alphanumeric()) else {
            return true;
        };
        if first.is_ascii_digit() || first.is_uppercase() {
            return true;
        }
        i > 0 && MINOR_WORDS.contains(&word.to_lowercase().as_str())
    })
}

fn looks_like_heading(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty()
        && line.chars().count() <= MAX_HEADING_CHARS
        && !line.starts_with('#')
        && !line.starts_with('>')
        && !is_bullet(line)
        && !line.ends_with(['.', '?', '!', ':', ',', ';'])
        && !line.contains("](")
        && is_title_case(line)
}

/// Promotes short Title-Case lines that sit between blank lines to `###`
/// headings.
pub fn promote_headings(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let blank = |i: usize| lines.get(i).is_some_and(|l| l.trim().is_empty());
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let surrounded = i > 0 && blank(i - 1) && blank(i + 1);
            if surrounded && looks_like_heading(line) {
                format!("### {}", line.trim())
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Only short lines that read as a heading count; prose that happens to
/// mention questions stays in the answer.
fn is_followup_heading(line: &str) -> bool {
    let key = heading_key(line);
    if key.is_empty()
        || key.chars().count() > MAX_HEADING_CHARS
        || key.split_whitespace().count() > MAX_HEADING_WORDS
        || key.ends_with(['.', '?', '!', ','])
    {
        return false;
    }
    key.contains("follow-up") || key.contains("follow up") || key.contains("you might also ask") || key.ends_with("questions")
}

/// Splits a trailing block of questions off the answer. The block counts
/// only when at least two trailing lines end in `?`; an introducing heading
/// goes with it.
pub fn extract_trailing_followups(text: &str) -> (String, Vec<String>) {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let mut start = lines.len();
    let mut questions: Vec<String> = Vec::new();
    while start > 0 {
        let line = lines[start - 1];
        if line.trim().is_empty() && !questions.is_empty() {
            start -= 1;
            continue;
        }
        let candidate = strip_bullet(line);
        if !candidate.ends_with('?') {
            break;
        }
        questions.push(candidate.to_string());
        start -= 1;
    }
    if questions.len() < MIN_TRAILING_QUESTIONS {
        return (text.to_string(), Vec::new());
    }
    questions.reverse();

    while start > 0 && lines[start - 1].trim().is_empty() {
        start -= 1;
    }
    if start > 0 && is_followup_heading(lines[start - 1]) {
        start -= 1;
    }
    (lines[..start].join("\n").trim_end().to_string(), questions)
}

/// Schema follow-ups first, then extracted ones; case-insensitive dedupe,
/// capped at four.
pub fn merge_followups(schema: &[String], extracted: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for question in schema.iter().chain(extracted) {
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        let key = question.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(question.to_string());
        if out.len() == MAX_FOLLOWUPS {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_interjection() {
        assert_eq!(strip_filler_opener("Wuhloss, here's what I found."), "Here's what I found.");
        assert_eq!(strip_filler_opener("Well... ok, the bill passed."), "The bill passed.");
        assert_eq!(strip_filler_opener("So the bill passed."), "So the bill passed.");
        assert_eq!(strip_filler_opener("Water policy was debated."), "Water policy was debated.");
    }

    #[test]
    fn removes_key_connections_block() {
        let text = "Intro\n\nKey connections\n- a -> b\n- c -> d\n\nOutro";
        assert_eq!(remove_key_connections(text), "Intro\n\nOutro");

        let text = "Intro\n\n**Key connections:**\n\n1. a\n2. b\nTail";
        assert_eq!(remove_key_connections(text), "Intro\n\nTail");
    }

    #[test]
    fn promotes_only_surrounded_title_lines() {
        let text = "Intro paragraph here.\n\nWater Rates and Tariffs\n\nBody text.";
        assert_eq!(
            promote_headings(text),
            "Intro paragraph here.\n\n### Water Rates and Tariffs\n\nBody text."
        );
        let text = "Intro paragraph here.\nWater Rates\n\nBody text.";
        assert_eq!(promote_headings(text), text);
        let text = "Intro.\n\nthe water rates\n\nBody.";
        assert_eq!(promote_headings(text), text);
    }

    #[test]
    fn extracts_trailing_questions() {
        let text = "Answer body.\n\nFollow-up questions:\n- What did the minister say?\n- When is the vote?";
        let (body, questions) = extract_trailing_followups(text);
        assert_eq!(body, "Answer body.");
        assert_eq!(questions, vec!["What did the minister say?", "When is the vote?"]);
    }

    #[test]
    fn prose_mentioning_questions_is_not_a_heading() {
        let text = "The committee spent most of the sitting on water rates and left several open questions
- Who sets the tariff?
- When will it be reviewed?";
        let (body, questions) = extract_trailing_followups(text);
        assert_eq!(
            body,
            "The committee spent most of the sitting on water rates and left several open questions"
        );
        assert_eq!(questions.len(), 2);

        let (body, _) = extract_trailing_followups("Body.

**You might also ask:**
- Who?
- Why?");
        assert_eq!(body, "Body.");
    }

    #[test]
    fn single_trailing_question_stays_in_answer() {
        let text = "Answer body.\n\nWhat did the minister say?";
        let (body, questions) = extract_trailing_followups(text);
        assert_eq!(body, text);
        assert!(questions.is_empty());
    }

    #[test]
    fn merges_followups_schema_first() {
        let schema: Vec<String> = vec!["Q1".into(), "Q2".into(), "q1".into()];
        let extracted: Vec<String> = vec!["Q3".into(), "q2".into(), "Q4".into(), "Q5".into()];
        assert_eq!(merge_followups(&schema, &extracted), vec!["Q1", "Q2", "Q3", "Q4"]);
    }

    #[test]
    fn postprocess_leaves_plain_answers_and_links_alone() {
        let processed = postprocess_answer("Water policy was debated [1](source:utt_1).", &[]);
        assert_eq!(processed.answer, "Water policy was debated [1](source:utt_1).");
        assert!(processed.followup_questions.is_empty());
    }

    #[test]
    fn postprocess_runs_all_steps() {
        let raw = "Wuhloss, water rates rose.\n\nKey connections\n- a -> b\n\nWhy Rates Rose\n\nCosts went up.\n\n- Who proposed it?\n- When does it start?";
        let processed = postprocess_answer(raw, &["Who proposed it?".to_string()]);
        assert_eq!(processed.answer, "Water rates rose.\n\n### Why Rates Rose\n\nCosts went up.");
        assert_eq!(processed.followup_questions, vec!["Who proposed it?", "When does it start?"]);
    }
}
