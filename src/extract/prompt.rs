//! Prompt construction for the extraction tiers.
//!
//! Page text is fitted to a tier-specific character budget by relevance:
//! split into sections, score each by question-keyword hits, keep the
//! best that fit. Tagged external-profile pages bypass scoring and ride
//! along under their own small snippet budget.

use crate::model::{Answer, CrawledPage, Question, RoutedQuestion};

/// Shared system prompt for all extraction requests. Kept identical
/// across tiers so the provider's prefix cache is shared.
pub const EXTRACT_SYSTEM_PROMPT: &str = "You extract structured facts about a company from \
pages of its website and third-party profiles. Answer only from the provided text; never \
guess beyond it. For a single-field question respond with JSON: {\"value\": <value or null>, \
\"confidence\": <0.0-1.0>, \"reasoning\": \"<one sentence>\", \"source_url\": \"<page url>\"}. \
For a multi-field question respond with one JSON object keyed by field name, plus the same \
confidence, reasoning, and source_url keys. Use null for anything the text does not establish.";

/// Base and ceiling for tier-1 response budgets.
const T1_BASE_MAX_TOKENS: u32 = 512;
const PER_FIELD_MAX_TOKENS: u32 = 100;
const MAX_TOKENS_CEILING: u32 = 4_096;

/// Tier 2 and 3 answers carry synthesis, so they get more room.
const T2_BASE_MAX_TOKENS: u32 = 1_024;
const T3_MAX_TOKENS: u32 = 2_048;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "this", "that", "with", "from", "what", "which",
    "who", "how", "many", "much", "does", "did", "has", "have", "had", "its", "their", "they",
    "you", "your", "about", "into", "over", "any", "all", "not", "but", "can", "could", "should",
    "would", "company", "companies",
];

/// Max-tokens for a tier-1 request: 512 for single-field questions,
/// `min(max(512, 100 × N), 4096)` for N-field questions.
pub fn t1_max_tokens(question: &Question) -> u32 {
    let n = question.field_key_list().len() as u32;
    if n <= 1 {
        T1_BASE_MAX_TOKENS
    } else {
        (PER_FIELD_MAX_TOKENS * n).max(T1_BASE_MAX_TOKENS).min(MAX_TOKENS_CEILING)
    }
}

/// Max-tokens for a request at any tier.
pub fn max_tokens_for(question: &Question, tier: u8) -> u32 {
    match tier {
        1 => t1_max_tokens(question),
        2 => {
            let n = question.field_key_list().len() as u32;
            (PER_FIELD_MAX_TOKENS * 2 * n)
                .max(T2_BASE_MAX_TOKENS)
                .min(MAX_TOKENS_CEILING)
        }
        _ => T3_MAX_TOKENS,
    }
}

/// Keywords from the question text and instructions: lowercased words,
/// stop words and short tokens removed, deduplicated in order.
pub fn extract_keywords(question: &Question) -> Vec<String> {
    let mut keywords = Vec::new();
    let text = format!("{} {}", question.text, question.instructions);
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        let word = raw.to_lowercase();
        if word.len() < 3 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        if !keywords.contains(&word) {
            keywords.push(word);
        }
    }
    keywords
}

/// Split content into scoreable sections: markdown headings start a new
/// section, as do blank lines.
fn split_sections(content: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < content.len() {
        let line_end = content[i..]
            .find('\n')
            .map(|n| i + n + 1)
            .unwrap_or(content.len());
        let line = &content[i..line_end];
        let is_heading = line.trim_start().starts_with('#');
        let is_blank = line.trim().is_empty();
        if (is_heading || is_blank) && i > start {
            let section = content[start..i].trim();
            if !section.is_empty() {
                sections.push(section);
            }
            start = if is_blank { line_end } else { i };
        }
        i = line_end;
    }
    let tail = content[start..].trim();
    if !tail.is_empty() {
        sections.push(tail);
    }
    sections
}

fn score_section(section: &str, keywords: &[String]) -> usize {
    let lowered = section.to_lowercase();
    keywords.iter().map(|k| lowered.matches(k.as_str()).count()).sum()
}

/// Fit content to `budget` characters, preferring keyword-dense sections.
/// Falls back to a hard prefix truncation when scoring finds nothing.
pub fn truncate_relevant(content: &str, keywords: &[String], budget: usize) -> String {
    if content.chars().count() <= budget {
        return content.to_string();
    }
    if keywords.is_empty() {
        return hard_truncate(content, budget);
    }

    let sections = split_sections(content);
    let mut scored: Vec<(usize, usize, &str)> = sections
        .iter()
        .enumerate()
        .map(|(i, s)| (score_section(s, keywords), i, *s))
        .filter(|(score, ..)| *score > 0)
        .collect();
    // Highest score first; ties keep document order.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut chosen: Vec<(usize, &str)> = Vec::new();
    let mut used = 0;
    for (_, i, section) in scored {
        let len = section.chars().count();
        if used + len + 2 > budget {
            continue;
        }
        used += len + 2;
        chosen.push((i, section));
    }

    if chosen.is_empty() {
        return hard_truncate(content, budget);
    }
    // Reassemble in document order.
    chosen.sort_by_key(|(i, _)| *i);
    chosen
        .into_iter()
        .map(|(_, s)| s)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn hard_truncate(content: &str, budget: usize) -> String {
    content.chars().take(budget).collect()
}

/// Build the user content for one routed question.
///
/// Normal pages share the tier budget evenly and are relevance-truncated;
/// external-profile pages are always appended under the snippet budget.
pub fn build_user_content(
    routed: &RoutedQuestion,
    char_budget: usize,
    snippet_budget: usize,
) -> String {
    let question = &routed.question;
    let keywords = extract_keywords(question);

    let (profiles, site_pages): (Vec<&CrawledPage>, Vec<&CrawledPage>) =
        routed.pages.iter().partition(|p| p.is_external_profile());

    let mut out = String::new();
    out.push_str(&format!("Question: {}\n", question.text));
    if !question.instructions.is_empty() {
        out.push_str(&format!("Instructions: {}\n", question.instructions));
    }
    if let Some(format) = &question.output_format {
        out.push_str(&format!("Output format: {format}\n"));
    }
    out.push_str(&format!("Fields to extract: {}\n\n", question.field_keys));

    if !site_pages.is_empty() {
        let per_page = (char_budget / site_pages.len()).max(1);
        for page in &site_pages {
            let body = truncate_relevant(&page.content, &keywords, per_page);
            out.push_str(&format!("## Page: {} ({})\n{}\n\n", page.title, page.url, body));
        }
    }

    if !profiles.is_empty() {
        out.push_str("## Third-party snippets\n");
        let per_snippet = (snippet_budget / profiles.len()).max(1);
        for page in &profiles {
            let body = hard_truncate(&page.content, per_snippet);
            out.push_str(&format!("### {} ({})\n{}\n\n", page.title, page.url, body));
        }
    }

    out
}

/// The tier-2 context block: tier-1 findings weak enough to be worth
/// re-examining. High-confidence answers are withheld so they do not
/// anchor the synthesis.
pub fn build_t2_context(t1_answers: &[Answer], confidence_ceiling: f64) -> String {
    let mut lines: Vec<String> = t1_answers
        .iter()
        .filter(|a| a.confidence < confidence_ceiling)
        .map(|a| {
            let value = match &a.value {
                serde_json::Value::Null => "?".to_string(),
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            format!("{}: {} (confidence: {:.2})", a.field_key, value, a.confidence)
        })
        .collect();

    if lines.is_empty() {
        return "No previous findings.".to_string();
    }
    lines.sort();
    format!("Previous low-confidence findings to re-examine:\n{}", lines.join("\n"))
}
