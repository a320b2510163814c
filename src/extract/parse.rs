//! Parsing model responses into per-field answers.
//!
//! A response is JSON, possibly wrapped in code fences or prose. Two
//! shapes are accepted: a single-field `{"value": ...}` object, and a
//! multi-field object keyed by field name. Every field key the question
//! declares yields exactly one answer; what varies is the value and the
//! confidence.

use crate::model::{Answer, Question};
use serde_json::Value;

/// JSON keys that are response metadata, never field names.
pub const META_KEYS: &[&str] = &["confidence", "reasoning", "source_url", "flags"];

/// Confidence assumed when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Extract a JSON object from text that may contain other content.
/// Strips code fences, then brace-counts to the outermost object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let text = strip_fences(text);
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse one model response into answers for every field key the
/// question declares.
pub fn parse_answers(question: &Question, response_text: &str, tier: u8, source: &str) -> Vec<Answer> {
    let field_keys = question.field_key_list();

    let parsed: Option<Value> = extract_json_object(response_text)
        .and_then(|json| serde_json::from_str(&json).ok());

    let Some(Value::Object(map)) = parsed else {
        // Invalid JSON: a nil answer per declared field at confidence 0.
        return field_keys
            .iter()
            .map(|key| answer(question, key, Value::Null, 0.0, tier, source, None, None))
            .collect();
    };

    let confidence = map
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);
    let reasoning = map
        .get("reasoning")
        .and_then(Value::as_str)
        .map(String::from);
    let source_url = map
        .get("source_url")
        .and_then(Value::as_str)
        .map(String::from);

    // Single declared field with a `value` key: the canonical shape.
    if field_keys.len() == 1 && map.contains_key("value") {
        let value = map.get("value").cloned().unwrap_or(Value::Null);
        return vec![answer(
            question,
            &field_keys[0],
            value,
            confidence,
            tier,
            source,
            reasoning,
            source_url,
        )];
    }

    // Multi-field shape: look up each declared key. Missing keys signal
    // the model skipped them, so their confidence is halved; explicit
    // nulls keep full confidence.
    field_keys
        .iter()
        .map(|key| {
            if META_KEYS.contains(&key.as_str()) {
                return answer(question, key, Value::Null, 0.0, tier, source, None, None);
            }
            match map.get(key.as_str()) {
                Some(value) => answer(
                    question,
                    key,
                    value.clone(),
                    confidence,
                    tier,
                    source,
                    reasoning.clone(),
                    source_url.clone(),
                ),
                None => answer(
                    question,
                    key,
                    Value::Null,
                    confidence / 2.0,
                    tier,
                    source,
                    reasoning.clone(),
                    source_url.clone(),
                ),
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn answer(
    question: &Question,
    field_key: &str,
    value: Value,
    confidence: f64,
    tier: u8,
    source: &str,
    reasoning: Option<String>,
    source_url: Option<String>,
) -> Answer {
    Answer {
        question_id: question.id.clone(),
        field_key: field_key.to_string(),
        value,
        confidence,
        tier,
        source: source.to_string(),
        source_url,
        reasoning,
        data_as_of: None,
    }
}
