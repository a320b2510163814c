//! Answer reconciliation: merge tier answers, overlay structured
//! sources, apply deterministic enrichments, validate into field values.
//!
//! The merge is associative by field key, so answer arrival order within
//! a tier does not matter. Across tiers the rule is: a higher-tier
//! answer wins when its confidence is at least 0.3; within a tier the
//! higher confidence wins.

use crate::model::{Answer, Company, CrawledPage, FieldValue, PageIndex, PageType};
use crate::registry::FieldRegistry;
use crate::sources::LoanRecord;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Confidence floor a higher-tier answer needs to displace a lower-tier one.
const TIER_OVERRIDE_CONFIDENCE: f64 = 0.3;

/// Confidence assigned to pre-seeded company values.
const SEED_CONFIDENCE: f64 = 0.9;

/// Confidence assigned to loan-record matches.
const LOAN_MATCH_CONFIDENCE: f64 = 0.85;

/// Confidence assigned to heuristic revenue estimates.
const REVENUE_HEURISTIC_CONFIDENCE: f64 = 0.3;

/// Default revenue-per-employee used when no revenue answer exists.
const REVENUE_PER_EMPLOYEE: f64 = 150_000.0;

/// Valid two-digit NAICS sector prefixes.
const NAICS_SECTORS: &[&str] = &[
    "11", "21", "22", "23", "31", "32", "33", "42", "44", "45", "48", "49", "51", "52", "53",
    "54", "55", "56", "61", "62", "71", "72", "81", "92",
];

/// Everything phase 7 reconciles.
#[derive(Default)]
pub struct AggregateInputs<'a> {
    pub t1: &'a [Answer],
    pub t2: &'a [Answer],
    pub t3: &'a [Answer],
    /// Structured-database pre-fill, overlaid over LLM answers.
    pub adv_prefill: &'a [Answer],
    /// High-confidence answers reused from prior runs.
    pub existing: &'a [Answer],
    pub loans: &'a [LoanRecord],
}

/// Accounting from one aggregation pass.
#[derive(Debug, Default)]
pub struct AggregateStats {
    pub merged: usize,
    pub dropped_by_validation: usize,
    pub enrichments: Vec<String>,
}

/// Whether `candidate` displaces `current` under the tier/confidence rule.
pub fn beats(candidate: &Answer, current: &Answer) -> bool {
    if candidate.tier > current.tier {
        return candidate.confidence >= TIER_OVERRIDE_CONFIDENCE;
    }
    if candidate.tier == current.tier {
        return candidate.confidence > current.confidence;
    }
    false
}

/// Merge answers across tiers, keeping the best per field key.
pub fn merge_answers(tiers: &[&[Answer]]) -> HashMap<String, Answer> {
    let mut merged: HashMap<String, Answer> = HashMap::new();
    for tier in tiers {
        for answer in *tier {
            match merged.get(&answer.field_key) {
                Some(current) if !beats(answer, current) => {}
                _ => {
                    merged.insert(answer.field_key.clone(), answer.clone());
                }
            }
        }
    }
    merged
}

/// Run the full reconciliation and validation pass.
pub fn aggregate(
    company: &Company,
    index: &PageIndex,
    inputs: &AggregateInputs<'_>,
    registry: &FieldRegistry,
) -> (HashMap<String, FieldValue>, AggregateStats) {
    let mut stats = AggregateStats::default();
    let mut merged = merge_answers(&[inputs.t1, inputs.t2, inputs.t3]);

    // Structured-database pre-fill beats model output for its keys: it
    // came from a curated source, not an inference.
    for answer in inputs.adv_prefill {
        merged.insert(answer.field_key.clone(), answer.clone());
    }

    // Prior-run answers only fill holes.
    for answer in inputs.existing {
        merged
            .entry(answer.field_key.clone())
            .or_insert_with(|| answer.clone());
    }

    // Pre-seeded company values likewise.
    for (key, value) in &company.seed_values {
        merged.entry(key.clone()).or_insert_with(|| Answer {
            question_id: String::new(),
            field_key: key.clone(),
            value: value.clone(),
            confidence: SEED_CONFIDENCE,
            tier: 0,
            source: "seed".into(),
            source_url: None,
            reasoning: None,
            data_as_of: None,
        });
    }

    apply_enrichments(company, index, inputs, &mut merged, &mut stats);
    stats.merged = merged.len();

    let mut field_values = HashMap::new();
    for answer in merged.values() {
        match registry.validate(answer) {
            Some(fv) => {
                field_values.insert(fv.field_key.clone(), fv);
            }
            None => {
                if answer.has_value() {
                    stats.dropped_by_validation += 1;
                    tracing::debug!(field = %answer.field_key, "answer failed validation");
                }
            }
        }
    }
    (field_values, stats)
}

fn apply_enrichments(
    company: &Company,
    index: &PageIndex,
    inputs: &AggregateInputs<'_>,
    merged: &mut HashMap<String, Answer>,
    stats: &mut AggregateStats,
) {
    // Phone from homepage pages when extraction found none.
    if !merged.get("phone").is_some_and(Answer::has_value) {
        if let Some(phone) = phone_from_pages(index.of_type(PageType::Homepage)) {
            merged.insert("phone".into(), deterministic("phone", serde_json::json!(phone)));
            stats.enrichments.push("phone".into());
        }
    }

    // Business-model canonicalization in place.
    if let Some(answer) = merged.get_mut("business_model") {
        if let Some(raw) = answer.value.as_str() {
            if let Some(canonical) = canonicalize_business_model(raw) {
                if canonical != raw {
                    answer.value = serde_json::json!(canonical);
                    stats.enrichments.push("business_model".into());
                }
            }
        }
    }

    // NAICS sector check; an invalid code is worse than no code. A code
    // that also shows up in a state-filing page is corroborated.
    if let Some(answer) = merged.get("naics_code") {
        let code = match &answer.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        if !code.is_empty() && !naics_sector_valid(&code) {
            merged.remove("naics_code");
            stats.enrichments.push("naics_dropped".into());
        } else if !code.is_empty()
            && index
                .of_type(PageType::Sos)
                .iter()
                .any(|p| p.content.contains(&code))
        {
            if let Some(answer) = merged.get_mut("naics_code") {
                answer.confidence = answer.confidence.max(0.9);
            }
            stats.enrichments.push("naics_sos_confirmed".into());
        }
    }

    // Loan match: best name match against the loan records.
    if !merged.contains_key("loan_amount") {
        if let Some(name) = company.name.as_deref() {
            if let Some(record) = best_loan_match(name, inputs.loans) {
                merged.insert(
                    "loan_amount".into(),
                    deterministic("loan_amount", serde_json::json!(record.amount)),
                );
                stats.enrichments.push("loan_amount".into());
            }
        }
    }

    // Revenue heuristic from headcount, flagged by its low confidence.
    if !merged.get("revenue_estimate").is_some_and(Answer::has_value) {
        let employees = merged
            .get("employee_count")
            .and_then(|a| a.value.as_i64().or_else(|| a.value.as_str()?.parse().ok()));
        if let Some(n) = employees {
            if n > 0 {
                let mut answer = deterministic(
                    "revenue_estimate",
                    serde_json::json!(n as f64 * REVENUE_PER_EMPLOYEE),
                );
                answer.confidence = REVENUE_HEURISTIC_CONFIDENCE;
                answer.source = "heuristic".into();
                merged.insert("revenue_estimate".into(), answer);
                stats.enrichments.push("revenue_estimate".into());
            }
        }
    }
}

fn deterministic(field_key: &str, value: serde_json::Value) -> Answer {
    Answer {
        question_id: String::new(),
        field_key: field_key.to_string(),
        value,
        confidence: LOAN_MATCH_CONFIDENCE,
        tier: 0,
        source: "deterministic".into(),
        source_url: None,
        reasoning: None,
        data_as_of: None,
    }
}

/// First phone number found in the pages' metadata or body text.
pub fn phone_from_pages(pages: &[CrawledPage]) -> Option<String> {
    static PHONE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PHONE_RE.get_or_init(|| {
        Regex::new(r"\(?\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}").unwrap()
    });

    for page in pages {
        if let Some(phone) = &page.phone {
            return Some(phone.clone());
        }
        if let Some(m) = re.find(&page.content) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

/// Canonicalize business-model wording to the closed vocabulary.
pub fn canonicalize_business_model(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let has_b2b = lowered.contains("b2b") || lowered.contains("business-to-business");
    let has_b2c = lowered.contains("b2c")
        || lowered.contains("business-to-consumer")
        || lowered.contains("consumer");
    let has_b2g = lowered.contains("b2g") || lowered.contains("government");

    Some(match (has_b2b, has_b2c, has_b2g) {
        (true, true, _) => "B2B/B2C".to_string(),
        (true, false, true) => "B2B/B2G".to_string(),
        (true, false, false) => "B2B".to_string(),
        (false, true, _) => "B2C".to_string(),
        (false, false, true) => "B2G".to_string(),
        (false, false, false) => return None,
    })
}

/// Whether a NAICS code starts with a known sector.
pub fn naics_sector_valid(code: &str) -> bool {
    code.len() >= 2 && NAICS_SECTORS.contains(&&code[..2])
}

/// Best loan-record match by normalized borrower name.
pub fn best_loan_match<'a>(company_name: &str, loans: &'a [LoanRecord]) -> Option<&'a LoanRecord> {
    let target = normalize_name(company_name);
    if target.is_empty() {
        return None;
    }
    loans.iter().find(|l| {
        let borrower = normalize_name(&l.borrower_name);
        borrower == target || borrower.contains(&target) || target.contains(&borrower)
    })
}

fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped
        .split_whitespace()
        .filter(|w| !matches!(*w, "inc" | "llc" | "corp" | "co" | "ltd" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}
