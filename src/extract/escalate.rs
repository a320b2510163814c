//! Escalation of weak tier-1 results into tier 2.
//!
//! A question escalates when any of its tier-1 answers lands under the
//! escalation confidence threshold, or when most of its answers came
//! back nil (the model looked and found nothing page after page).

use crate::model::{Answer, PageIndex, Question, RoutedQuestion};
use crate::route::route_single;
use std::collections::{HashMap, HashSet};

/// Fraction of nil answers per question above which it escalates even
/// when confidence stays above the threshold.
const NIL_RATE_THRESHOLD: f64 = 0.5;

/// Pick the tier-1 questions to re-run at tier 2, re-routed against the
/// same page-type rules and deduplicated by question id.
pub fn escalation_candidates(
    t1_answers: &[Answer],
    questions: &[Question],
    index: &PageIndex,
    confidence_threshold: f64,
) -> Vec<RoutedQuestion> {
    let mut by_question: HashMap<&str, Vec<&Answer>> = HashMap::new();
    for answer in t1_answers {
        by_question
            .entry(answer.question_id.as_str())
            .or_default()
            .push(answer);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut candidates = Vec::new();

    for question in questions {
        let Some(answers) = by_question.get(question.id.as_str()) else {
            continue;
        };
        if !seen.insert(question.id.as_str()) {
            continue;
        }

        let low_confidence = answers.iter().any(|a| a.confidence < confidence_threshold);
        let nil_count = answers.iter().filter(|a| !a.has_value()).count();
        let nil_rate = nil_count as f64 / answers.len() as f64;

        if low_confidence || nil_rate > NIL_RATE_THRESHOLD {
            if let Some(routed) = route_single(question, index) {
                candidates.push(routed);
            }
        }
    }
    candidates
}
