//! Question routing: bind each question to the pages it can be evaluated
//! against and partition by declared tier.

use crate::config::RunMode;
use crate::model::{PageIndex, Question, RoutedQuestion};

/// Routed questions partitioned by tier, plus the questions that matched
/// no pages at all.
#[derive(Debug, Default)]
pub struct RoutedBatches {
    pub t1: Vec<RoutedQuestion>,
    pub t2: Vec<RoutedQuestion>,
    pub t3: Vec<RoutedQuestion>,
    pub skipped: Vec<Question>,
}

impl RoutedBatches {
    pub fn routed_count(&self) -> usize {
        self.t1.len() + self.t2.len() + self.t3.len()
    }
}

/// Route every question against the page index.
///
/// In sourcing mode only tier-1 questions run; tier-2/3-native questions
/// are dropped entirely (callers pre-filter priorities separately).
pub fn route(questions: &[Question], index: &PageIndex, mode: RunMode) -> RoutedBatches {
    let mut batches = RoutedBatches::default();

    for question in questions {
        if mode == RunMode::Sourcing && question.tier > 1 {
            continue;
        }
        match route_single(question, index) {
            Some(routed) => match question.tier {
                1 => batches.t1.push(routed),
                2 => batches.t2.push(routed),
                _ => batches.t3.push(routed),
            },
            None => batches.skipped.push(question.clone()),
        }
    }
    batches
}

/// Bind one question to its compatible pages. `None` when no page in the
/// index matches any of the question's page types.
pub fn route_single(question: &Question, index: &PageIndex) -> Option<RoutedQuestion> {
    let pages = index.of_types(&question.page_types);
    if pages.is_empty() {
        return None;
    }
    Some(RoutedQuestion {
        question: question.clone(),
        pages,
    })
}
