//! The enrichment orchestrator.
//!
//! One `Pipeline::run` call executes the nine-phase sequence for a
//! single company: name derivation, the data-source fan-out, page
//! classification, question routing, the three extraction tiers,
//! aggregation, the report, and the quality gate. Phases 4 and 5
//! overlap: tier 2 is spawned alongside tier 1 and waits on a watch
//! channel that tier 1 flips on completion, so escalations start the
//! instant tier-1 answers exist.
//!
//! Fatality policy: phase-1 failures are decided by the fan-out policy;
//! classification, tier-1, and aggregation failures fail the run;
//! everything downstream of aggregation is best-effort.

pub mod collect;
pub mod report;
pub mod tracker;

pub use collect::{CollectOutcome, SourceSet};
pub use report::{format_report, quality_score, RecordSink, WriteIntent};
pub use tracker::PhaseTracker;

use crate::aggregate::{self, AggregateInputs};
use crate::classify::Classifier;
use crate::config::{EnrichConfig, RunMode, Tier3Gate};
use crate::errors::{is_transient, RunError};
use crate::extract::ExtractionEngine;
use crate::llm::LlmClient;
use crate::model::{
    Answer, Company, PageIndex, PhaseResult, PhaseStatus, Question, RunOutcome,
};
use crate::questions;
use crate::registry::FieldRegistry;
use crate::resilience::Envelope;
use crate::route::{self, RoutedBatches};
use crate::sources::StructuredPrefill;
use crate::store::{AnswerStore, CheckpointStore, PageCache, RunFailure, RunStore};
use anyhow::Context;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Checkpoint phase key for resumable tier-1 answers.
const T1_CHECKPOINT_PHASE: &str = "t1_complete";

pub struct Pipeline {
    pub config: Arc<EnrichConfig>,
    pub registry: Arc<FieldRegistry>,
    pub questions: Vec<Question>,
    pub llm: Arc<dyn LlmClient>,
    pub envelope: Envelope,
    pub sources: SourceSet,
    pub adv_prefill: Option<Arc<dyn StructuredPrefill>>,
    pub run_store: Arc<dyn RunStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub page_cache: Arc<dyn PageCache>,
    pub answer_store: Arc<dyn AnswerStore>,
    pub sink: Option<Arc<dyn RecordSink>>,
}

impl Pipeline {
    /// Enrich one company end to end.
    pub async fn run(&self, company: Company) -> Result<RunOutcome, RunError> {
        let run = self
            .run_store
            .create_run(&company)
            .context("failed to create run record")
            .map_err(RunError::Other)?;
        tracing::info!(company = %company.url, run = %run.id, "enrichment run started");
        let tracker = PhaseTracker::new(self.run_store.clone(), &run.id);

        let result = match self.config.deadline_secs {
            Some(secs) => {
                let deadline = Duration::from_secs(secs);
                match tokio::time::timeout(deadline, self.run_inner(company.clone(), &run.id, &tracker))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RunError::PhaseFailed {
                        phase: "deadline".into(),
                        message: format!("run exceeded {secs}s deadline"),
                    }),
                }
            }
            None => self.run_inner(company.clone(), &run.id, &tracker).await,
        };

        match result {
            Ok(outcome) => {
                if let Err(err) = self.run_store.update_run_result(&run.id, &outcome) {
                    tracing::warn!(%err, "failed to persist run result");
                }
                if let Err(err) = self.checkpoints.delete(&company.url) {
                    tracing::warn!(%err, "failed to delete checkpoint");
                }
                tracing::info!(
                    company = %company.url,
                    fields = outcome.field_values.len(),
                    cost = outcome.total_cost,
                    "enrichment run complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                let failure = RunFailure {
                    category: failure_category(&err).to_string(),
                    phase: failure_phase(&err),
                    message: err.to_string(),
                    phase_statuses: tracker.phase_statuses(),
                };
                if let Err(persist_err) = self.run_store.fail_run(&run.id, &failure) {
                    tracing::warn!(%persist_err, "failed to persist run failure");
                }
                tracing::error!(company = %company.url, %err, "enrichment run failed");
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        mut company: Company,
        run_id: &str,
        tracker: &PhaseTracker,
    ) -> Result<RunOutcome, RunError> {
        // Phase 0: derive a name from the homepage when none was given.
        if company.name.is_none() {
            if let Some(crawler) = self.sources.crawler.clone() {
                let url = company.url.clone();
                let (_, name) = tracker
                    .track_with("derive_name", async move {
                        let name = crawler.probe_name(&url).await?;
                        let result = PhaseResult::complete("")
                            .with_metadata("derived", serde_json::json!(name.is_some()));
                        Ok((result, name))
                    })
                    .await;
                if let Some(name) = name {
                    tracing::info!(company = %company.url, name = %name, "derived company name");
                    company.name = Some(name);
                }
            }
        }

        // Phase 1: data-source fan-out.
        let collected = collect::collect_sources(
            &company,
            &self.sources,
            self.page_cache.as_ref(),
            tracker,
            &self.config,
        )
        .await?;

        // Phase 2: classification. Fatal: nothing downstream works
        // without the page index.
        let (classify_result, index) = tracker
            .track_with("classify", async {
                let classifier = Classifier {
                    llm: self.llm.as_ref(),
                    envelope: &self.envelope,
                    config: &self.config,
                };
                let outcome = classifier.classify(collected.pages.clone(), &company.url).await?;
                let mut result = PhaseResult::complete("")
                    .with_metadata("pages", serde_json::json!(outcome.index.page_count()))
                    .with_metadata("deterministic", serde_json::json!(outcome.deterministic))
                    .with_metadata("llm_classified", serde_json::json!(outcome.llm_classified));
                result.usage = outcome.usage;
                Ok((result, outcome.index))
            })
            .await;
        if classify_result.status == PhaseStatus::Failed {
            return Err(RunError::PhaseFailed {
                phase: "classify".into(),
                message: classify_result.error.unwrap_or_default(),
            });
        }

        // Existing-answer reuse: fetch once, filter the routed batches.
        let existing = self.existing_answers(&company);
        let reused_keys: HashSet<&str> = existing.iter().map(|a| a.field_key.as_str()).collect();

        // Phase 3: routing.
        let questions = questions::filter_for_mode(self.questions.clone(), self.config.mode);
        let (_, batches) = tracker
            .track_with("route", async {
                let mut batches = route::route(&questions, &index, self.config.mode);
                let before = batches.routed_count();
                retain_unanswered(&mut batches, &reused_keys);
                let result = PhaseResult::complete("")
                    .with_metadata("routed", serde_json::json!(batches.routed_count()))
                    .with_metadata("no_pages", serde_json::json!(batches.skipped.len()))
                    .with_metadata(
                        "reused_answers",
                        serde_json::json!(before - batches.routed_count()),
                    );
                Ok((result, batches))
            })
            .await;

        // Phases 4-5: tier 1 and tier 2, overlapped via a completion
        // channel. Tier 2 waits for the flip before consuming tier-1
        // answers; escalations start the moment they exist.
        let engine = ExtractionEngine {
            llm: self.llm.as_ref(),
            envelope: &self.envelope,
            config: &self.config,
        };
        let (t1_tx, t1_rx) = watch::channel::<Option<Vec<Answer>>>(None);

        let t1_fut = async {
            let (result, answers) = self.run_tier1_phase(&engine, &batches, &company, tracker).await;
            let _ = t1_tx.send(Some(answers.clone()));
            (result, answers)
        };

        let t2_fut = async {
            let mut rx = t1_rx.clone();
            let t1_answers = loop {
                let current = rx.borrow().clone();
                if let Some(answers) = current {
                    break answers;
                }
                if rx.changed().await.is_err() {
                    break Vec::new();
                }
            };
            self.run_tier2_phase(&engine, &batches, &t1_answers, &questions, &index, tracker)
                .await
        };

        let ((t1_result, t1_answers), (_, t2_answers)) = tokio::join!(t1_fut, t2_fut);
        if t1_result.status == PhaseStatus::Failed {
            return Err(RunError::PhaseFailed {
                phase: "t1_extraction".into(),
                message: t1_result.error.unwrap_or_default(),
            });
        }

        // Phase 6: tier 3, gated by configuration and cumulative cost.
        let merged_t12: Vec<Answer> =
            aggregate::merge_answers(&[&t1_answers, &t2_answers]).into_values().collect();
        let (_, t3_answers) = self
            .run_tier3_phase(&engine, &batches, &merged_t12, &index, tracker)
            .await;

        // ADV pre-fill, queried just before aggregation. Best-effort.
        let adv = match &self.adv_prefill {
            Some(prefill) => match prefill.prefill(&company).await {
                Ok(answers) => answers,
                Err(err) => {
                    tracing::warn!(%err, "structured pre-fill failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        // Phase 7: aggregation. Fatal: no field values means no result.
        let (aggregate_result, field_values) = tracker
            .track_with("aggregate", async {
                let inputs = AggregateInputs {
                    t1: &t1_answers,
                    t2: &t2_answers,
                    t3: &t3_answers,
                    adv_prefill: &adv,
                    existing: &existing,
                    loans: &collected.loans,
                };
                let (values, stats) = aggregate::aggregate(&company, &index, &inputs, &self.registry);
                let result = PhaseResult::complete("")
                    .with_metadata("fields", serde_json::json!(values.len()))
                    .with_metadata("dropped", serde_json::json!(stats.dropped_by_validation))
                    .with_metadata("enrichments", serde_json::json!(stats.enrichments));
                Ok((result, values))
            })
            .await;
        if aggregate_result.status == PhaseStatus::Failed {
            return Err(RunError::PhaseFailed {
                phase: "aggregate".into(),
                message: aggregate_result.error.unwrap_or_default(),
            });
        }

        // Persist answers for reuse by future runs. Advisory.
        let mut all_answers = t1_answers;
        all_answers.extend(t2_answers);
        all_answers.extend(t3_answers);
        if let Err(err) = self.answer_store.record_answers(&company.url, &all_answers) {
            tracing::warn!(%err, "failed to persist answers");
        }

        // Phase 8: report. Non-fatal from here down.
        let (_, report_text) = tracker
            .track_with("report", async {
                let text = format_report(
                    &company,
                    &field_values,
                    &tracker.results(),
                    tracker.cumulative_cost(),
                );
                Ok((PhaseResult::complete(""), text))
            })
            .await;

        // Phase 9: quality gate, then either the immediate downstream
        // write or a deferred write intent for an external batcher.
        let score = quality_score(&field_values, &self.registry);
        let (_, write_intent) = tracker
            .track_with("quality_gate", async {
                let mut result =
                    PhaseResult::complete("").with_metadata("score", serde_json::json!(score));
                let intent = match &self.sink {
                    Some(sink) => {
                        sink.write(&company, &field_values)?;
                        result = result.with_metadata("written", serde_json::json!(true));
                        None
                    }
                    None => {
                        result = result.with_metadata("deferred", serde_json::json!(true));
                        Some(WriteIntent {
                            company_url: company.url.clone(),
                            quality_score: score,
                            field_values: field_values.clone(),
                        })
                    }
                };
                Ok((result, intent))
            })
            .await;

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            company,
            field_values,
            phases: tracker.results(),
            report: report_text,
            quality_score: score,
            total_cost: tracker.cumulative_cost(),
            usage: tracker.total_usage(),
            write_intent,
        })
    }

    /// Tier 1 with checkpoint resume and checkpoint save.
    async fn run_tier1_phase(
        &self,
        engine: &ExtractionEngine<'_>,
        batches: &RoutedBatches,
        company: &Company,
        tracker: &PhaseTracker,
    ) -> (PhaseResult, Vec<Answer>) {
        match self.checkpoints.load(&company.url, T1_CHECKPOINT_PHASE) {
            Ok(Some(payload)) => match serde_json::from_slice::<Vec<Answer>>(&payload) {
                Ok(answers) => {
                    tracing::info!(company = %company.url, answers = answers.len(), "resuming from checkpoint");
                    return tracker
                        .track_with("t1_extraction", async move {
                            let result = PhaseResult::complete("")
                                .with_metadata("from_checkpoint", serde_json::json!(true))
                                .with_metadata("answers", serde_json::json!(answers.len()));
                            Ok((result, answers))
                        })
                        .await;
                }
                Err(err) => tracing::warn!(%err, "ignoring unreadable checkpoint"),
            },
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "checkpoint load failed"),
        }

        if batches.t1.is_empty() {
            return tracker
                .track_with("t1_extraction", async {
                    let result = PhaseResult::skipped("", "no questions")
                        .with_metadata("answers", serde_json::json!(0));
                    Ok((result, Vec::new()))
                })
                .await;
        }

        let (result, answers) = tracker
            .track_with("t1_extraction", async {
                let out = engine.run_tier1(&batches.t1).await?;
                let mut result = PhaseResult::complete("");
                result.usage = out.usage;
                result.metadata = out.metadata;
                Ok((result, out.answers))
            })
            .await;

        if result.status == PhaseStatus::Complete {
            match serde_json::to_vec(&answers) {
                Ok(payload) => {
                    if let Err(err) =
                        self.checkpoints.save(&company.url, T1_CHECKPOINT_PHASE, &payload)
                    {
                        tracing::warn!(%err, "checkpoint save failed");
                    }
                }
                Err(err) => tracing::warn!(%err, "checkpoint serialization failed"),
            }
        }
        (result, answers)
    }

    /// Tier 2: native plus escalated questions, skipped entirely in
    /// sourcing mode.
    async fn run_tier2_phase(
        &self,
        engine: &ExtractionEngine<'_>,
        batches: &RoutedBatches,
        t1_answers: &[Answer],
        questions: &[Question],
        index: &PageIndex,
        tracker: &PhaseTracker,
    ) -> (PhaseResult, Vec<Answer>) {
        if self.config.mode == RunMode::Sourcing {
            return tracker
                .track_with("t2_extraction", async {
                    let result = PhaseResult::skipped("", "sourcing mode")
                        .with_metadata("answers", serde_json::json!(0));
                    Ok((result, Vec::new()))
                })
                .await;
        }
        if batches.t2.is_empty() && t1_answers.is_empty() {
            return tracker
                .track_with("t2_extraction", async {
                    let result = PhaseResult::skipped("", "no questions")
                        .with_metadata("answers", serde_json::json!(0));
                    Ok((result, Vec::new()))
                })
                .await;
        }

        tracker
            .track_with("t2_extraction", async {
                let out = engine
                    .run_tier2(&batches.t2, t1_answers, questions, index)
                    .await?;
                let escalated = out
                    .metadata
                    .get("escalated")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if batches.t2.is_empty() && escalated == 0 {
                    let result = PhaseResult::skipped("", "no questions")
                        .with_metadata("answers", serde_json::json!(0));
                    return Ok((result, Vec::new()));
                }
                let mut result = PhaseResult::complete("");
                result.usage = out.usage;
                result.metadata = out.metadata;
                Ok((result, out.answers))
            })
            .await
    }

    /// Tier 3 gate evaluation and dispatch.
    async fn run_tier3_phase(
        &self,
        engine: &ExtractionEngine<'_>,
        batches: &RoutedBatches,
        merged_so_far: &[Answer],
        index: &PageIndex,
        tracker: &PhaseTracker,
    ) -> (PhaseResult, Vec<Answer>) {
        let skip = |reason: &'static str| async move {
            tracker
                .track_with("t3_extraction", async move {
                    let result = PhaseResult::skipped("", reason)
                        .with_metadata("answers", serde_json::json!(0));
                    Ok((result, Vec::new()))
                })
                .await
        };

        match self.config.effective_tier3_gate() {
            Tier3Gate::Off => return skip("disabled").await,
            Tier3Gate::Always => {}
            Tier3Gate::AmbiguityOnly => {
                let ambiguous = merged_so_far
                    .iter()
                    .any(|a| a.confidence < self.config.thresholds.ambiguity_confidence);
                if !ambiguous {
                    return skip("not needed").await;
                }
            }
        }
        if tracker.cumulative_cost() >= self.config.budgets.max_cost_per_company {
            return skip("cost_budget_exceeded").await;
        }
        if batches.t3.is_empty() {
            return skip("no questions").await;
        }

        tracker
            .track_with("t3_extraction", async {
                let pages = index.all_pages();
                let out = engine.run_tier3(&batches.t3, merged_so_far, &pages).await?;
                let mut result = PhaseResult::complete("");
                result.usage = out.usage;
                result.metadata = out.metadata;
                Ok((result, out.answers))
            })
            .await
    }

    /// Persisted answers eligible for reuse this run.
    fn existing_answers(&self, company: &Company) -> Vec<Answer> {
        if self.config.force_reextract {
            return Vec::new();
        }
        // TTL of zero means no age limit.
        let max_age = match self.config.cache.answer_reuse_ttl_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours * 3600)),
        };
        match self.answer_store.high_confidence_answers(
            &company.url,
            self.config.thresholds.answer_skip_confidence,
            max_age,
        ) {
            Ok(answers) => answers,
            Err(err) => {
                tracing::warn!(%err, "existing-answer lookup failed");
                Vec::new()
            }
        }
    }
}

/// Drop routed questions whose every field key already has a reusable
/// answer.
fn retain_unanswered(batches: &mut RoutedBatches, reused_keys: &HashSet<&str>) {
    if reused_keys.is_empty() {
        return;
    }
    let keep = |rq: &crate::model::RoutedQuestion| {
        rq.question
            .field_key_list()
            .iter()
            .any(|key| !reused_keys.contains(key.as_str()))
    };
    batches.t1.retain(keep);
    batches.t2.retain(keep);
    batches.t3.retain(keep);
}

fn failure_category(err: &RunError) -> &'static str {
    match err {
        RunError::AllSourcesFailed { .. } => "transient",
        RunError::NoPagesCollected => "permanent",
        RunError::PhaseFailed { .. } => "permanent",
        RunError::Other(inner) => {
            if is_transient(inner) {
                "transient"
            } else {
                "permanent"
            }
        }
    }
}

fn failure_phase(err: &RunError) -> String {
    match err {
        RunError::AllSourcesFailed { .. } | RunError::NoPagesCollected => "collect".to_string(),
        RunError::PhaseFailed { phase, .. } => phase.clone(),
        RunError::Other(_) => "run".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_unanswered_drops_fully_covered_questions() {
        use crate::model::{CrawledPage, PageType, RoutedQuestion};

        let rq = |id: &str, keys: &str| RoutedQuestion {
            question: Question {
                id: id.into(),
                text: "q".into(),
                instructions: String::new(),
                tier: 1,
                field_keys: keys.into(),
                page_types: vec![PageType::About],
                priority: 0,
                output_format: None,
            },
            pages: vec![CrawledPage::new("u", "t", "c")],
        };

        let mut batches = RoutedBatches {
            t1: vec![rq("a", "industry"), rq("b", "phone, email")],
            ..Default::default()
        };
        let reused: HashSet<&str> = ["industry", "phone"].into_iter().collect();
        retain_unanswered(&mut batches, &reused);

        // "a" is fully covered; "b" still needs email.
        assert_eq!(batches.t1.len(), 1);
        assert_eq!(batches.t1[0].question.id, "b");
    }

    #[test]
    fn failure_metadata_maps_categories() {
        let err = RunError::AllSourcesFailed { failed: vec![] };
        assert_eq!(failure_category(&err), "transient");
        assert_eq!(failure_phase(&err), "collect");

        let err = RunError::PhaseFailed {
            phase: "classify".into(),
            message: "x".into(),
        };
        assert_eq!(failure_category(&err), "permanent");
        assert_eq!(failure_phase(&err), "classify");
    }
}
