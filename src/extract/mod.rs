//! Tiered extraction engine.
//!
//! Three passes over the routed questions: tier 1 on the cheap model,
//! tier 2 on the mid model (native tier-2 questions plus tier-1
//! escalations, with a low-confidence context block), tier 3 on the deep
//! model (whole-company summary plus all merged findings as context).
//! All three share one dispatch routine; see [`dispatch`].

pub mod dispatch;
pub mod escalate;
pub mod parse;
pub mod prompt;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use escalate::escalation_candidates;

use crate::config::EnrichConfig;
use crate::llm::{CompletionRequest, LlmClient, Message, SystemBlock};
use crate::model::{Answer, CrawledPage, PageIndex, Question, RoutedQuestion, TokenUsage};
use crate::resilience::Envelope;
use anyhow::{Context, Result};
use prompt::build_t2_context;
use std::collections::{HashMap, HashSet};

/// Service label for the breaker registry.
const LLM_SERVICE: &str = "anthropic";

const SUMMARY_MAX_TOKENS: u32 = 1_024;

/// Per-page excerpt length in the summarization prompt.
const SUMMARY_PAGE_CHARS: usize = 1_500;

const SUMMARY_SYSTEM_PROMPT: &str = "You write a dense factual summary of a company from \
pages of its website and third-party profiles. One paragraph, facts only, no commentary.";

/// Answers plus accounting from one tier run.
#[derive(Debug, Default)]
pub struct TierOutcome {
    pub answers: Vec<Answer>,
    pub usage: TokenUsage,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct ExtractionEngine<'a> {
    pub llm: &'a dyn LlmClient,
    pub envelope: &'a Envelope,
    pub config: &'a EnrichConfig,
}

impl ExtractionEngine<'_> {
    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            llm: self.llm,
            envelope: self.envelope,
            config: self.config,
        }
    }

    /// Tier 1: question and pages only, cheap model.
    pub async fn run_tier1(&self, routed: &[RoutedQuestion]) -> Result<TierOutcome> {
        let out = self.dispatcher().execute_batch(routed, 1, None).await?;
        Ok(tier_outcome(out, routed.len()))
    }

    /// Tier 2: natively-routed questions plus tier-1 escalations, both
    /// dispatched concurrently with the shared low-confidence context.
    pub async fn run_tier2(
        &self,
        native: &[RoutedQuestion],
        t1_answers: &[Answer],
        questions: &[Question],
        index: &PageIndex,
    ) -> Result<TierOutcome> {
        let context = build_t2_context(t1_answers, self.config.thresholds.t2_context_confidence);

        let native_ids: HashSet<&str> = native.iter().map(|rq| rq.question.id.as_str()).collect();
        let escalated: Vec<RoutedQuestion> = escalation_candidates(
            t1_answers,
            questions,
            index,
            self.config.thresholds.escalation_confidence,
        )
        .into_iter()
        .filter(|rq| !native_ids.contains(rq.question.id.as_str()))
        .collect();

        let dispatcher = self.dispatcher();
        let (native_out, escalated_out) = tokio::join!(
            dispatcher.execute_batch(native, 2, Some(&context)),
            dispatcher.execute_batch(&escalated, 2, Some(&context)),
        );
        let native_out = native_out.context("tier 2 native dispatch failed")?;
        let escalated_out = escalated_out.context("tier 2 escalated dispatch failed")?;

        let mut outcome = tier_outcome(native_out, native.len());
        outcome
            .metadata
            .insert("escalated".into(), serde_json::json!(escalated.len()));
        outcome.usage.absorb(escalated_out.usage);
        outcome.answers.extend(escalated_out.answers);
        outcome.metadata.insert(
            "answers".into(),
            serde_json::json!(outcome.answers.len()),
        );
        Ok(outcome)
    }

    /// Tier 3: deep model over the routed tier-3 questions, primed with a
    /// whole-company summary and everything learned so far.
    pub async fn run_tier3(
        &self,
        routed: &[RoutedQuestion],
        merged_so_far: &[Answer],
        pages: &[&CrawledPage],
    ) -> Result<TierOutcome> {
        let (summary, summary_usage) = self.summarize_company(pages).await?;
        let context = build_t3_context(&summary, merged_so_far);

        let out = self
            .dispatcher()
            .execute_batch(routed, 3, Some(&context))
            .await?;
        let mut outcome = tier_outcome(out, routed.len());
        outcome.usage.absorb(summary_usage);
        Ok(outcome)
    }

    /// One cheap-model call summarizing every collected page.
    async fn summarize_company(
        &self,
        pages: &[&CrawledPage],
    ) -> Result<(String, TokenUsage)> {
        if pages.is_empty() {
            return Ok((String::new(), TokenUsage::default()));
        }
        let mut body = String::new();
        for page in pages {
            let excerpt: String = page.content.chars().take(SUMMARY_PAGE_CHARS).collect();
            body.push_str(&format!("## {} ({})\n{}\n\n", page.title, page.url, excerpt));
        }
        let request = CompletionRequest {
            model: self.config.models.cheap.clone(),
            max_tokens: SUMMARY_MAX_TOKENS,
            system: vec![SystemBlock::cached(SUMMARY_SYSTEM_PROMPT)],
            messages: vec![Message::user(&body)],
        };

        let response = self
            .envelope
            .call(LLM_SERVICE, || async {
                Ok(self.llm.complete(request.clone()).await?)
            })
            .await
            .context("company summarization failed")?;
        let usage = response.usage.into();
        Ok((response.text(), usage))
    }
}

fn tier_outcome(out: DispatchOutcome, question_count: usize) -> TierOutcome {
    let mut metadata = HashMap::new();
    metadata.insert("questions".into(), serde_json::json!(question_count));
    metadata.insert("answers".into(), serde_json::json!(out.answers.len()));
    metadata.insert("dispatch".into(), serde_json::json!(out.mode));
    TierOutcome {
        answers: out.answers,
        usage: out.usage,
        metadata,
    }
}

/// Context block for tier 3: the summary plus every merged finding.
fn build_t3_context(summary: &str, merged: &[Answer]) -> String {
    let mut out = String::new();
    if !summary.is_empty() {
        out.push_str(&format!("Company summary:\n{summary}\n\n"));
    }
    if merged.is_empty() {
        out.push_str("No findings so far.");
        return out;
    }
    out.push_str("Findings so far:\n");
    let mut lines: Vec<String> = merged
        .iter()
        .map(|a| {
            let value = match &a.value {
                serde_json::Value::Null => "?".to_string(),
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            format!(
                "{}: {} (tier {}, confidence: {:.2})",
                a.field_key, value, a.tier, a.confidence
            )
        })
        .collect();
    lines.sort();
    out.push_str(&lines.join("\n"));
    out
}
