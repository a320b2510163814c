//! Request dispatch shared by the three extraction tiers.
//!
//! Small workloads (or `no_batch` runs) go out as direct requests under a
//! bounded worker pool. Larger workloads issue one primer request to warm
//! the provider's prompt-prefix cache, then ship the remainder through
//! the batch API. Items missing from a batch result stream produce no
//! answers; the aggregator's defaults cover the gap.

use super::parse::parse_answers;
use super::prompt::{build_user_content, max_tokens_for, EXTRACT_SYSTEM_PROMPT};
use crate::config::EnrichConfig;
use crate::llm::{
    poll_batch, BatchItem, BatchResultKind, CompletionRequest, LlmClient, Message, SystemBlock,
};
use crate::model::{Answer, RoutedQuestion, TokenUsage};
use crate::resilience::Envelope;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Service label for the breaker registry.
const LLM_SERVICE: &str = "anthropic";

/// Deadline for extraction batch polling.
const BATCH_POLL_DEADLINE_SECS: u64 = 1_800;

pub struct Dispatcher<'a> {
    pub llm: &'a dyn LlmClient,
    pub envelope: &'a Envelope,
    pub config: &'a EnrichConfig,
}

/// Answers and accounting from one tier dispatch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub answers: Vec<Answer>,
    pub usage: TokenUsage,
    /// "direct", "primer+batch", or "none".
    pub mode: &'static str,
}

impl Dispatcher<'_> {
    /// Run every routed question at the given tier and collect answers.
    pub async fn execute_batch(
        &self,
        routed: &[RoutedQuestion],
        tier: u8,
        context: Option<&str>,
    ) -> Result<DispatchOutcome> {
        if routed.is_empty() {
            return Ok(DispatchOutcome {
                mode: "none",
                ..Default::default()
            });
        }

        let direct = self.config.no_batch || routed.len() <= self.config.thresholds.small_batch;
        if direct {
            self.execute_direct(routed, tier, context).await
        } else {
            self.execute_primed_batch(routed, tier, context).await
        }
    }

    /// One direct request per item, bounded by the concurrency limit,
    /// each wrapped in the resilience envelope. A failed item simply
    /// contributes no answers.
    async fn execute_direct(
        &self,
        routed: &[RoutedQuestion],
        tier: u8,
        context: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let source = tier_source(tier);
        let semaphore = Arc::new(Semaphore::new(self.config.budgets.max_concurrent_requests));

        let futures = routed.iter().map(|rq| {
            let request = self.request_for(rq, tier, context);
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = self
                    .envelope
                    .call(LLM_SERVICE, || async {
                        Ok(self.llm.complete(request.clone()).await?)
                    })
                    .await;
                (rq, result)
            }
        });

        let mut outcome = DispatchOutcome {
            mode: "direct",
            ..Default::default()
        };
        for (rq, result) in futures::future::join_all(futures).await {
            match result {
                Ok(response) => {
                    outcome.usage.absorb(response.usage.into());
                    outcome
                        .answers
                        .extend(parse_answers(&rq.question, &response.text(), tier, source));
                }
                Err(err) => {
                    tracing::warn!(question = %rq.question.id, tier, %err, "extraction request failed");
                }
            }
        }
        Ok(outcome)
    }

    /// Primer request for the first item, batch for the rest.
    async fn execute_primed_batch(
        &self,
        routed: &[RoutedQuestion],
        tier: u8,
        context: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let source = tier_source(tier);
        let mut outcome = DispatchOutcome {
            mode: "primer+batch",
            ..Default::default()
        };

        // The primer carries the full shared system prompt, so its cache
        // entry covers every batch item that follows.
        let primer = &routed[0];
        let primer_request = self.request_for(primer, tier, context);
        match self
            .envelope
            .call(LLM_SERVICE, || async {
                Ok(self.llm.complete(primer_request.clone()).await?)
            })
            .await
        {
            Ok(response) => {
                outcome.usage.absorb(response.usage.into());
                outcome
                    .answers
                    .extend(parse_answers(&primer.question, &response.text(), tier, source));
            }
            Err(err) => {
                tracing::warn!(question = %primer.question.id, tier, %err, "primer request failed");
            }
        }

        let rest = &routed[1..];
        let items: Vec<BatchItem> = rest
            .iter()
            .map(|rq| BatchItem {
                custom_id: rq.question.id.clone(),
                params: self.request_for(rq, tier, context),
            })
            .collect();

        let handle = self
            .envelope
            .call(LLM_SERVICE, || {
                let items = items.clone();
                async move { Ok(self.llm.create_batch(items).await?) }
            })
            .await
            .context("batch submission failed")?;

        poll_batch(
            self.llm,
            &handle.id,
            Duration::from_secs(BATCH_POLL_DEADLINE_SECS),
        )
        .await
        .with_context(|| format!("tier {tier} batch did not complete"))?;

        let by_id: HashMap<&str, &RoutedQuestion> =
            rest.iter().map(|rq| (rq.question.id.as_str(), rq)).collect();

        for item in self.llm.batch_results(&handle.id).await? {
            let Some(rq) = by_id.get(item.custom_id.as_str()) else {
                continue;
            };
            if item.kind != BatchResultKind::Succeeded {
                tracing::warn!(question = %item.custom_id, tier, "batch item errored");
                continue;
            }
            let Some(response) = item.response else {
                continue;
            };
            outcome.usage.absorb(response.usage.into());
            outcome
                .answers
                .extend(parse_answers(&rq.question, &response.text(), tier, source));
        }
        Ok(outcome)
    }

    /// Build the request for one item. The system prefix is shared across
    /// the whole tier and the trailing block carries the cache marker.
    fn request_for(
        &self,
        routed: &RoutedQuestion,
        tier: u8,
        context: Option<&str>,
    ) -> CompletionRequest {
        let system = match context {
            Some(ctx) => vec![
                SystemBlock::text(EXTRACT_SYSTEM_PROMPT),
                SystemBlock::cached(ctx),
            ],
            None => vec![SystemBlock::cached(EXTRACT_SYSTEM_PROMPT)],
        };
        let user = build_user_content(
            routed,
            self.config.budgets.char_budget_for_tier(tier),
            self.config.budgets.snippet_char_budget,
        );
        CompletionRequest {
            model: self.config.models.for_tier(tier).to_string(),
            max_tokens: max_tokens_for(&routed.question, tier),
            system,
            messages: vec![Message::user(&user)],
        }
    }
}

fn tier_source(tier: u8) -> &'static str {
    match tier {
        1 => "t1",
        2 => "t2",
        _ => "t3",
    }
}
