//! Two-stage page classifier.
//!
//! Stage one is deterministic: an external-source `[tag]` title prefix,
//! then a static URL-path table. Whatever remains is deduplicated by
//! content fingerprint and sent to the cheap model, one direct request
//! per page up to the small-batch threshold, a single polled batch above
//! it. Every page lands in the index exactly once; anything the model
//! cannot name becomes `Other`.

use crate::config::EnrichConfig;
use crate::extract::parse::extract_json_object;
use crate::llm::{
    poll_batch, BatchItem, BatchResultKind, CompletionRequest, LlmClient, Message, SystemBlock,
};
use crate::model::{CrawledPage, PageIndex, PageType, TokenUsage};
use crate::resilience::Envelope;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Service label for the breaker registry.
const LLM_SERVICE: &str = "anthropic";

const CLASSIFY_MAX_TOKENS: u32 = 128;

/// How much page text the classifier prompt includes.
const PAGE_EXCERPT_CHARS: usize = 2_000;

/// Deadline for classifier batch polling.
const BATCH_POLL_DEADLINE_SECS: u64 = 900;

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify a single web page from a company website \
into exactly one category. Categories: homepage, about, services, products, contact, careers, \
team, faq, blog, news, testimonials, investors, legal, pricing, other. Respond with JSON only: \
{\"page_type\": \"<category>\", \"confidence\": <0.0-1.0>}";

/// Result of classifying one run's collected pages.
#[derive(Debug)]
pub struct ClassifyOutcome {
    pub index: PageIndex,
    pub usage: TokenUsage,
    /// Pages typed without the LLM.
    pub deterministic: usize,
    /// Pages typed by the LLM (including `Other` fallbacks).
    pub llm_classified: usize,
}

pub struct Classifier<'a> {
    pub llm: &'a dyn LlmClient,
    pub envelope: &'a Envelope,
    pub config: &'a EnrichConfig,
}

impl Classifier<'_> {
    pub async fn classify(
        &self,
        pages: Vec<CrawledPage>,
        company_url: &str,
    ) -> Result<ClassifyOutcome> {
        let mut assigned: Vec<Option<PageType>> = vec![None; pages.len()];
        let mut deterministic = 0;

        for (i, page) in pages.iter().enumerate() {
            if let Some(page_type) = classify_deterministic(page, company_url) {
                assigned[i] = Some(page_type);
                deterministic += 1;
            }
        }

        // Deduplicate the leftovers by content fingerprint; one LLM call
        // per distinct body, shared across duplicates.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        let mut representatives: Vec<usize> = Vec::new();
        for (i, page) in pages.iter().enumerate() {
            if assigned[i].is_some() {
                continue;
            }
            let entry = groups.entry(page.fingerprint()).or_default();
            if entry.is_empty() {
                representatives.push(i);
            }
            entry.push(i);
        }

        let mut usage = TokenUsage::default();
        let llm_classified = pages.len() - deterministic;

        if !representatives.is_empty() {
            let typed = if representatives.len() <= self.config.thresholds.small_batch {
                self.classify_direct(&pages, &representatives, &mut usage)
                    .await?
            } else {
                self.classify_batched(&pages, &representatives, &mut usage)
                    .await?
            };
            for (rep, page_type) in representatives.iter().zip(typed) {
                for &i in &groups[&pages[*rep].fingerprint()] {
                    assigned[i] = Some(page_type);
                }
            }
        }

        let mut index = PageIndex::default();
        for (page, page_type) in pages.into_iter().zip(assigned) {
            index.insert(page_type.unwrap_or(PageType::Other), page);
        }

        Ok(ClassifyOutcome {
            index,
            usage,
            deterministic,
            llm_classified,
        })
    }

    /// One direct request per representative, concurrently.
    async fn classify_direct(
        &self,
        pages: &[CrawledPage],
        representatives: &[usize],
        usage: &mut TokenUsage,
    ) -> Result<Vec<PageType>> {
        let futures = representatives.iter().map(|&i| {
            let request = self.request_for(&pages[i]);
            async move {
                self.envelope
                    .call(LLM_SERVICE, || async {
                        Ok(self.llm.complete(request.clone()).await?)
                    })
                    .await
            }
        });

        let responses = futures::future::join_all(futures).await;
        let mut typed = Vec::with_capacity(representatives.len());
        for response in responses {
            match response {
                Ok(resp) => {
                    usage.absorb(resp.usage.into());
                    typed.push(parse_classification(&resp.text()));
                }
                Err(err) => {
                    tracing::warn!(%err, "page classification request failed");
                    typed.push(PageType::Other);
                }
            }
        }
        Ok(typed)
    }

    /// One batch over all representatives, polled to completion. Missing
    /// results default to `Other`.
    async fn classify_batched(
        &self,
        pages: &[CrawledPage],
        representatives: &[usize],
        usage: &mut TokenUsage,
    ) -> Result<Vec<PageType>> {
        let items: Vec<BatchItem> = representatives
            .iter()
            .map(|&i| BatchItem {
                custom_id: format!("page-{i}"),
                params: self.request_for(&pages[i]),
            })
            .collect();

        let handle = self
            .envelope
            .call(LLM_SERVICE, || {
                let items = items.clone();
                async move { Ok(self.llm.create_batch(items).await?) }
            })
            .await
            .context("classifier batch submission failed")?;

        poll_batch(
            self.llm,
            &handle.id,
            Duration::from_secs(BATCH_POLL_DEADLINE_SECS),
        )
        .await
        .context("classifier batch did not complete")?;

        let mut by_id: HashMap<String, PageType> = HashMap::new();
        for item in self.llm.batch_results(&handle.id).await? {
            if item.kind == BatchResultKind::Succeeded {
                if let Some(response) = item.response {
                    usage.absorb(response.usage.into());
                    by_id.insert(item.custom_id, parse_classification(&response.text()));
                }
            }
        }

        Ok(representatives
            .iter()
            .map(|&i| {
                by_id
                    .get(&format!("page-{i}"))
                    .copied()
                    .unwrap_or(PageType::Other)
            })
            .collect())
    }

    fn request_for(&self, page: &CrawledPage) -> CompletionRequest {
        let excerpt: String = page.content.chars().take(PAGE_EXCERPT_CHARS).collect();
        let user = format!(
            "URL: {}\nTitle: {}\n\nPage text:\n{}",
            page.url, page.title, excerpt
        );
        CompletionRequest {
            model: self.config.models.cheap.clone(),
            max_tokens: CLASSIFY_MAX_TOKENS,
            system: vec![SystemBlock::cached(CLASSIFY_SYSTEM_PROMPT)],
            messages: vec![Message::user(&user)],
        }
    }
}

/// Stage-one classification: `[tag]` title prefix, then the URL path table.
pub fn classify_deterministic(page: &CrawledPage, company_url: &str) -> Option<PageType> {
    if let Some(tag) = page.title_tag() {
        if let Some(page_type) = PageType::from_tag(&tag) {
            return Some(page_type);
        }
    }

    let segment = path_first_segment(&page.url)?;
    if segment.is_empty() {
        return Some(PageType::Homepage);
    }
    let by_path = match segment.as_str() {
        "about" | "about-us" | "aboutus" | "company" | "who-we-are" | "our-story" => {
            Some(PageType::About)
        }
        "services" | "service" | "what-we-do" => Some(PageType::Services),
        "products" | "shop" | "store" => Some(PageType::Products),
        "contact" | "contact-us" | "locations" => Some(PageType::Contact),
        "careers" | "jobs" => Some(PageType::Careers),
        "team" | "our-team" | "people" | "staff" | "leadership" => Some(PageType::Team),
        "faq" | "faqs" => Some(PageType::Faq),
        "blog" => Some(PageType::Blog),
        "news" | "press" => Some(PageType::News),
        "testimonials" | "reviews" => Some(PageType::Testimonials),
        "investors" => Some(PageType::Investors),
        "legal" | "privacy" | "terms" => Some(PageType::Legal),
        "pricing" | "plans" | "rates" => Some(PageType::Pricing),
        _ => None,
    };
    // The root URL is the homepage even when the company URL carries a path.
    if by_path.is_none() && page.url.trim_end_matches('/') == company_url.trim_end_matches('/') {
        return Some(PageType::Homepage);
    }
    by_path
}

/// First path segment of a URL, lowercased, ignoring query and fragment.
/// Empty string means the root.
fn path_first_segment(url: &str) -> Option<String> {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let path = match stripped.find('/') {
        Some(i) => &stripped[i + 1..],
        None => "",
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    Some(
        path.split('/')
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .to_lowercase(),
    )
}

#[derive(Debug, Deserialize)]
struct Classification {
    page_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: f64,
}

/// Parse the model's classification JSON; anything unparseable is `Other`.
pub fn parse_classification(text: &str) -> PageType {
    let Some(json) = extract_json_object(text) else {
        return PageType::Other;
    };
    match serde_json::from_str::<Classification>(&json) {
        Ok(c) => PageType::parse_label(&c.page_type),
        Err(_) => PageType::Other,
    }
}
