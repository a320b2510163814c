//! Phase 1: parallel data-source fan-out.
//!
//! Four sub-phases run concurrently under the shared run context: the
//! site crawl, the external-profile scrape, the professional-network
//! lookup, and the federal-loan lookup. Each records its own phase
//! result; a failure never cancels its siblings. The fan-out policy
//! decides afterward: zero successful data producers fails the run,
//! anything else continues with partial data.

use super::tracker::PhaseTracker;
use crate::config::EnrichConfig;
use crate::errors::{RunError, SourceError};
use crate::model::{Company, CrawledPage, PhaseResult, PhaseStatus};
use crate::sources::{LoanRecord, LoanLookup, NetworkLookup, ProfileScraper, SiteCrawler};
use crate::store::PageCache;
use std::sync::Arc;
use std::time::Duration;

/// The configured data sources. Absent sources skip their sub-phase.
#[derive(Default, Clone)]
pub struct SourceSet {
    pub crawler: Option<Arc<dyn SiteCrawler>>,
    /// Tried when the primary crawler reports a bot-gated homepage.
    pub fallback_crawler: Option<Arc<dyn SiteCrawler>>,
    pub profiles: Option<Arc<dyn ProfileScraper>>,
    pub network: Option<Arc<dyn NetworkLookup>>,
    pub loans: Option<Arc<dyn LoanLookup>>,
}

/// Everything phase 1 produced.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub pages: Vec<CrawledPage>,
    pub loans: Vec<LoanRecord>,
}

/// Run the fan-out and apply the partial-failure policy.
pub async fn collect_sources(
    company: &Company,
    sources: &SourceSet,
    cache: &dyn PageCache,
    tracker: &PhaseTracker,
    config: &EnrichConfig,
) -> Result<CollectOutcome, RunError> {
    let crawl_task = tracker.track_with("crawl_site", crawl_site(company, sources, cache, config));
    let profile_task = tracker.track_with("profile_scrape", profile_scrape(company, sources));
    let network_task = tracker.track_with("network_lookup", network_lookup(company, sources));
    let loan_task = tracker.track_with("loan_lookup", loan_lookup(company, sources));

    let (
        (crawl_result, crawl_pages),
        (profile_result, profile_pages),
        (network_result, network_pages),
        (_loan_result, loans),
    ) = tokio::join!(crawl_task, profile_task, network_task, loan_task);

    // Loans enrich the record but do not feed the page index, so the
    // data-producer count covers only the first three.
    let producers = [&crawl_result, &profile_result, &network_result];
    let succeeded = producers
        .iter()
        .filter(|r| r.status == PhaseStatus::Complete)
        .count();
    if succeeded == 0 {
        let failed = producers.iter().map(|r| r.name.clone()).collect();
        return Err(RunError::AllSourcesFailed { failed });
    }

    let mut pages = crawl_pages;
    pages.extend(profile_pages);
    pages.extend(network_pages);
    if pages.is_empty() {
        return Err(RunError::NoPagesCollected);
    }

    Ok(CollectOutcome { pages, loans })
}

/// Sub-phase 1A: crawl the company site, consulting the page cache first
/// and branching to the fallback crawler on a bot-gated homepage.
async fn crawl_site(
    company: &Company,
    sources: &SourceSet,
    cache: &dyn PageCache,
    config: &EnrichConfig,
) -> anyhow::Result<(PhaseResult, Vec<CrawledPage>)> {
    let Some(crawler) = &sources.crawler else {
        return Ok((
            PhaseResult::skipped("", "no crawler configured"),
            Vec::new(),
        ));
    };

    match cache.get(&company.url) {
        Ok(Some(pages)) => {
            tracing::info!(company = %company.url, pages = pages.len(), "page cache hit");
            let result = PhaseResult::complete("")
                .with_metadata("from_cache", serde_json::json!(true))
                .with_metadata("pages", serde_json::json!(pages.len()));
            return Ok((result, pages));
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "page cache read failed"),
    }

    let pages = match crawler.crawl(company).await {
        Ok(pages) => pages,
        Err(SourceError::Blocked { url }) => {
            let Some(fallback) = &sources.fallback_crawler else {
                return Err(SourceError::Blocked { url }.into());
            };
            tracing::info!(company = %company.url, "homepage bot-gated, using fallback crawler");
            fallback.crawl(company).await?
        }
        Err(err) => return Err(err.into()),
    };

    let ttl = Duration::from_secs(config.cache.page_ttl_hours * 3600);
    if let Err(err) = cache.set(&company.url, &pages, ttl) {
        tracing::warn!(%err, "page cache write failed");
    }

    let result = PhaseResult::complete("").with_metadata("pages", serde_json::json!(pages.len()));
    Ok((result, pages))
}

/// Sub-phase 1B: external-profile scrape. Needs a company name.
async fn profile_scrape(
    company: &Company,
    sources: &SourceSet,
) -> anyhow::Result<(PhaseResult, Vec<CrawledPage>)> {
    let Some(scraper) = &sources.profiles else {
        return Ok((
            PhaseResult::skipped("", "no profile scraper configured"),
            Vec::new(),
        ));
    };
    if company.name.is_none() {
        return Ok((
            PhaseResult::skipped("", "missing company name"),
            Vec::new(),
        ));
    }

    let pages = scraper.scrape(company).await?;
    let result = PhaseResult::complete("").with_metadata("pages", serde_json::json!(pages.len()));
    Ok((result, pages))
}

/// Sub-phase 1C: professional-network lookup, synthesized into a tagged
/// markdown page.
async fn network_lookup(
    company: &Company,
    sources: &SourceSet,
) -> anyhow::Result<(PhaseResult, Vec<CrawledPage>)> {
    let Some(network) = &sources.network else {
        return Ok((
            PhaseResult::skipped("", "no network lookup configured"),
            Vec::new(),
        ));
    };
    let Some(name) = company.name.as_deref() else {
        return Ok((
            PhaseResult::skipped("", "missing company name"),
            Vec::new(),
        ));
    };

    let location = company.location_string();
    let profile = network.lookup(name, location.as_deref()).await?;
    let page = profile.to_page();
    let result = PhaseResult::complete("").with_metadata("profile_url", serde_json::json!(profile.url));
    Ok((result, vec![page]))
}

/// Sub-phase 1D: federal-loan lookup. Supplementary; produces records,
/// not pages.
async fn loan_lookup(
    company: &Company,
    sources: &SourceSet,
) -> anyhow::Result<(PhaseResult, Vec<LoanRecord>)> {
    let Some(loans) = &sources.loans else {
        return Ok((
            PhaseResult::skipped("", "no loan lookup configured"),
            Vec::new(),
        ));
    };
    let Some(name) = company.name.as_deref() else {
        return Ok((
            PhaseResult::skipped("", "missing company name"),
            Vec::new(),
        ));
    };

    let records = loans.find_loans(name, company.state.as_deref()).await?;
    let result =
        PhaseResult::complete("").with_metadata("matches", serde_json::json!(records.len()));
    Ok((result, records))
}
