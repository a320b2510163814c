//! Data-collection sources for phase 1.
//!
//! Each source is a capability trait so the orchestrator can be driven by
//! test doubles. Only the site crawler has a concrete implementation in
//! this crate; profile scraping, professional-network lookup, and the
//! loan database are transport integrations supplied by the embedding
//! application.

pub mod crawler;

pub use crawler::HttpCrawler;

use crate::errors::SourceError;
use crate::model::{Company, CrawledPage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Crawls the company's own website.
#[async_trait]
pub trait SiteCrawler: Send + Sync {
    async fn crawl(&self, company: &Company) -> Result<Vec<CrawledPage>, SourceError>;

    /// One-shot homepage probe used for name derivation. Implementations
    /// without a cheap probe can leave the default.
    async fn probe_name(&self, url: &str) -> Result<Option<String>, SourceError> {
        let _ = url;
        Ok(None)
    }
}

/// Scrapes external profile sources (BBB, maps, search-and-scrape
/// discovery). Returned pages carry `[tag]` title prefixes.
#[async_trait]
pub trait ProfileScraper: Send + Sync {
    async fn scrape(&self, company: &Company) -> Result<Vec<CrawledPage>, SourceError>;
}

/// Professional-network company profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub employee_range: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NetworkProfile {
    /// Render the profile as a synthetic markdown page for the index.
    pub fn to_page(&self) -> CrawledPage {
        let mut body = String::new();
        if let Some(headline) = &self.headline {
            body.push_str(&format!("{headline}\n\n"));
        }
        if let Some(industry) = &self.industry {
            body.push_str(&format!("**Industry:** {industry}\n\n"));
        }
        if let Some(range) = &self.employee_range {
            body.push_str(&format!("**Company size:** {range}\n\n"));
        }
        if let Some(description) = &self.description {
            body.push_str(description);
            body.push('\n');
        }
        CrawledPage::new(&self.url, &format!("[linkedin] {}", self.name), &body)
    }
}

/// Looks up a company on the professional network.
#[async_trait]
pub trait NetworkLookup: Send + Sync {
    async fn lookup(
        &self,
        name: &str,
        location: Option<&str>,
    ) -> Result<NetworkProfile, SourceError>;
}

/// A federal-loan record matched to the company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanRecord {
    pub borrower_name: String,
    pub amount: f64,
    #[serde(default)]
    pub jobs_reported: Option<u32>,
    #[serde(default)]
    pub date_approved: Option<String>,
    #[serde(default)]
    pub lender: Option<String>,
}

/// Searches the federal-loan database.
#[async_trait]
pub trait LoanLookup: Send + Sync {
    async fn find_loans(
        &self,
        name: &str,
        state: Option<&str>,
    ) -> Result<Vec<LoanRecord>, SourceError>;
}

/// Optional structured-database pre-fill. Answers returned here overlay
/// model output during aggregation.
#[async_trait]
pub trait StructuredPrefill: Send + Sync {
    async fn prefill(&self, company: &Company) -> Result<Vec<crate::model::Answer>, SourceError>;
}
