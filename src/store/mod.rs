//! Persistence interfaces and implementations.
//!
//! Four narrow capabilities: run/phase observability records, tier-1
//! checkpoints, the crawled-page cache, and the cross-run answer store.
//! All of them are advisory; every caller logs persistence failures and
//! keeps going. [`SqliteStore`] backs all four with one database file,
//! [`MemoryStore`] backs them with hash maps for tests.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{Answer, Company, CrawledPage, PhaseResult, RunOutcome};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A created run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub company_url: String,
    pub created_at: String,
}

/// Structured failure attached to a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    /// "transient" or "permanent".
    pub category: String,
    pub phase: String,
    pub message: String,
    /// Snapshot of (phase name, status) at failure time.
    pub phase_statuses: Vec<(String, String)>,
}

/// Run and phase observability records.
pub trait RunStore: Send + Sync {
    fn create_run(&self, company: &Company) -> Result<RunRecord>;
    fn update_run_status(&self, run_id: &str, status: &str) -> Result<()>;
    fn create_phase(&self, run_id: &str, name: &str) -> Result<i64>;
    fn complete_phase(&self, phase_id: i64, result: &PhaseResult) -> Result<()>;
    fn update_run_result(&self, run_id: &str, outcome: &RunOutcome) -> Result<()>;
    fn fail_run(&self, run_id: &str, failure: &RunFailure) -> Result<()>;
}

/// Opaque checkpoint payloads keyed by company URL and phase name.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, company_url: &str, phase: &str) -> Result<Option<Vec<u8>>>;
    fn save(&self, company_url: &str, phase: &str, payload: &[u8]) -> Result<()>;
    fn delete(&self, company_url: &str) -> Result<()>;
}

/// Crawled-page cache keyed by company URL, with expiry.
pub trait PageCache: Send + Sync {
    fn get(&self, company_url: &str) -> Result<Option<Vec<CrawledPage>>>;
    fn set(&self, company_url: &str, pages: &[CrawledPage], ttl: Duration) -> Result<()>;
}

/// Answers persisted across runs.
pub trait AnswerStore: Send + Sync {
    /// Answers for this company at or above the confidence floor and,
    /// when `max_age` is set, younger than it.
    fn high_confidence_answers(
        &self,
        company_url: &str,
        min_confidence: f64,
        max_age: Option<Duration>,
    ) -> Result<Vec<Answer>>;

    fn record_answers(&self, company_url: &str, answers: &[Answer]) -> Result<()>;
}
