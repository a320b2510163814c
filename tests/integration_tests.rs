//! Integration tests for the enrichment pipeline.
//!
//! Full runs against a scripted mock LLM and in-memory stores, covering
//! the fan-out policy, checkpoint resume, answer reuse, and tier-3
//! gating. A handful of CLI smoke tests at the end.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use prospect::config::{EnrichConfig, RunMode, Tier3Gate};
use prospect::errors::{LlmError, RunError, SourceError};
use prospect::llm::{
    ApiUsage, BatchHandle, BatchItem, BatchResultItem, BatchResultKind, BatchStatus,
    CompletionRequest, CompletionResponse, ContentBlock, LlmClient,
};
use prospect::model::{Answer, Company, CrawledPage, FieldValue, PhaseStatus};
use prospect::pipeline::{Pipeline, RecordSink, SourceSet};
use prospect::questions::default_questions;
use prospect::registry::FieldRegistry;
use prospect::resilience::{BreakerConfig, BreakerRegistry, Envelope, RetryPolicy};
use prospect::sources::{NetworkLookup, NetworkProfile, ProfileScraper, SiteCrawler};
use prospect::store::{AnswerStore, CheckpointStore, MemoryStore};

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Mock LLM: extraction responses are looked up by the question's
/// declared field keys; everything else gets a low-confidence null.
struct MockLlm {
    by_field_keys: HashMap<String, String>,
    complete_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batches: Mutex<HashMap<String, Vec<BatchItem>>>,
}

impl MockLlm {
    fn new(responses: &[(&str, &str)]) -> Self {
        Self {
            by_field_keys: responses
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            complete_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// The canned answer set used by most tests: confident values for
    /// every default question.
    fn standard() -> Self {
        Self::new(&[
            (
                "industry, naics_code",
                r#"{"industry": "Plumbing", "naics_code": "238220", "confidence": 0.9}"#,
            ),
            (
                "description",
                r#"{"value": "Acme fixes residential and commercial plumbing.", "confidence": 0.85}"#,
            ),
            ("employee_count", r#"{"value": 40, "confidence": 0.9}"#),
            ("year_founded", r#"{"value": 1987, "confidence": 0.8}"#),
            (
                "phone, email",
                r#"{"phone": "(918) 555-0142", "email": "info@acme.com", "confidence": 0.85}"#,
            ),
            (
                "address_city, address_state, address_zip",
                r#"{"address_city": "Tulsa", "address_state": "OK", "address_zip": "74101", "confidence": 0.8}"#,
            ),
            (
                "services",
                r#"{"value": "drain cleaning, repiping, water heaters", "confidence": 0.8}"#,
            ),
            (
                "owner_name, is_family_owned",
                r#"{"owner_name": "Pat Acme", "is_family_owned": true, "confidence": 0.8}"#,
            ),
            (
                "business_model, customer_segments",
                r#"{"business_model": "B2C", "customer_segments": "homeowners", "confidence": 0.75}"#,
            ),
            ("is_franchise", r#"{"value": false, "confidence": 0.7}"#),
            ("location_count", r#"{"value": 2, "confidence": 0.7}"#),
            ("revenue_estimate", r#"{"value": 4500000, "confidence": 0.7}"#),
        ])
    }

    fn response_for(&self, request: &CompletionRequest) -> CompletionResponse {
        let user = &request.messages[0].content;
        let body = self
            .by_field_keys
            .iter()
            .find(|(keys, _)| user.contains(&format!("Fields to extract: {keys}")))
            .map(|(_, body)| body.clone())
            .unwrap_or_else(|| r#"{"value": null, "confidence": 0.1}"#.to_string());
        CompletionResponse {
            id: "msg".into(),
            content: vec![ContentBlock {
                kind: "text".into(),
                text: body,
            }],
            usage: ApiUsage {
                input_tokens: 1000,
                output_tokens: 50,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response_for(&request))
    }

    async fn create_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, LlmError> {
        let n = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("batch_{n}");
        self.batches.lock().unwrap().insert(id.clone(), items);
        Ok(BatchHandle {
            id,
            status: BatchStatus::InProgress,
        })
    }

    async fn batch_status(&self, _batch_id: &str) -> Result<BatchStatus, LlmError> {
        Ok(BatchStatus::Ended)
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, LlmError> {
        let batches = self.batches.lock().unwrap();
        let items = batches.get(batch_id).cloned().unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| BatchResultItem {
                custom_id: item.custom_id.clone(),
                kind: BatchResultKind::Succeeded,
                response: Some(self.response_for(&item.params)),
            })
            .collect())
    }
}

struct StaticCrawler {
    pages: Vec<CrawledPage>,
}

#[async_trait]
impl SiteCrawler for StaticCrawler {
    async fn crawl(&self, _company: &Company) -> Result<Vec<CrawledPage>, SourceError> {
        Ok(self.pages.clone())
    }

    async fn probe_name(&self, _url: &str) -> Result<Option<String>, SourceError> {
        Ok(Some("Acme Plumbing".into()))
    }
}

struct FailingCrawler;

#[async_trait]
impl SiteCrawler for FailingCrawler {
    async fn crawl(&self, company: &Company) -> Result<Vec<CrawledPage>, SourceError> {
        Err(SourceError::Blocked {
            url: company.url.clone(),
        })
    }
}

struct FailingScraper;

#[async_trait]
impl ProfileScraper for FailingScraper {
    async fn scrape(&self, _company: &Company) -> Result<Vec<CrawledPage>, SourceError> {
        Err(SourceError::NoResults("no profiles".into()))
    }
}

struct FailingNetwork;

#[async_trait]
impl NetworkLookup for FailingNetwork {
    async fn lookup(
        &self,
        name: &str,
        _location: Option<&str>,
    ) -> Result<NetworkProfile, SourceError> {
        Err(SourceError::NoResults(name.to_string()))
    }
}

struct FailingLoans;

#[async_trait]
impl prospect::sources::LoanLookup for FailingLoans {
    async fn find_loans(
        &self,
        _name: &str,
        _state: Option<&str>,
    ) -> Result<Vec<prospect::sources::LoanRecord>, SourceError> {
        Err(SourceError::NoResults("loan database unavailable".into()))
    }
}

struct StaticNetwork;

#[async_trait]
impl NetworkLookup for StaticNetwork {
    async fn lookup(
        &self,
        name: &str,
        _location: Option<&str>,
    ) -> Result<NetworkProfile, SourceError> {
        Ok(NetworkProfile {
            name: name.to_string(),
            url: "https://linkedin.com/company/acme-plumbing".into(),
            headline: Some("Plumbing done right since 1987".into()),
            employee_range: Some("11-50 employees".into()),
            industry: Some("Consumer Services".into()),
            description: None,
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Deterministically-classifiable site pages, so classification never
/// needs the LLM.
fn site_pages() -> Vec<CrawledPage> {
    vec![
        CrawledPage::new(
            "https://acme.com/",
            "Acme Plumbing",
            "Tulsa's trusted plumbers. Call (918) 555-0142.",
        ),
        CrawledPage::new(
            "https://acme.com/about",
            "About Us",
            "Family-owned since 1987. A team of 40 plumbers.",
        ),
        CrawledPage::new(
            "https://acme.com/contact",
            "Contact",
            "Two locations in Tulsa, OK 74101.",
        ),
        CrawledPage::new(
            "https://acme.com/services",
            "Services",
            "Drain cleaning, repiping, water heater installation.",
        ),
    ]
}

struct Harness {
    pipeline: Pipeline,
    store: Arc<MemoryStore>,
    llm: Arc<MockLlm>,
}

fn harness(config: EnrichConfig, llm: MockLlm, sources: SourceSet) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(llm);
    let pipeline = Pipeline {
        config: Arc::new(config),
        registry: Arc::new(FieldRegistry::default()),
        questions: default_questions(),
        llm: llm.clone(),
        envelope: Envelope::new(
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        ),
        sources,
        adv_prefill: None,
        run_store: store.clone(),
        checkpoints: store.clone(),
        page_cache: store.clone(),
        answer_store: store.clone(),
        sink: None,
    };
    Harness {
        pipeline,
        store,
        llm,
    }
}

fn full_sources() -> SourceSet {
    SourceSet {
        crawler: Some(Arc::new(StaticCrawler { pages: site_pages() })),
        network: Some(Arc::new(StaticNetwork)),
        ..Default::default()
    }
}

fn company() -> Company {
    let mut company = Company::new("https://acme.com");
    company.name = Some("Acme Plumbing".into());
    company.city = Some("Tulsa".into());
    company.state = Some("OK".into());
    company
}

// =============================================================================
// Full-run scenarios
// =============================================================================

#[tokio::test]
async fn full_run_produces_validated_field_values() {
    let h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());
    let outcome = h.pipeline.run(company()).await.unwrap();

    // Core extracted fields survived validation.
    assert_eq!(
        outcome.field_values["industry"].value,
        serde_json::json!("Plumbing")
    );
    assert_eq!(
        outcome.field_values["employee_count"].value,
        serde_json::json!(40)
    );
    assert_eq!(
        outcome.field_values["phone"].value,
        serde_json::json!("(918) 555-0142")
    );
    assert_eq!(
        outcome.field_values["naics_code"].value,
        serde_json::json!("238220")
    );

    // One value per field key, by construction of the map; report and
    // score exist.
    assert!(outcome.quality_score > 0.0);
    assert!(outcome.report.contains("industry"));
    assert!(outcome.usage.input_tokens > 0);
    assert!(h.llm.complete_calls.load(Ordering::SeqCst) > 0);
    assert!(h.llm.batch_calls.load(Ordering::SeqCst) > 0);

    // T3 default gate is ambiguity_only and everything is confident.
    let t3 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t3_extraction")
        .unwrap();
    assert_eq!(t3.status, PhaseStatus::Skipped);
    assert_eq!(t3.metadata["reason"], serde_json::json!("not needed"));

    // Run record completed and the checkpoint was cleaned up.
    assert_eq!(h.store.run_statuses(), vec!["complete".to_string()]);
    assert!(h
        .store
        .load("https://acme.com", "t1_complete")
        .unwrap()
        .is_none());

    // No sink configured, so the record write was deferred.
    let intent = outcome.write_intent.as_ref().unwrap();
    assert_eq!(intent.company_url, "https://acme.com");
    assert_eq!(intent.quality_score, outcome.quality_score);
    assert_eq!(intent.field_values.len(), outcome.field_values.len());
}

/// Sink that records every write it receives.
#[derive(Default)]
struct RecordingSink {
    writes: Mutex<Vec<(String, usize)>>,
}

impl RecordSink for RecordingSink {
    fn write(
        &self,
        company: &Company,
        values: &std::collections::HashMap<String, FieldValue>,
    ) -> anyhow::Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((company.url.clone(), values.len()));
        Ok(())
    }
}

#[tokio::test]
async fn configured_sink_receives_the_immediate_write() {
    let sink = Arc::new(RecordingSink::default());
    let mut h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());
    h.pipeline.sink = Some(sink.clone());

    let outcome = h.pipeline.run(company()).await.unwrap();

    // Written immediately: no intent left behind.
    assert!(outcome.write_intent.is_none());
    let writes = sink.writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "https://acme.com");
    assert_eq!(writes[0].1, outcome.field_values.len());

    let gate = outcome
        .phases
        .iter()
        .find(|p| p.name == "quality_gate")
        .unwrap();
    assert_eq!(gate.metadata["written"], serde_json::json!(true));
}

#[tokio::test]
async fn name_derivation_runs_when_name_is_missing() {
    let h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());
    let outcome = h.pipeline.run(Company::new("https://acme.com")).await.unwrap();

    assert_eq!(outcome.company.name.as_deref(), Some("Acme Plumbing"));
    let derive = outcome.phases.iter().find(|p| p.name == "derive_name").unwrap();
    assert_eq!(derive.status, PhaseStatus::Complete);
}

#[tokio::test]
async fn crawl_only_run_succeeds_with_three_failed_sources() {
    let sources = SourceSet {
        crawler: Some(Arc::new(StaticCrawler { pages: site_pages() })),
        profiles: Some(Arc::new(FailingScraper)),
        network: Some(Arc::new(FailingNetwork)),
        loans: Some(Arc::new(FailingLoans)),
        ..Default::default()
    };
    let h = harness(EnrichConfig::default(), MockLlm::standard(), sources);
    let outcome = h.pipeline.run(company()).await.unwrap();

    assert!(!outcome.field_values.is_empty());
    let failed: Vec<&str> = outcome
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Failed)
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.contains(&"profile_scrape"));
    assert!(failed.contains(&"network_lookup"));
    assert!(failed.contains(&"loan_lookup"));
}

#[tokio::test]
async fn all_sources_failing_fails_the_run() {
    let sources = SourceSet {
        crawler: Some(Arc::new(FailingCrawler)),
        profiles: Some(Arc::new(FailingScraper)),
        network: Some(Arc::new(FailingNetwork)),
        ..Default::default()
    };
    let h = harness(EnrichConfig::default(), MockLlm::standard(), sources);

    let err = h.pipeline.run(company()).await.unwrap_err();
    assert!(matches!(err, RunError::AllSourcesFailed { .. }));
    assert_eq!(h.store.run_statuses(), vec!["failed".to_string()]);

    // The failure record carries per-phase statuses.
    let runs = h.store.run_statuses();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn checkpoint_resume_skips_t1_extraction() {
    let h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());

    let saved = vec![Answer {
        question_id: "industry".into(),
        field_key: "industry".into(),
        value: serde_json::json!("Checkpointed Industry"),
        confidence: 0.95,
        tier: 1,
        source: "t1".into(),
        source_url: None,
        reasoning: None,
        data_as_of: None,
    }];
    h.store
        .save(
            "https://acme.com",
            "t1_complete",
            &serde_json::to_vec(&saved).unwrap(),
        )
        .unwrap();

    let outcome = h.pipeline.run(company()).await.unwrap();

    let t1 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t1_extraction")
        .unwrap();
    assert_eq!(t1.metadata["from_checkpoint"], serde_json::json!(true));
    assert_eq!(t1.metadata["answers"], serde_json::json!(1));
    assert_eq!(
        outcome.field_values["industry"].value,
        serde_json::json!("Checkpointed Industry")
    );
}

#[tokio::test]
async fn answer_reuse_skips_covered_questions() {
    let h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());

    // Persist confident answers for every key the description and
    // employee-count questions cover.
    h.store
        .record_answers(
            "https://acme.com",
            &[
                Answer {
                    question_id: "description".into(),
                    field_key: "description".into(),
                    value: serde_json::json!("Reused description."),
                    confidence: 0.92,
                    tier: 1,
                    source: "t1".into(),
                    source_url: None,
                    reasoning: None,
                    data_as_of: None,
                },
                Answer {
                    question_id: "employee_count".into(),
                    field_key: "employee_count".into(),
                    value: serde_json::json!(37),
                    confidence: 0.9,
                    tier: 1,
                    source: "t1".into(),
                    source_url: None,
                    reasoning: None,
                    data_as_of: None,
                },
            ],
        )
        .unwrap();

    let outcome = h.pipeline.run(company()).await.unwrap();

    let route = outcome.phases.iter().find(|p| p.name == "route").unwrap();
    assert_eq!(route.metadata["reused_answers"], serde_json::json!(2));

    // Reused values survive into the final record.
    assert_eq!(
        outcome.field_values["employee_count"].value,
        serde_json::json!(37)
    );
    assert_eq!(
        outcome.field_values["description"].value,
        serde_json::json!("Reused description.")
    );
}

#[tokio::test]
async fn force_reextract_ignores_persisted_answers() {
    let mut config = EnrichConfig::default();
    config.force_reextract = true;
    let h = harness(config, MockLlm::standard(), full_sources());

    h.store
        .record_answers(
            "https://acme.com",
            &[Answer {
                question_id: "employee_count".into(),
                field_key: "employee_count".into(),
                value: serde_json::json!(999),
                confidence: 0.99,
                tier: 1,
                source: "t1".into(),
                source_url: None,
                reasoning: None,
                data_as_of: None,
            }],
        )
        .unwrap();

    let outcome = h.pipeline.run(company()).await.unwrap();
    assert_eq!(
        outcome.field_values["employee_count"].value,
        serde_json::json!(40)
    );
}

#[tokio::test]
async fn tier3_runs_under_always_gate() {
    let mut config = EnrichConfig::default();
    config.tier3.gate = Tier3Gate::Always;
    let h = harness(config, MockLlm::standard(), full_sources());

    let outcome = h.pipeline.run(company()).await.unwrap();
    let t3 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t3_extraction")
        .unwrap();
    assert_eq!(t3.status, PhaseStatus::Complete);
    assert_eq!(
        outcome.field_values["revenue_estimate"].value,
        serde_json::json!(4_500_000.0)
    );
}

#[tokio::test]
async fn tier3_skips_when_cost_budget_is_exhausted() {
    let mut config = EnrichConfig::default();
    config.tier3.gate = Tier3Gate::Always;
    config.budgets.max_cost_per_company = 0.0;
    let h = harness(config, MockLlm::standard(), full_sources());

    let outcome = h.pipeline.run(company()).await.unwrap();
    let t3 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t3_extraction")
        .unwrap();
    assert_eq!(t3.status, PhaseStatus::Skipped);
    assert_eq!(
        t3.metadata["reason"],
        serde_json::json!("cost_budget_exceeded")
    );
}

#[tokio::test]
async fn sourcing_mode_runs_tier1_only() {
    let mut config = EnrichConfig::default();
    config.mode = RunMode::Sourcing;
    config.tier3.gate = Tier3Gate::Always;
    let h = harness(config, MockLlm::standard(), full_sources());

    let outcome = h.pipeline.run(company()).await.unwrap();

    let t2 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t2_extraction")
        .unwrap();
    assert_eq!(t2.status, PhaseStatus::Skipped);
    assert_eq!(t2.metadata["reason"], serde_json::json!("sourcing mode"));

    let t3 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t3_extraction")
        .unwrap();
    assert_eq!(t3.status, PhaseStatus::Skipped);
    assert_eq!(t3.metadata["reason"], serde_json::json!("disabled"));

    // Only priority <= 1 questions ran, all at tier 1.
    assert!(outcome.field_values.contains_key("industry"));
    assert!(!outcome.field_values.contains_key("is_franchise"));
}

#[tokio::test]
async fn page_cache_hit_short_circuits_second_run() {
    let h = harness(EnrichConfig::default(), MockLlm::standard(), full_sources());

    h.pipeline.run(company()).await.unwrap();
    let outcome = h.pipeline.run(company()).await.unwrap();

    let crawl = outcome
        .phases
        .iter()
        .find(|p| p.name == "crawl_site")
        .unwrap();
    assert_eq!(crawl.metadata["from_cache"], serde_json::json!(true));
}

#[tokio::test]
async fn escalation_reruns_weak_tier1_questions() {
    // Year-founded comes back weak; it should be retried at tier 2.
    let mut llm = MockLlm::standard();
    llm.by_field_keys.insert(
        "year_founded".into(),
        r#"{"value": null, "confidence": 0.2}"#.into(),
    );
    let h = harness(EnrichConfig::default(), llm, full_sources());

    let outcome = h.pipeline.run(company()).await.unwrap();
    let t2 = outcome
        .phases
        .iter()
        .find(|p| p.name == "t2_extraction")
        .unwrap();
    assert_eq!(t2.status, PhaseStatus::Complete);
    assert_eq!(t2.metadata["escalated"], serde_json::json!(1));
}

// =============================================================================
// CLI smoke tests
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use assert_cmd::cargo::cargo_bin_cmd;
    use predicates::prelude::*;

    fn prospect() -> Command {
        cargo_bin_cmd!("prospect")
    }

    #[test]
    fn help_lists_subcommands() {
        prospect()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("enrich"))
            .stdout(predicate::str::contains("questions"));
    }

    #[test]
    fn questions_command_lists_default_set() {
        prospect()
            .arg("questions")
            .assert()
            .success()
            .stdout(predicate::str::contains("industry"))
            .stdout(predicate::str::contains("tier 1"));
    }

    #[test]
    fn enrich_without_api_key_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        prospect()
            .env_remove("ANTHROPIC_API_KEY")
            .env("PROSPECT_DB", dir.path().join("prospect.db"))
            .args(["enrich", "https://example.com"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn invalid_mode_is_rejected() {
        prospect()
            .args(["enrich", "https://example.com", "--mode", "turbo"])
            .assert()
            .failure();
    }
}
