//! In-memory store used by tests and by runs that opt out of persistence.

use super::{AnswerStore, CheckpointStore, PageCache, RunFailure, RunRecord, RunStore};
use crate::model::{Answer, Company, CrawledPage, PhaseResult, RunOutcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    runs: HashMap<String, (String, Option<RunFailure>)>,
    phases: Vec<(i64, String, String, Option<PhaseResult>)>,
    checkpoints: HashMap<(String, String), Vec<u8>>,
    page_cache: HashMap<String, (Vec<CrawledPage>, DateTime<Utc>)>,
    answers: Vec<(String, Answer, DateTime<Utc>)>,
    next_phase_id: i64,
}

/// Hash-map-backed store implementing every persistence capability.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses of all recorded runs (for assertions).
    pub fn run_statuses(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("memory store lock");
        inner.runs.values().map(|(s, _)| s.clone()).collect()
    }

    /// Recorded failure of the given run, when any.
    pub fn run_failure(&self, run_id: &str) -> Option<RunFailure> {
        let inner = self.inner.lock().expect("memory store lock");
        inner.runs.get(run_id).and_then(|(_, f)| f.clone())
    }

    /// Backdate every stored answer (for TTL tests).
    pub fn age_answers(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("memory store lock");
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        for (_, _, created) in inner.answers.iter_mut() {
            *created -= delta;
        }
    }
}

impl RunStore for MemoryStore {
    fn create_run(&self, company: &Company) -> Result<RunRecord> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let id = uuid::Uuid::new_v4().to_string();
        inner.runs.insert(id.clone(), ("running".into(), None));
        Ok(RunRecord {
            id,
            company_url: company.url.clone(),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    fn update_run_status(&self, run_id: &str, status: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.0 = status.to_string();
        }
        Ok(())
    }

    fn create_phase(&self, run_id: &str, name: &str) -> Result<i64> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_phase_id += 1;
        let id = inner.next_phase_id;
        inner
            .phases
            .push((id, run_id.to_string(), name.to_string(), None));
        Ok(id)
    }

    fn complete_phase(&self, phase_id: i64, result: &PhaseResult) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(phase) = inner.phases.iter_mut().find(|(id, ..)| *id == phase_id) {
            phase.3 = Some(result.clone());
        }
        Ok(())
    }

    fn update_run_result(&self, run_id: &str, _outcome: &RunOutcome) -> Result<()> {
        self.update_run_status(run_id, "complete")
    }

    fn fail_run(&self, run_id: &str, failure: &RunFailure) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.0 = "failed".to_string();
            run.1 = Some(failure.clone());
        }
        Ok(())
    }
}

impl CheckpointStore for MemoryStore {
    fn load(&self, company_url: &str, phase: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner
            .checkpoints
            .get(&(company_url.to_string(), phase.to_string()))
            .cloned())
    }

    fn save(&self, company_url: &str, phase: &str, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner
            .checkpoints
            .insert((company_url.to_string(), phase.to_string()), payload.to_vec());
        Ok(())
    }

    fn delete(&self, company_url: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.checkpoints.retain(|(url, _), _| url != company_url);
        Ok(())
    }
}

impl PageCache for MemoryStore {
    fn get(&self, company_url: &str) -> Result<Option<Vec<CrawledPage>>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner.page_cache.get(company_url).and_then(|(pages, expires)| {
            if *expires > Utc::now() {
                Some(pages.clone())
            } else {
                None
            }
        }))
    }

    fn set(&self, company_url: &str, pages: &[CrawledPage], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let expires =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        inner
            .page_cache
            .insert(company_url.to_string(), (pages.to_vec(), expires));
        Ok(())
    }
}

impl AnswerStore for MemoryStore {
    fn high_confidence_answers(
        &self,
        company_url: &str,
        min_confidence: f64,
        max_age: Option<Duration>,
    ) -> Result<Vec<Answer>> {
        let inner = self.inner.lock().expect("memory store lock");
        let cutoff = max_age.map(|age| {
            Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
        });
        let mut seen = std::collections::HashSet::new();
        let mut answers = Vec::new();
        // Newest first
        for (url, answer, created) in inner.answers.iter().rev() {
            if url.as_str() != company_url || answer.confidence < min_confidence {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if *created < cutoff {
                    continue;
                }
            }
            if seen.insert(answer.field_key.clone()) {
                answers.push(answer.clone());
            }
        }
        Ok(answers)
    }

    fn record_answers(&self, company_url: &str, answers: &[Answer]) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let now = Utc::now();
        for answer in answers {
            inner
                .answers
                .push((company_url.to_string(), answer.clone(), now));
        }
        Ok(())
    }
}
