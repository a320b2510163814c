//! Phase tracker: uniform accounting for every pipeline phase.
//!
//! `track` runs one phase future and owns its bookkeeping: the persisted
//! phase record, timing, status assignment, cost attribution from the
//! static phase→model table, and the mutex-guarded append to the run's
//! result list. Persistence failures are logged and swallowed; the
//! in-memory result list is authoritative.

use crate::model::{PhaseResult, PhaseStatus, TokenUsage};
use crate::store::RunStore;
use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// USD per million tokens (input, output) per model tier.
const CHEAP_PRICING: (f64, f64) = (0.80, 4.00);
const MID_PRICING: (f64, f64) = (3.00, 15.00);
const DEEP_PRICING: (f64, f64) = (15.00, 75.00);

/// Cache-write tokens bill at a premium, cache reads at a discount.
const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
const CACHE_READ_MULTIPLIER: f64 = 0.10;

/// Which model a phase bills against. Phases not listed keep whatever
/// cost their function already set.
fn pricing_for_phase(name: &str) -> Option<(f64, f64)> {
    match name {
        "network_lookup" | "classify" | "t1_extraction" => Some(CHEAP_PRICING),
        "t2_extraction" => Some(MID_PRICING),
        "t3_extraction" => Some(DEEP_PRICING),
        _ => None,
    }
}

fn compute_cost(usage: &TokenUsage, pricing: (f64, f64)) -> f64 {
    let (input_price, output_price) = pricing;
    (usage.input_tokens as f64 * input_price
        + usage.cache_creation_tokens as f64 * input_price * CACHE_WRITE_MULTIPLIER
        + usage.cache_read_tokens as f64 * input_price * CACHE_READ_MULTIPLIER
        + usage.output_tokens as f64 * output_price)
        / 1_000_000.0
}

pub struct PhaseTracker {
    store: Arc<dyn RunStore>,
    run_id: String,
    results: Mutex<Vec<PhaseResult>>,
}

impl PhaseTracker {
    pub fn new(store: Arc<dyn RunStore>, run_id: &str) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Run a phase future and account for it. The future supplies a
    /// partially-filled result (usage, metadata, optional skipped
    /// status); the tracker owns name, duration, cost, persistence, and
    /// the append.
    pub async fn track<Fut>(&self, name: &str, fut: Fut) -> PhaseResult
    where
        Fut: Future<Output = Result<PhaseResult>>,
    {
        let (result, ()) = self
            .track_with(name, async { fut.await.map(|r| (r, ())) })
            .await;
        result
    }

    /// Like [`track`], but the phase future also returns a payload for
    /// the caller. On failure the payload is the type's default.
    pub async fn track_with<T, Fut>(&self, name: &str, fut: Fut) -> (PhaseResult, T)
    where
        T: Default,
        Fut: Future<Output = Result<(PhaseResult, T)>>,
    {
        let phase_id = match self.store.create_phase(&self.run_id, name) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(phase = name, %err, "failed to persist phase start");
                None
            }
        };

        let started = Instant::now();
        let (mut result, payload) = match fut.await {
            Ok((result, payload)) => (result, payload),
            Err(err) => {
                tracing::warn!(phase = name, error = %format!("{err:#}"), "phase failed");
                (PhaseResult::failed(name, &format!("{err:#}")), T::default())
            }
        };

        result.name = name.to_string();
        result.duration_ms = started.elapsed().as_millis() as u64;
        if result.cost == 0.0 && !result.usage.is_empty() {
            if let Some(pricing) = pricing_for_phase(name) {
                result.cost = compute_cost(&result.usage, pricing);
            }
        }

        if let Some(id) = phase_id {
            if let Err(err) = self.store.complete_phase(id, &result) {
                tracing::warn!(phase = name, %err, "failed to persist phase completion");
            }
        }

        self.results
            .lock()
            .expect("phase results lock")
            .push(result.clone());
        (result, payload)
    }

    /// Snapshot of all phase results, in completion order.
    pub fn results(&self) -> Vec<PhaseResult> {
        self.results.lock().expect("phase results lock").clone()
    }

    /// Sum of per-phase costs so far.
    pub fn cumulative_cost(&self) -> f64 {
        self.results
            .lock()
            .expect("phase results lock")
            .iter()
            .map(|r| r.cost)
            .sum()
    }

    /// Token usage accumulated across phases.
    pub fn total_usage(&self) -> TokenUsage {
        let results = self.results.lock().expect("phase results lock");
        let mut total = TokenUsage::default();
        for result in results.iter() {
            total.absorb(result.usage);
        }
        total
    }

    /// (name, status) snapshot for failure records.
    pub fn phase_statuses(&self) -> Vec<(String, String)> {
        self.results
            .lock()
            .expect("phase results lock")
            .iter()
            .map(|r| (r.name.clone(), r.status.as_str().to_string()))
            .collect()
    }

    /// Whether any phase failed so far.
    pub fn any_failed(&self) -> bool {
        self.results
            .lock()
            .expect("phase results lock")
            .iter()
            .any(|r| r.status == PhaseStatus::Failed)
    }
}
