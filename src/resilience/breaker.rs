//! Per-service circuit breaker.
//!
//! States: Closed (calls run, consecutive transient failures counted),
//! Open (calls fail fast until the reset timeout), HalfOpen (one probe
//! allowed through). Only transient failures count toward tripping;
//! permanent failures pass through without touching the counter.
//!
//! Breakers live in a process-wide registry so a service outage observed
//! in one run is still known to the next.

use crate::errors::{CircuitOpen, is_transient};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Consecutive transient failures that trip the breaker.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long the breaker stays open before permitting a probe.
const DEFAULT_RESET_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
        }
    }
}

/// Hook invoked on every state transition, for observability.
pub type StateHook = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    hook: Option<StateHook>,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: BreakerConfig) -> Self {
        Self {
            service: service.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: StateHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Run `op` under breaker accounting. Fails fast with [`CircuitOpen`]
    /// while the breaker is open or a half-open probe is already in flight.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let outcome = op().await;
        self.record(&outcome);
        outcome
    }

    /// Gate a call: Ok to proceed, Err(CircuitOpen) to fail fast.
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(anyhow::Error::new(CircuitOpen {
                        service: self.service.clone(),
                    }))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(anyhow::Error::new(CircuitOpen {
                        service: self.service.clone(),
                    }))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record<T>(&self, outcome: &Result<T>) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.probe_in_flight = false;
        match outcome {
            Ok(_) => {
                inner.consecutive_failures = 0;
                if inner.state != BreakerState::Closed {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.opened_at = None;
                }
            }
            Err(err) => {
                if !is_transient(err) {
                    // Permanent failures say nothing about service health.
                    return;
                }
                match inner.state {
                    BreakerState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold {
                            self.transition(&mut inner, BreakerState::Open);
                            inner.opened_at = Some(Instant::now());
                        }
                    }
                    BreakerState::HalfOpen => {
                        self.transition(&mut inner, BreakerState::Open);
                        inner.opened_at = Some(Instant::now());
                    }
                    BreakerState::Open => {}
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        tracing::info!(service = %self.service, from = %inner.state, to = %to, "breaker state change");
        inner.state = to;
        if let Some(hook) = &self.hook {
            hook(&self.service, to);
        }
    }
}

/// Process-wide registry of breakers, one per upstream service name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    hook: Option<StateHook>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: StateHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The breaker for a service, created on first use.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock");
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(service, self.config.clone());
                if let Some(hook) = &self.hook {
                    breaker = breaker.with_hook(hook.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }
}
