//! Retry and circuit-breaker envelope for upstream calls.
//!
//! Every external call goes through `Envelope::call`, which composes the
//! two primitives as `breaker.execute(retry.run(op))`: the retry loop
//! absorbs transient blips, the breaker fails fast once a service is
//! persistently unhealthy. Each upstream service name gets an independent
//! breaker from the shared registry.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

/// The composed retry + breaker wrapper.
#[derive(Clone)]
pub struct Envelope {
    retry: RetryPolicy,
    registry: Arc<BreakerRegistry>,
}

impl Envelope {
    pub fn new(retry: RetryPolicy, registry: Arc<BreakerRegistry>) -> Self {
        Self { retry, registry }
    }

    /// Run `op` under the named service's breaker, retrying transient
    /// failures inside the breaker's accounting.
    pub async fn call<T, F, Fut>(&self, service: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.registry.get(service);
        let retry = self.retry.clone();
        breaker.execute(|| retry.run(&op)).await
    }
}
