//! LLM provider interface: single-message and batch APIs.
//!
//! The orchestrator consumes the [`LlmClient`] capability trait; the
//! concrete [`AnthropicClient`] talks to the provider over HTTP. Tests
//! inject scripted implementations.

pub mod anthropic;
pub mod types;

pub use anthropic::AnthropicClient;
pub use types::{
    ApiUsage, BatchHandle, BatchItem, BatchResultItem, BatchResultKind, BatchStatus, CacheControl,
    CompletionRequest, CompletionResponse, ContentBlock, Message, SystemBlock,
};

use crate::errors::LlmError;
use async_trait::async_trait;
use std::time::Duration;

/// Initial batch poll interval.
const POLL_INITIAL_SECS: u64 = 2;

/// Poll interval ceiling.
const POLL_MAX_SECS: u64 = 30;

/// Poll interval growth factor.
const POLL_GROWTH: f64 = 1.5;

/// Capability interface over the LLM provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single-message completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Submit a batch of requests.
    async fn create_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, LlmError>;

    /// Current processing status of a batch.
    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, LlmError>;

    /// Stream the results of an ended batch. Missing items mean the
    /// corresponding requests produced nothing.
    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, LlmError>;
}

/// Poll a batch until it reaches a terminal state, with a growing interval
/// under an overall deadline.
pub async fn poll_batch(
    client: &dyn LlmClient,
    batch_id: &str,
    deadline: Duration,
) -> Result<BatchStatus, LlmError> {
    let started = tokio::time::Instant::now();
    let mut interval = Duration::from_secs(POLL_INITIAL_SECS);

    loop {
        let status = client.batch_status(batch_id).await?;
        match status {
            BatchStatus::Ended => return Ok(status),
            BatchStatus::Canceled | BatchStatus::Failed => {
                return Err(LlmError::BatchFailed {
                    id: batch_id.to_string(),
                    status: status.as_str().to_string(),
                });
            }
            BatchStatus::InProgress => {}
        }

        if started.elapsed() + interval > deadline {
            return Err(LlmError::BatchTimeout {
                id: batch_id.to_string(),
                seconds: deadline.as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
        interval = Duration::from_secs_f64(
            (interval.as_secs_f64() * POLL_GROWTH).min(POLL_MAX_SECS as f64),
        );
    }
}
