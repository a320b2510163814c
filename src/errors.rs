//! Typed error hierarchy for the enrichment pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `RunError` — run-level failures (fan-out policy, fatal phases)
//! - `SourceError` — data-collection failures from a single source
//! - `LlmError` — LLM provider failures (single-message and batch APIs)
//!
//! `is_transient` classifies an error chain for the retry/breaker envelope.

use thiserror::Error;

/// Errors that fail an entire enrichment run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("All phase 1 data sources failed: {}", failed.join(", "))]
    AllSourcesFailed { failed: Vec<String> },

    #[error("No pages collected from any source")]
    NoPagesCollected,

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single data-collection source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Homepage appears bot-gated: {url}")]
    Blocked { url: String },

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(&'static str),

    #[error("No results for {0}")]
    NoResults(String),
}

/// Errors from the LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited (429)")]
    RateLimited,

    #[error("Server error ({status})")]
    Server { status: u16 },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Batch {id} ended as {status}")]
    BatchFailed { id: String, status: String },

    #[error("Batch {id} still running after {seconds}s")]
    BatchTimeout { id: String, seconds: u64 },

    #[error("Empty response from model")]
    EmptyResponse,
}

impl LlmError {
    /// Whether this provider error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited | LlmError::Server { .. } => true,
            LlmError::BatchTimeout { .. } => true,
            LlmError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Fail-fast error produced while a service's circuit breaker is open.
///
/// Permanent for the individual call (retrying inside the envelope would
/// just hit the breaker again), transient for the service as a whole.
#[derive(Debug, Error)]
#[error("Circuit open for service '{service}'")]
pub struct CircuitOpen {
    pub service: String,
}

/// Classify an error chain as transient (retryable) or permanent.
///
/// Walks wrapped causes looking for provider errors, HTTP failures, and
/// connection-level I/O errors. Anything unrecognized is permanent.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if cause.downcast_ref::<CircuitOpen>().is_some() {
            return false;
        }
        if let Some(e) = cause.downcast_ref::<LlmError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            return match e.status() {
                Some(s) => s.as_u16() == 429 || s.is_server_error(),
                None => true,
            };
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
            );
        }
    }
    false
}
