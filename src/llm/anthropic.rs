//! HTTP client for the Anthropic Messages and Message Batches APIs.

use super::types::{
    BatchHandle, BatchItem, BatchResultItem, BatchResultKind, BatchStatus, CompletionRequest,
    CompletionResponse,
};
use super::LlmClient;
use crate::errors::LlmError;
use async_trait::async_trait;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Build a client from the `ANTHROPIC_API_KEY` environment variable.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{API_KEY_ENV} is not set"))?;
        Ok(Self::new(&api_key))
    }

    pub fn new(api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different host (test servers).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    /// Map a non-success response to a typed provider error.
    async fn error_for(response: reqwest::Response) -> LlmError {
        let status = response.status();
        match status.as_u16() {
            429 => LlmError::RateLimited,
            s if status.is_server_error() => LlmError::Server { status: s },
            s => {
                let message = response.text().await.unwrap_or_default();
                LlmError::Api { status: s, message }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    processing_status: String,
}

fn parse_batch_status(s: &str) -> BatchStatus {
    match s {
        "in_progress" => BatchStatus::InProgress,
        "ended" => BatchStatus::Ended,
        "canceling" | "canceled" => BatchStatus::Canceled,
        _ => BatchStatus::Failed,
    }
}

#[derive(Debug, Deserialize)]
struct BatchResultLine {
    custom_id: String,
    result: BatchResultBody,
}

#[derive(Debug, Deserialize)]
struct BatchResultBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<CompletionResponse>,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(response.json::<CompletionResponse>().await?)
    }

    async fn create_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, LlmError> {
        let body = serde_json::json!({ "requests": items });
        let response = self
            .request(reqwest::Method::POST, "/v1/messages/batches")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let batch: BatchResponse = response.json().await?;
        Ok(BatchHandle {
            status: parse_batch_status(&batch.processing_status),
            id: batch.id,
        })
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, LlmError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/messages/batches/{batch_id}"),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let batch: BatchResponse = response.json().await?;
        Ok(parse_batch_status(&batch.processing_status))
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, LlmError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/messages/batches/{batch_id}/results"),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        // Results arrive as JSONL; unparseable lines are treated as absent
        // items, which downstream already tolerates.
        let body = response.text().await?;
        let mut items = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: BatchResultLine = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(batch_id, %err, "skipping unparseable batch result line");
                    continue;
                }
            };
            let kind = if parsed.result.kind == "succeeded" {
                BatchResultKind::Succeeded
            } else {
                BatchResultKind::Errored
            };
            items.push(BatchResultItem {
                custom_id: parsed.custom_id,
                kind,
                response: parsed.result.message,
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_strings_map_to_enum() {
        assert_eq!(parse_batch_status("in_progress"), BatchStatus::InProgress);
        assert_eq!(parse_batch_status("ended"), BatchStatus::Ended);
        assert_eq!(parse_batch_status("canceling"), BatchStatus::Canceled);
        assert_eq!(parse_batch_status("errored"), BatchStatus::Failed);
    }

    #[test]
    fn batch_result_line_parses_succeeded_message() {
        let line = r#"{"custom_id":"q1","result":{"type":"succeeded","message":{"id":"msg_1","content":[{"type":"text","text":"{\"value\":\"HVAC\"}"}],"usage":{"input_tokens":10,"output_tokens":5}}}}"#;
        let parsed: BatchResultLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.custom_id, "q1");
        assert_eq!(parsed.result.kind, "succeeded");
        assert_eq!(parsed.result.message.unwrap().text(), "{\"value\":\"HVAC\"}");
    }

    #[test]
    fn batch_result_line_tolerates_errored_without_message() {
        let line = r#"{"custom_id":"q2","result":{"type":"errored"}}"#;
        let parsed: BatchResultLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.result.kind, "errored");
        assert!(parsed.result.message.is_none());
    }

    #[test]
    fn from_env_requires_key() {
        // Only assert the error path; the success path would leak env state
        // across tests.
        if std::env::var(API_KEY_ENV).is_err() {
            assert!(AnthropicClient::from_env().is_err());
        }
    }
}
