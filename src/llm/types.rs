//! Wire types for the LLM provider's single-message and batch APIs.

use crate::model::TokenUsage;
use serde::{Deserialize, Serialize};

/// Cache control marker for prompt-prefix caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    /// Currently only "ephemeral" is supported.
    #[serde(rename = "type")]
    pub cache_type: String,
    /// TTL hint - "5m" or "1h".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl CacheControl {
    /// Five-minute ephemeral cache entry.
    pub fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral".to_string(),
            ttl: Some("5m".to_string()),
        }
    }
}

/// One block of the system prompt. The trailing block carries the
/// cache-control marker so the provider can share the prefix across
/// requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(text: &str) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.to_string(),
            cache_control: None,
        }
    }

    pub fn cached(text: &str) -> Self {
        Self {
            cache_control: Some(CacheControl::ephemeral()),
            ..Self::text(text)
        }
    }
}

/// A single conversation message. The extraction engine only ever sends
/// plain text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

/// Request body for the single-message API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
}

/// One content block of a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// Response from the single-message API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: ApiUsage,
}

impl CompletionResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Token usage as reported on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl From<ApiUsage> for TokenUsage {
    fn from(u: ApiUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_creation_tokens: u.cache_creation_input_tokens,
            cache_read_tokens: u.cache_read_input_tokens,
        }
    }
}

/// One request inside a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub custom_id: String,
    pub params: CompletionRequest,
}

/// Batch identity plus the status observed at creation.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    pub id: String,
    pub status: BatchStatus,
}

/// Terminal and non-terminal batch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Ended,
    Canceled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Ended => "ended",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

/// Whether a batch item succeeded or errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchResultKind {
    Succeeded,
    Errored,
}

/// One streamed batch result. Items can be missing from the stream
/// entirely (partial batch failure); callers must tolerate that.
#[derive(Debug, Clone)]
pub struct BatchResultItem {
    pub custom_id: String,
    pub kind: BatchResultKind,
    pub response: Option<CompletionResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_control_serializes_with_ttl() {
        let cc = CacheControl::ephemeral();
        let json = serde_json::to_value(&cc).unwrap();
        assert_eq!(json["type"], "ephemeral");
        assert_eq!(json["ttl"], "5m");
    }

    #[test]
    fn system_block_cached_carries_marker() {
        let block = SystemBlock::cached("You extract fields.");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["cache_control"]["type"], "ephemeral");

        let plain = SystemBlock::text("plain");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("cache_control").is_none());
    }

    #[test]
    fn response_text_joins_text_blocks_only() {
        let resp = CompletionResponse {
            id: "msg_1".into(),
            content: vec![
                ContentBlock {
                    kind: "text".into(),
                    text: "{\"value\":".into(),
                },
                ContentBlock {
                    kind: "thinking".into(),
                    text: "hmm".into(),
                },
                ContentBlock {
                    kind: "text".into(),
                    text: " 42}".into(),
                },
            ],
            usage: ApiUsage::default(),
        };
        assert_eq!(resp.text(), "{\"value\": 42}");
    }

    #[test]
    fn api_usage_converts_to_token_usage() {
        let usage: TokenUsage = ApiUsage {
            input_tokens: 1000,
            output_tokens: 50,
            cache_creation_input_tokens: 800,
            cache_read_input_tokens: 0,
        }
        .into();
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.cache_creation_tokens, 800);
    }

    #[test]
    fn batch_status_terminality() {
        assert!(!BatchStatus::InProgress.is_terminal());
        assert!(BatchStatus::Ended.is_terminal());
        assert!(BatchStatus::Canceled.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
    }

    #[test]
    fn batch_status_round_trips_serde() {
        let s: BatchStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(s, BatchStatus::InProgress);
        assert_eq!(serde_json::to_string(&BatchStatus::Ended).unwrap(), "\"ended\"");
    }
}
