use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record of a single chat-completion call made while scoring a dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Model or endpoint id the request was sent to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Request payload as sent (messages, sampling parameters)
    pub request: Value,

    /// Message content returned by the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// HTTP attempts spent, retries included
    #[serde(default = "one")]
    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Trace {
    pub fn start_now() -> TraceBuilder {
        TraceBuilder {
            start: Utc::now(),
            model: None,
            attempts: 1,
        }
    }
}

pub struct TraceBuilder {
    start: DateTime<Utc>,
    model: Option<String>,
    attempts: u32,
}

impl TraceBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn finish(self, request: Value, response: String, usage: Option<TokenUsage>) -> Trace {
        self.build(request, Some(response), usage, None)
    }

    pub fn finish_with_error(self, request: Value, error: impl Into<String>) -> Trace {
        self.build(request, None, None, Some(error.into()))
    }

    fn build(
        self,
        request: Value,
        response: Option<String>,
        usage: Option<TokenUsage>,
        error: Option<String>,
    ) -> Trace {
        let end = Utc::now();
        let duration_ms = (end - self.start).num_milliseconds().try_into().ok();

        Trace {
            start: self.start,
            end,
            duration_ms,
            model: self.model,
            request,
            response,
            usage,
            attempts: self.attempts,
            error,
        }
    }
}
