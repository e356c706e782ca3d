use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use scriptcraft_types::{EvaluationResult, Grade};

use crate::client::{ChatClient, ChatRequest, ChatResponse};
use crate::error::ClientError;

/// A `ChatClient` that replays canned replies in order and remembers the prompts
/// it was sent. Runs out → `ClientError::InvalidResponse`.
///
/// # Example
/// ```ignore
/// let client = Arc::new(ScriptedClient::new([r#"{"total_score": 85}"#]));
/// let evaluator = ScriptEvaluator::builder()
///     .client(client)
///     .dimensions([Dimension::Dialogue])
///     .build()?;
/// let result = evaluator.evaluate(&script).await;
/// assert_grade_at_least(&result, Grade::A)?;
/// ```
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback_error: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            fallback_error: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with a network error carrying `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback_error: Some(message.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure after the replies given so far.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(message.into()));
        }
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }

        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match (next, self.fallback_error.as_deref()) {
            (Some(Ok(content)), _) => Ok(ChatResponse { content, usage: None }),
            (Some(Err(message)), _) => Err(ClientError::Network { message }),
            (None, Some(message)) => Err(ClientError::Network {
                message: message.to_string(),
            }),
            (None, None) => Err(ClientError::InvalidResponse {
                message: "scripted client has no replies left".to_string(),
            }),
        }
    }
}

/// Fails unless the overall grade is `min` or better.
pub fn assert_grade_at_least(result: &EvaluationResult, min: Grade) -> Result<()> {
    if result.overall.grade > min {
        anyhow::bail!(
            "Evaluation of '{}' graded {} ({:.2}), below {}\n{}",
            result.script_name,
            result.overall.grade,
            result.overall.total_score,
            min,
            result.summary_table()
        );
    }
    Ok(())
}

/// Fails unless the overall score is at least `min_score`.
pub fn assert_overall_at_least(result: &EvaluationResult, min_score: f64) -> Result<()> {
    if result.overall.total_score < min_score {
        anyhow::bail!(
            "Evaluation of '{}' scored {:.2}, below threshold {:.2}\n{}",
            result.script_name,
            result.overall.total_score,
            min_score,
            result.summary_table()
        );
    }
    Ok(())
}

/// Fails if any dimension could not be scored.
pub fn assert_no_failed_dimensions(result: &EvaluationResult) -> Result<()> {
    let failed: Vec<String> = result
        .failed_dimensions()
        .map(|d| format!("{}: {}", d.dimension, d.error.as_deref().unwrap_or_default()))
        .collect();
    if !failed.is_empty() {
        anyhow::bail!(
            "Evaluation of '{}' has {} failed dimension(s):\n{}",
            result.script_name,
            failed.len(),
            failed.join("\n")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_then_fails() {
        let client = ScriptedClient::new(["one"]).then_fail("HTTP 502");
        let request = ChatRequest::new("prompt");

        assert_eq!(client.chat(&request).await.unwrap().content, "one");
        assert!(matches!(client.chat(&request).await, Err(ClientError::Network { .. })));
        assert!(matches!(client.chat(&request).await, Err(ClientError::InvalidResponse { .. })));
        assert_eq!(client.prompts().len(), 3);
    }

    #[tokio::test]
    async fn failing_client_errors_on_every_call() {
        let client = ScriptedClient::failing("HTTP 503: busy");
        let request = ChatRequest::new("prompt");

        for _ in 0..2 {
            match client.chat(&request).await {
                Err(ClientError::Network { message }) => assert_eq!(message, "HTTP 503: busy"),
                other => panic!("unexpected reply {:?}", other.map(|r| r.content)),
            }
        }
    }
}
