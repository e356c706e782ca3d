use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::parse;
use crate::trace::{record_trace, TokenUsage, Trace};

const USER_AGENT_VALUE: &str = concat!("scriptcraft/", env!("CARGO_PKG_VERSION"));
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
	pub system: Option<String>,
	pub prompt: String,
	/// Ask the endpoint for a JSON object (`response_format: json_object`)
	pub json_mode: bool,
}

impl ChatRequest {
	pub fn new(prompt: impl Into<String>) -> Self {
		Self {
			prompt: prompt.into(),
			..Self::default()
		}
	}

	pub fn system(mut self, system: impl Into<String>) -> Self {
		self.system = Some(system.into());
		self
	}

	pub fn json(mut self) -> Self {
		self.json_mode = true;
		self
	}
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
	pub content: String,
	pub usage: Option<TokenUsage>,
}

/// A chat-completions backend. `ArkClient` talks HTTP; tests use
/// `testing::ScriptedClient`.
#[async_trait]
pub trait ChatClient: Send + Sync {
	fn model(&self) -> &str;
	async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError>;
}

/// Model output parsed as a JSON object, with the text it came from.
#[derive(Debug, Clone)]
pub struct JsonReply {
	pub object: Map<String, Value>,
	pub raw: String,
}

/// Send `request` in JSON mode and parse the reply into an object.
pub async fn chat_json(client: &dyn ChatClient, request: ChatRequest) -> Result<JsonReply> {
	let response = client.chat(&request.json()).await?;
	debug!(preview = %preview(&response.content, 500), "model response");
	let object = parse::extract_object(&response.content)?;
	Ok(JsonReply {
		object,
		raw: response.content,
	})
}

/// Client for OpenAI-compatible `/chat/completions` endpoints (Volcengine Ark by default).
#[derive(Debug, Clone)]
pub struct ArkClient {
	http: reqwest::Client,
	endpoint: String,
	api_key: String,
	model: String,
	config: ClientConfig,
}

impl ArkClient {
	pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
		let api_key = config
			.api_key
			.clone()
			.filter(|k| !k.trim().is_empty())
			.ok_or(ClientError::MissingApiKey)?;
		let model = config
			.model
			.clone()
			.filter(|m| !m.trim().is_empty())
			.ok_or(ClientError::MissingModel)?;

		let mut default_headers = HeaderMap::new();
		default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.timeout_secs))
			.default_headers(default_headers)
			.build()
			.map_err(|e| ClientError::Network {
				message: format!("failed to create HTTP client: {}", e),
			})?;

		let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

		Ok(Self {
			http,
			endpoint,
			api_key,
			model,
			config,
		})
	}

	pub fn from_env() -> Result<Self, ClientError> {
		Self::new(ClientConfig::from_env())
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	fn payload(&self, request: &ChatRequest) -> Value {
		let mut messages = Vec::with_capacity(2);
		if let Some(system) = &request.system {
			messages.push(json!({ "role": "system", "content": system }));
		}
		messages.push(json!({ "role": "user", "content": request.prompt }));

		let mut payload = json!({
			"model": self.model,
			"messages": messages,
			"max_tokens": self.config.max_tokens,
			"temperature": self.config.temperature,
		});
		if request.json_mode {
			payload["response_format"] = json!({ "type": "json_object" });
		}
		payload
	}

	/// What a trace keeps of the request: parameters and sizes, not the script text.
	fn trace_request(&self, request: &ChatRequest) -> Value {
		json!({
			"endpoint": self.endpoint,
			"max_tokens": self.config.max_tokens,
			"temperature": self.config.temperature,
			"json_mode": request.json_mode,
			"system_chars": request.system.as_deref().map(|s| s.chars().count()).unwrap_or(0),
			"prompt_chars": request.prompt.chars().count(),
		})
	}

	/// Sends with retries. Returns the outcome and the number of attempts made.
	async fn send(&self, payload: &Value) -> (Result<ChatResponse, ClientError>, u32) {
		let max_attempts = self.config.max_retries.max(1);
		let mut attempt = 0u32;

		loop {
			attempt += 1;
			info!(attempt, max_attempts, timeout_secs = self.config.timeout_secs, "sending chat request");

			match self.send_once(payload).await {
				Ok(response) => {
					info!(attempt, "chat request succeeded");
					return (Ok(response), attempt);
				}
				Err(e) if e.is_retryable() && attempt < max_attempts => {
					let backoff = self.backoff(attempt - 1);
					warn!(
						error = %e,
						attempt,
						max_attempts,
						backoff_ms = backoff.as_millis() as u64,
						"chat request failed, retrying"
					);
					tokio::time::sleep(backoff).await;
				}
				Err(e) => {
					warn!(error = %e, attempt, "chat request failed");
					return (Err(e), attempt);
				}
			}
		}
	}

	fn backoff(&self, retry_index: u32) -> Duration {
		let ms = self
			.config
			.retry_backoff_ms
			.saturating_mul(1u64 << retry_index.min(16));
		Duration::from_millis(ms).min(MAX_BACKOFF)
	}

	async fn send_once(&self, payload: &Value) -> Result<ChatResponse, ClientError> {
		let timeout_secs = self.config.timeout_secs;
		let response = self
			.http
			.post(&self.endpoint)
			.bearer_auth(&self.api_key)
			.json(payload)
			.send()
			.await
			.map_err(|e| ClientError::from_reqwest(e, timeout_secs))?;

		let status = response.status();
		if !status.is_success() {
			let body = response
				.text()
				.await
				.unwrap_or_else(|_| status.to_string());
			return Err(ClientError::Http {
				status: status.as_u16(),
				body,
			});
		}

		let body: Value = response
			.json()
			.await
			.map_err(|e| ClientError::from_reqwest(e, timeout_secs))?;
		parse_completion(&body)
	}
}

#[async_trait]
impl ChatClient for ArkClient {
	fn model(&self) -> &str {
		&self.model
	}

	async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
		let payload = self.payload(request);
		let trace = Trace::start_now().model(self.model.clone());

		let (result, attempts) = self.send(&payload).await;

		let trace = trace.attempts(attempts);
		let trace_request = self.trace_request(request);
		match &result {
			Ok(response) => record_trace(trace.finish(trace_request, response.content.clone(), response.usage)),
			Err(err) => record_trace(trace.finish_with_error(trace_request, err.to_string())),
		}
		result
	}
}

fn parse_completion(body: &Value) -> Result<ChatResponse, ClientError> {
	let content = body
		.pointer("/choices/0/message/content")
		.and_then(Value::as_str)
		.ok_or_else(|| ClientError::InvalidResponse {
			message: format!("missing choices[0].message.content in {}", preview(&body.to_string(), 200)),
		})?
		.to_string();

	let usage = body.get("usage").and_then(|u| {
		let field = |name: &str| u.get(name).and_then(Value::as_u64).map(|n| n as u32);
		let input_tokens = field("prompt_tokens")?;
		let output_tokens = field("completion_tokens").unwrap_or(0);
		Some(TokenUsage {
			input_tokens,
			output_tokens,
			total_tokens: field("total_tokens").unwrap_or(input_tokens + output_tokens),
		})
	});

	Ok(ChatResponse { content, usage })
}

fn preview(s: &str, max_chars: usize) -> String {
	s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::trace::collect_traces;
	use wiremock::matchers::{body_partial_json, header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn config_for(server: &MockServer) -> ClientConfig {
		ClientConfig {
			api_key: Some("test-key".to_string()),
			base_url: format!("{}/api/v3/", server.uri()),
			model: Some("ep-test".to_string()),
			timeout_secs: 5,
			retry_backoff_ms: 1,
			..ClientConfig::default()
		}
	}

	fn completion(content: &str) -> Value {
		json!({
			"choices": [{ "message": { "role": "assistant", "content": content } }],
			"usage": { "prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20 }
		})
	}

	#[test]
	fn missing_key_or_model_is_rejected() {
		let no_key = ClientConfig {
			model: Some("ep".into()),
			..ClientConfig::default()
		};
		assert!(matches!(ArkClient::new(no_key), Err(ClientError::MissingApiKey)));

		let no_model = ClientConfig {
			api_key: Some("k".into()),
			..ClientConfig::default()
		};
		assert!(matches!(ArkClient::new(no_model), Err(ClientError::MissingModel)));
	}

	#[tokio::test]
	async fn sends_payload_and_reads_content() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v3/chat/completions"))
			.and(header("authorization", "Bearer test-key"))
			.and(body_partial_json(json!({
				"model": "ep-test",
				"max_tokens": 4000,
				"response_format": { "type": "json_object" },
				"messages": [
					{ "role": "system", "content": "be strict" },
					{ "role": "user", "content": "score this" }
				]
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"total_score\": 77}")))
			.expect(1)
			.mount(&server)
			.await;

		let client = ArkClient::new(config_for(&server)).unwrap();
		let request = ChatRequest::new("score this").system("be strict").json();
		let (result, traces) = collect_traces(client.chat(&request)).await;
		let response = result.unwrap();

		assert_eq!(response.content, "{\"total_score\": 77}");
		assert_eq!(response.usage.unwrap().total_tokens, 20);
		assert_eq!(traces.len(), 1);
		assert_eq!(traces[0].attempts, 1);
		assert_eq!(traces[0].request["prompt_chars"], json!(10));
	}

	#[tokio::test]
	async fn retries_server_errors_then_succeeds() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v3/chat/completions"))
			.respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
			.up_to_n_times(2)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/api/v3/chat/completions"))
			.respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
			.mount(&server)
			.await;

		let client = ArkClient::new(config_for(&server)).unwrap();
		let (result, traces) = collect_traces(client.chat(&ChatRequest::new("hi"))).await;

		assert_eq!(result.unwrap().content, "ok");
		assert_eq!(traces[0].attempts, 3);
	}

	#[tokio::test]
	async fn gives_up_after_max_retries() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500).set_body_string("internal"))
			.expect(3)
			.mount(&server)
			.await;

		let client = ArkClient::new(config_for(&server)).unwrap();
		let (result, traces) = collect_traces(client.chat(&ChatRequest::new("hi"))).await;

		match result {
			Err(ClientError::Http { status, body }) => {
				assert_eq!(status, 500);
				assert_eq!(body, "internal");
			}
			other => panic!("expected HTTP error, got {:?}", other),
		}
		assert_eq!(traces[0].error.as_deref(), Some("HTTP 500: internal"));
	}

	#[tokio::test]
	async fn retries_connection_failures() {
		// Nothing listens on a port released right after binding.
		let port = std::net::TcpListener::bind("127.0.0.1:0")
			.and_then(|l| l.local_addr())
			.unwrap()
			.port();
		let client = ArkClient::new(ClientConfig {
			api_key: Some("test-key".to_string()),
			base_url: format!("http://127.0.0.1:{port}/api/v3/"),
			model: Some("ep-test".to_string()),
			timeout_secs: 5,
			retry_backoff_ms: 1,
			..ClientConfig::default()
		})
		.unwrap();
		let (result, traces) = collect_traces(client.chat(&ChatRequest::new("hi"))).await;

		assert!(matches!(result, Err(ClientError::Network { .. })), "{:?}", result.map(|r| r.content));
		assert_eq!(traces.len(), 1);
		assert_eq!(traces[0].attempts, 3);
		assert!(traces[0].error.is_some());
	}

	#[tokio::test]
	async fn client_errors_are_not_retried() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
			.expect(1)
			.mount(&server)
			.await;

		let client = ArkClient::new(config_for(&server)).unwrap();
		let err = client.chat(&ChatRequest::new("hi")).await.unwrap_err();
		assert!(matches!(err, ClientError::Http { status: 401, .. }));
	}

	#[tokio::test]
	async fn times_out_slow_responses() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(completion("late"))
					.set_delay(Duration::from_secs(3)),
			)
			.mount(&server)
			.await;

		let config = ClientConfig {
			timeout_secs: 1,
			max_retries: 1,
			..config_for(&server)
		};
		let client = ArkClient::new(config).unwrap();
		let err = client.chat(&ChatRequest::new("hi")).await.unwrap_err();
		assert!(matches!(err, ClientError::Timeout { secs: 1 }));
	}

	#[tokio::test]
	async fn malformed_completion_is_invalid_response() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
			.expect(1)
			.mount(&server)
			.await;

		let client = ArkClient::new(config_for(&server)).unwrap();
		let err = client.chat(&ChatRequest::new("hi")).await.unwrap_err();
		assert!(matches!(err, ClientError::InvalidResponse { .. }));
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let client = ArkClient::new(ClientConfig {
			api_key: Some("k".into()),
			model: Some("m".into()),
			..ClientConfig::default()
		})
		.unwrap();
		assert_eq!(client.backoff(0), Duration::from_secs(1));
		assert_eq!(client.backoff(1), Duration::from_secs(2));
		assert_eq!(client.backoff(2), Duration::from_secs(4));
		assert_eq!(client.backoff(10), MAX_BACKOFF);
	}
}
