use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Maximum attempts for one logical model call (1 initial + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// One model invocation as a step issues it.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// What came back, with the token counts cost accounting needs.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_seconds: f64,
}

/// Opaque "call the model" capability.
///
/// The core never assumes a vendor protocol, only this shape. One
/// `complete` call is a single attempt; retry and deadline policy live in
/// [`call_with_retry`], next to the step that knows its own name.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Drive one model call with the step's deadline and bounded retry.
///
/// Transient failures are retried up to [`MAX_ATTEMPTS`] with exponential
/// backoff (100ms, 200ms). A deadline overrun is not retried: it surfaces
/// as `StepTimeout` carrying `step_name` so callers can see which step
/// stalled.
pub async fn call_with_retry(
    client: &dyn ModelClient,
    request: &CompletionRequest,
    timeout: Duration,
    step_name: &str,
) -> Result<Completion> {
    let mut last_message = String::new();
    for attempt in 1..=MAX_ATTEMPTS {
        match tokio::time::timeout(timeout, client.complete(request)).await {
            Err(_) => {
                return Err(PipelineError::StepTimeout {
                    step: step_name.to_string(),
                })
            }
            Ok(Ok(completion)) => return Ok(completion),
            Ok(Err(e)) => {
                last_message = e.to_string();
                warn!(
                    step = step_name,
                    attempt,
                    error = %last_message,
                    "model call attempt failed"
                );
                if attempt < MAX_ATTEMPTS {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(PipelineError::ModelCall {
        message: last_message,
        attempts: MAX_ATTEMPTS,
    })
}

/// Ollama-backed [`ModelClient`] using `/api/generate`.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
        let started = Instant::now();
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            PipelineError::ModelCall {
                message: format!("Failed to connect to LLM at {}: {}", url, e),
                attempts: 1,
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::ModelCall {
                message: format!("LLM returned error {}: {}", status, text),
                attempts: 1,
            });
        }

        let json_response: Value = resp.json().await?;
        let latency_seconds = started.elapsed().as_secs_f64();

        let content = json_response
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        // Ollama reports token counts as eval counters; fall back to a
        // whitespace estimate when a model omits them.
        let input_tokens = json_response
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| estimate_tokens(&request.prompt));
        let output_tokens = json_response
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| estimate_tokens(&content));

        debug!(
            model = %request.model,
            input_tokens,
            output_tokens,
            latency_seconds,
            "model call completed"
        );

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
            latency_seconds,
        })
    }
}

/// Rough token count for providers that omit usage numbers.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// A scripted response rule for [`MockClient`].
struct MockRule {
    needle: String,
    content: String,
}

/// Deterministic in-process model for tests and demos.
///
/// Replies are chosen by substring match against the prompt; unmatched
/// prompts get the default reply. Optional artificial latency and scripted
/// failures exercise the timeout and retry paths. Every request is logged
/// for assertions.
pub struct MockClient {
    rules: Vec<MockRule>,
    default_reply: String,
    delay: Option<Duration>,
    fail_first: Mutex<u32>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: "mock reply".to_string(),
            delay: None,
            fail_first: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `content` whenever the prompt contains `needle`.
    /// Rules are checked in insertion order; first match wins.
    pub fn reply_when(mut self, needle: impl Into<String>, content: impl Into<String>) -> Self {
        self.rules.push(MockRule {
            needle: needle.into(),
            content: content.into(),
        });
        self
    }

    pub fn default_reply(mut self, content: impl Into<String>) -> Self {
        self.default_reply = content.into();
        self
    }

    /// Sleep this long inside every call (drives timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls with a transient error (drives retry tests).
    pub fn fail_first(self, n: u32) -> Self {
        *self.fail_first.lock().unwrap_or_else(|p| p.into_inner()) = n;
        self
    }

    /// All requests received so far, in order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut remaining = self.fail_first.lock().unwrap_or_else(|p| p.into_inner());
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PipelineError::ModelCall {
                    message: "simulated transient failure".to_string(),
                    attempts: 1,
                });
            }
        }

        let content = self
            .rules
            .iter()
            .find(|r| request.prompt.contains(&r.needle))
            .map(|r| r.content.clone())
            .unwrap_or_else(|| self.default_reply.clone());

        Ok(Completion {
            input_tokens: estimate_tokens(&request.prompt),
            output_tokens: estimate_tokens(&content),
            latency_seconds: 0.0,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.to_string(),
            model: "test-model".to_string(),
            max_tokens: 64,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_mock_rule_match() {
        let client = MockClient::new()
            .reply_when("Classify", "simple")
            .default_reply("other");
        let c = client.complete(&request("Classify this question")).await.unwrap();
        assert_eq!(c.content, "simple");
        let c = client.complete(&request("Summarize this")).await.unwrap();
        assert_eq!(c.content, "other");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_token_counts() {
        let client = MockClient::new().default_reply("one two three");
        let c = client.complete(&request("a b c d")).await.unwrap();
        assert_eq!(c.input_tokens, 4);
        assert_eq!(c.output_tokens, 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let client = MockClient::new().default_reply("ok").fail_first(2);
        let completion = call_with_retry(
            &client,
            &request("hello"),
            Duration::from_secs(1),
            "triage",
        )
        .await
        .unwrap();
        assert_eq!(completion.content, "ok");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let client = MockClient::new().fail_first(10);
        let err = call_with_retry(
            &client,
            &request("hello"),
            Duration::from_secs(1),
            "triage",
        )
        .await
        .unwrap_err();
        match err {
            PipelineError::ModelCall { attempts, .. } => assert_eq!(attempts, MAX_ATTEMPTS),
            other => panic!("Expected ModelCall error, got {other:?}"),
        }
        assert_eq!(client.call_count(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_step_name_and_is_not_retried() {
        let client = MockClient::new()
            .default_reply("too late")
            .with_delay(Duration::from_millis(200));
        let err = call_with_retry(
            &client,
            &request("hello"),
            Duration::from_millis(20),
            "reasoning",
        )
        .await
        .unwrap_err();
        match err {
            PipelineError::StepTimeout { step } => assert_eq!(step, "reasoning"),
            other => panic!("Expected StepTimeout error, got {other:?}"),
        }
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two  three"), 3);
    }
}
