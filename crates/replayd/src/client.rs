//! Retry-wrapped client for the remote chat API.
//!
//! One turn of one conversation goes out per call. Two delivery modes exist
//! behind the `Delivery` trait: blocking (full reply in one JSON body) and
//! streaming (reply assembled from an SSE event sequence). The mode is fixed
//! by configuration, not chosen per call.
//!
//! Failures are classified: timeouts, connection faults, HTTP 5xx and 429
//! are retryable; other client-side rejections (auth, malformed request)
//! fail immediately without consuming retry budget.

use async_trait::async_trait;
use replay_core::{CallOutcome, CallStatus, Config, ExtraInputs, ResponseMode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request timed out after {0} seconds")]
    Timeout(u32),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("API error: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl ChatError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Api(_) | Self::InvalidResponse(_) | Self::Stream(_) => false,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // Actual timeout seconds are reported by the caller's config;
            // reqwest does not expose the configured value here.
            ChatError::Connection(format!("timeout: {e}"))
        } else if e.is_connect() {
            ChatError::Connection(e.to_string())
        } else {
            ChatError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// One conversational turn as sent to the remote service.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub query: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub inputs: ExtraInputs,
}

/// Normalized reply from either delivery mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Response delivery seam. Sends one request, returns one assembled reply.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, request: &ChatRequest) -> Result<ChatReply, ChatError>;
}

/// Error body shape returned by the remote API on failure.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Shared HTTP plumbing for both delivery modes.
#[derive(Debug, Clone)]
struct HttpEndpoint {
    http: reqwest::Client,
    url: String,
    api_key: String,
    timeout: Duration,
    timeout_sec: u32,
}

impl HttpEndpoint {
    fn new(api_url: &str, api_key: &str, timeout_sec: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/chat-messages", api_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(u64::from(timeout_sec)),
            timeout_sec,
        }
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(body)
    }

    fn request_body(&self, request: &ChatRequest, mode: ResponseMode) -> serde_json::Value {
        let mut body = serde_json::json!({
            "inputs": request.inputs,
            "query": request.query,
            "response_mode": mode.as_str(),
            "user": request.user,
        });
        if let Some(conversation_id) = &request.conversation_id {
            body["conversation_id"] = serde_json::Value::String(conversation_id.clone());
        }
        body
    }

    fn map_send_error(&self, e: reqwest::Error) -> ChatError {
        if e.is_timeout() {
            ChatError::Timeout(self.timeout_sec)
        } else {
            e.into()
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> ChatError {
        let status = response.status().as_u16();
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.message.unwrap_or_else(|| "unknown error".to_string()),
            Err(_) => "unknown error".to_string(),
        };
        ChatError::Http { status, message }
    }
}

/// Blocking delivery: the full reply arrives in a single JSON response.
pub struct BlockingDelivery {
    endpoint: HttpEndpoint,
}

impl BlockingDelivery {
    pub fn new(api_url: &str, api_key: &str, timeout_sec: u32) -> Self {
        Self {
            endpoint: HttpEndpoint::new(api_url, api_key, timeout_sec),
        }
    }
}

#[async_trait]
impl Delivery for BlockingDelivery {
    async fn deliver(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        let body = self.endpoint.request_body(request, ResponseMode::Blocking);
        let response = self
            .endpoint
            .post(&body)
            .send()
            .await
            .map_err(|e| self.endpoint.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.error_from_response(response).await);
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| ChatError::InvalidResponse(e.to_string()))?;
        Ok(reply)
    }
}

/// Streaming delivery: the reply is assembled from SSE `data:` lines until
/// a `message_end` event (or an `error` event fails the call).
pub struct StreamingDelivery {
    endpoint: HttpEndpoint,
}

impl StreamingDelivery {
    pub fn new(api_url: &str, api_key: &str, timeout_sec: u32) -> Self {
        Self {
            endpoint: HttpEndpoint::new(api_url, api_key, timeout_sec),
        }
    }
}

#[async_trait]
impl Delivery for StreamingDelivery {
    async fn deliver(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        use futures_util::StreamExt;

        let body = self.endpoint.request_body(request, ResponseMode::Streaming);
        let response = self
            .endpoint
            .post(&body)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.endpoint.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.error_from_response(response).await);
        }

        let mut assembler = StreamAssembler::default();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ChatError::Stream(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines; a partial line stays buffered.
            while let Some(end) = buffer.find('\n') {
                let line = buffer[..end].to_string();
                buffer.drain(..=end);
                if assembler.feed_line(&line)? {
                    break 'outer;
                }
            }
        }

        if !buffer.is_empty() {
            assembler.feed_line(&buffer.clone())?;
        }

        Ok(assembler.into_reply())
    }
}

/// Accumulates streamed events into a single reply.
#[derive(Debug, Default)]
struct StreamAssembler {
    answer: String,
    conversation_id: Option<String>,
    message_id: Option<String>,
}

impl StreamAssembler {
    /// Consume one SSE line. Returns true once the terminal event arrived.
    fn feed_line(&mut self, line: &str) -> Result<bool, ChatError> {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            return Ok(false);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(false);
        }

        let event: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(line = payload, error = %e, "ignoring unparseable stream line");
                return Ok(false);
            }
        };

        match event.get("event").and_then(|e| e.as_str()).unwrap_or("") {
            "message" => {
                if let Some(chunk) = event.get("answer").and_then(|a| a.as_str()) {
                    self.answer.push_str(chunk);
                }
                self.capture_ids(&event);
                Ok(false)
            }
            "message_end" => {
                self.capture_ids(&event);
                if self.message_id.is_none() {
                    self.message_id = event
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
                Ok(true)
            }
            "error" => {
                let message = event
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown stream error");
                Err(ChatError::Api(message.to_string()))
            }
            _ => Ok(false),
        }
    }

    fn capture_ids(&mut self, event: &serde_json::Value) {
        if self.conversation_id.is_none() {
            self.conversation_id = event
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if self.message_id.is_none() {
            self.message_id = event
                .get("message_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
    }

    fn into_reply(self) -> ChatReply {
        ChatReply {
            answer: self.answer,
            conversation_id: self.conversation_id,
            message_id: self.message_id,
        }
    }
}

/// Fixed retry policy applied around a delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = retries + 1).
    pub retries: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Retry-wrapped chat client.
///
/// Normalizes every call into a `CallOutcome`; network and API failures
/// never surface as `Err` to the caller.
pub struct ChatClient {
    delivery: Box<dyn Delivery>,
    policy: RetryPolicy,
    user_id: String,
}

impl ChatClient {
    pub fn new(delivery: Box<dyn Delivery>, policy: RetryPolicy, user_id: impl Into<String>) -> Self {
        Self {
            delivery,
            policy,
            user_id: user_id.into(),
        }
    }

    /// Build a client from daemon configuration, selecting the delivery
    /// mode the config names.
    pub fn from_config(config: &Config) -> Self {
        let delivery: Box<dyn Delivery> = match config.response_mode {
            ResponseMode::Blocking => Box::new(BlockingDelivery::new(
                &config.api_url,
                &config.api_key,
                config.timeout_sec,
            )),
            ResponseMode::Streaming => Box::new(StreamingDelivery::new(
                &config.api_url,
                &config.api_key,
                config.timeout_sec,
            )),
        };
        Self::new(
            delivery,
            RetryPolicy {
                retries: config.retries,
                delay: Duration::from_secs(u64::from(config.retry_delay_sec)),
            },
            config.user_id.clone(),
        )
    }

    /// Execute one turn, retrying retryable failures up to the policy limit.
    ///
    /// The returned outcome's `attempt_number` is the 1-based attempt that
    /// settled the call; `session` carries the conversation id seen in a
    /// successful reply.
    pub async fn execute_turn(
        &self,
        session: Option<&str>,
        message: &str,
        extra_inputs: Option<&ExtraInputs>,
    ) -> CallOutcome {
        let request = ChatRequest {
            query: message.to_string(),
            user: self.user_id.clone(),
            conversation_id: session.map(str::to_string),
            inputs: extra_inputs.cloned().unwrap_or_default(),
        };

        let max_attempts = self.policy.retries + 1;
        let mut last_error: Option<ChatError> = None;
        let mut latency = Duration::ZERO;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay).await;
            }

            let start = Instant::now();
            match self.delivery.deliver(&request).await {
                Ok(reply) => {
                    return CallOutcome {
                        status: CallStatus::Success,
                        reply_text: reply.answer.trim().to_string(),
                        session: reply.conversation_id,
                        latency: start.elapsed(),
                        error_detail: None,
                        attempt_number: attempt,
                    };
                }
                Err(e) => {
                    latency = start.elapsed();
                    let retryable = e.is_retryable();
                    if retryable && attempt < max_attempts {
                        warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            "call failed, retrying after delay"
                        );
                        last_error = Some(e);
                        continue;
                    }
                    return CallOutcome {
                        status: CallStatus::FatalFailure,
                        reply_text: String::new(),
                        session: None,
                        latency,
                        error_detail: Some(if retryable {
                            format!("retries exhausted after {attempt} attempts: {e}")
                        } else {
                            e.to_string()
                        }),
                        attempt_number: attempt,
                    };
                }
            }
        }

        // Unreachable: the loop always returns on the last attempt. Kept for
        // totality without panicking in release builds.
        CallOutcome {
            status: CallStatus::FatalFailure,
            reply_text: String::new(),
            session: None,
            latency,
            error_detail: last_error.map(|e| e.to_string()),
            attempt_number: max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted delivery: pops one result per call.
    struct ScriptedDelivery {
        script: Mutex<Vec<Result<ChatReply, ChatError>>>,
        calls: AtomicU32,
    }

    impl ScriptedDelivery {
        fn new(mut script: Vec<Result<ChatReply, ChatError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn deliver(&self, _request: &ChatRequest) -> Result<ChatReply, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ChatError::Connection("script exhausted".to_string())))
        }
    }

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(10),
        }
    }

    fn reply(answer: &str, conversation: Option<&str>) -> ChatReply {
        ChatReply {
            answer: answer.to_string(),
            conversation_id: conversation.map(str::to_string),
            message_id: Some("m1".to_string()),
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let delivery = ScriptedDelivery::new(vec![Ok(reply("  hello  ", Some("conv-1")))]);
        let client = ChatClient::new(Box::new(delivery), fast_policy(3), "tester");

        let outcome = client.execute_turn(None, "hi", None).await;
        assert_eq!(outcome.status, CallStatus::Success);
        assert_eq!(outcome.reply_text, "hello");
        assert_eq!(outcome.session.as_deref(), Some("conv-1"));
        assert_eq!(outcome.attempt_number, 1);
        assert!(outcome.error_detail.is_none());
    }

    #[tokio::test]
    async fn retryable_failures_then_success_reports_third_attempt() {
        let delivery = ScriptedDelivery::new(vec![
            Err(ChatError::Timeout(30)),
            Err(ChatError::Http {
                status: 503,
                message: "unavailable".to_string(),
            }),
            Ok(reply("recovered", Some("conv-1"))),
        ]);
        let client = ChatClient::new(Box::new(delivery), fast_policy(3), "tester");

        let start = Instant::now();
        let outcome = client.execute_turn(None, "hi", None).await;
        assert_eq!(outcome.status, CallStatus::Success);
        assert_eq!(outcome.attempt_number, 3);
        // Two inter-attempt delays elapsed.
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_fatal_failure() {
        let delivery = ScriptedDelivery::new(vec![
            Err(ChatError::Connection("refused".to_string())),
            Err(ChatError::Connection("refused".to_string())),
            Err(ChatError::Connection("refused".to_string())),
        ]);
        let client = ChatClient::new(Box::new(delivery), fast_policy(2), "tester");

        let outcome = client.execute_turn(None, "hi", None).await;
        assert_eq!(outcome.status, CallStatus::FatalFailure);
        assert_eq!(outcome.attempt_number, 3);
        let detail = outcome.error_detail.unwrap();
        assert!(detail.contains("retries exhausted"));
        assert!(detail.contains("refused"));
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let delivery = ScriptedDelivery::new(vec![Err(ChatError::Http {
            status: 401,
            message: "bad api key".to_string(),
        })]);
        let client = ChatClient::new(Box::new(delivery), fast_policy(3), "tester");

        let outcome = client.execute_turn(None, "hi", None).await;
        assert_eq!(outcome.status, CallStatus::FatalFailure);
        assert_eq!(outcome.attempt_number, 1, "auth failure must not retry");
        assert!(outcome.error_detail.unwrap().contains("bad api key"));
    }

    #[tokio::test]
    async fn session_handle_is_forwarded() {
        struct CaptureDelivery {
            seen: std::sync::Arc<Mutex<Vec<Option<String>>>>,
        }

        #[async_trait]
        impl Delivery for CaptureDelivery {
            async fn deliver(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
                self.seen
                    .lock()
                    .unwrap()
                    .push(request.conversation_id.clone());
                Ok(ChatReply {
                    answer: "ok".to_string(),
                    conversation_id: Some("conv-9".to_string()),
                    message_id: None,
                })
            }
        }

        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let delivery = CaptureDelivery { seen: seen.clone() };
        let client = ChatClient::new(Box::new(delivery), fast_policy(0), "tester");

        client.execute_turn(None, "turn 1", None).await;
        client.execute_turn(Some("conv-9"), "turn 2", None).await;

        assert_eq!(*seen.lock().unwrap(), vec![None, Some("conv-9".to_string())]);
    }

    #[test]
    fn error_classification_matches_policy() {
        assert!(ChatError::Timeout(30).is_retryable());
        assert!(ChatError::Connection("refused".to_string()).is_retryable());
        assert!(ChatError::Http {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(ChatError::Http {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!ChatError::Http {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!ChatError::Http {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ChatError::Api("flow error".to_string()).is_retryable());
    }

    // --- Stream assembly tests ---

    #[test]
    fn stream_assembler_accumulates_message_events() {
        let mut assembler = StreamAssembler::default();
        assert!(!assembler
            .feed_line(r#"data: {"event":"message","answer":"Hel","conversation_id":"c1"}"#)
            .unwrap());
        assert!(!assembler
            .feed_line(r#"data: {"event":"message","answer":"lo!"}"#)
            .unwrap());
        assert!(assembler
            .feed_line(r#"data: {"event":"message_end","message_id":"m1"}"#)
            .unwrap());

        let reply = assembler.into_reply();
        assert_eq!(reply.answer, "Hello!");
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
        assert_eq!(reply.message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn stream_assembler_surfaces_error_events() {
        let mut assembler = StreamAssembler::default();
        let err = assembler
            .feed_line(r#"data: {"event":"error","message":"quota exceeded"}"#)
            .unwrap_err();
        assert!(matches!(err, ChatError::Api(m) if m.contains("quota exceeded")));
    }

    #[test]
    fn stream_assembler_ignores_noise_lines() {
        let mut assembler = StreamAssembler::default();
        assert!(!assembler.feed_line(":keepalive").unwrap());
        assert!(!assembler.feed_line("").unwrap());
        assert!(!assembler.feed_line("data: not json").unwrap());
        assert!(!assembler
            .feed_line(r#"data: {"event":"workflow_started"}"#)
            .unwrap());
        assert!(assembler.into_reply().answer.is_empty());
    }
}
