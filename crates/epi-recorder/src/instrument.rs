// crates/epi-recorder/src/instrument.rs
// ============================================================================
// Module: EPI LLM Instrumentation
// Description: Step producers for model requests, responses, and errors.
// Purpose: Record provider calls without coupling to any provider client.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Provider payloads are classified into a closed set of recognized shapes
//! ([`ProviderResponse`]) read through the [`ResponseShape`] capability trait.
//! Payloads matching no known shape are tagged `unrecognized` and stored raw;
//! they never yield invented text or usage.
//!
//! [`Traced`] wraps a caller-supplied [`ChatClient`] and logs each call into
//! the current session. With no session it forwards calls untouched.
//! Streaming clients ([`StreamingChatClient`]) are traced through
//! [`TracedStream`], which logs the accumulated text once the stream ends.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use std::time::Instant;

use epi_core::core::step::KIND_LLM_ERROR;
use epi_core::core::step::KIND_LLM_REQUEST;
use epi_core::core::step::KIND_LLM_RESPONSE;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::context::get_current_session;
use crate::session::Session;
use crate::session::SessionError;

// ============================================================================
// SECTION: Requests
// ============================================================================

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role (`system`, `user`, `assistant`).
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// Provider-neutral chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Extra request parameters (temperature, `max_tokens`, ...).
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ChatRequest {
    /// Creates a request with no extra parameters.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.into(), messages, params: Map::new() }
    }

    /// Adds an extra parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

// ============================================================================
// SECTION: Response Shapes
// ============================================================================

/// Token accounting normalized across providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
}

/// Read access to a recognized provider response.
pub trait ResponseShape {
    /// Shape tag recorded in the step.
    fn shape(&self) -> &'static str;
    /// Model named by the response.
    fn model(&self) -> Option<&str>;
    /// Concatenated assistant text.
    fn text(&self) -> Option<String>;
    /// Normalized token usage.
    fn usage(&self) -> Option<TokenUsage>;
    /// Why generation stopped.
    fn finish_reason(&self) -> Option<&str>;
}

/// OpenAI chat-completion response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenAiChatCompletion {
    /// Model identifier.
    pub model: String,
    /// Candidate completions.
    pub choices: Vec<OpenAiChoice>,
    /// Token usage.
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

/// One OpenAI completion choice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenAiChoice {
    /// Generated message.
    pub message: OpenAiMessage,
    /// Stop reason.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// OpenAI message body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenAiMessage {
    /// Speaker role.
    #[serde(default)]
    pub role: Option<String>,
    /// Message text; absent for tool calls.
    #[serde(default)]
    pub content: Option<String>,
}

/// OpenAI token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OpenAiUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Anthropic messages-API response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnthropicMessage {
    /// Model identifier.
    pub model: String,
    /// Speaker role.
    #[serde(default)]
    pub role: Option<String>,
    /// Content blocks.
    pub content: Vec<AnthropicBlock>,
    /// Stop reason.
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Token usage.
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// One Anthropic content block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnthropicBlock {
    /// Block type (`text`, `tool_use`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text for `text` blocks.
    #[serde(default)]
    pub text: Option<String>,
}

/// Anthropic token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AnthropicUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
}

impl ResponseShape for OpenAiChatCompletion {
    fn shape(&self) -> &'static str {
        "openai_chat_completion"
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn text(&self) -> Option<String> {
        self.choices.first().and_then(|choice| choice.message.content.clone())
    }

    fn usage(&self) -> Option<TokenUsage> {
        self.usage.map(|usage| TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or_else(|| usage.prompt_tokens.saturating_add(usage.completion_tokens)),
        })
    }

    fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|choice| choice.finish_reason.as_deref())
    }
}

impl ResponseShape for AnthropicMessage {
    fn shape(&self) -> &'static str {
        "anthropic_message"
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if parts.is_empty() { None } else { Some(parts.concat()) }
    }

    fn usage(&self) -> Option<TokenUsage> {
        self.usage.map(|usage| TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens.saturating_add(usage.output_tokens),
        })
    }

    fn finish_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }
}

/// Classified provider response.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// OpenAI chat completion.
    OpenAi(OpenAiChatCompletion),
    /// Anthropic message.
    Anthropic(AnthropicMessage),
    /// No recognized shape; payload kept verbatim.
    Unrecognized(Value),
}

impl ProviderResponse {
    /// Classifies a raw provider payload.
    #[must_use]
    pub fn classify(raw: &Value) -> Self {
        let Some(object) = raw.as_object() else {
            return Self::Unrecognized(raw.clone());
        };
        if object.contains_key("choices")
            && let Ok(completion) = serde_json::from_value(raw.clone())
        {
            return Self::OpenAi(completion);
        }
        if object.get("type").and_then(Value::as_str) == Some("message")
            && let Ok(message) = serde_json::from_value(raw.clone())
        {
            return Self::Anthropic(message);
        }
        Self::Unrecognized(raw.clone())
    }

    /// Returns the recognized shape, if any.
    #[must_use]
    pub fn recognized(&self) -> Option<&dyn ResponseShape> {
        match self {
            Self::OpenAi(completion) => Some(completion),
            Self::Anthropic(message) => Some(message),
            Self::Unrecognized(_) => None,
        }
    }

    /// Shape tag recorded in the step.
    #[must_use]
    pub fn shape(&self) -> &'static str {
        self.recognized().map_or("unrecognized", |shape| shape.shape())
    }

    /// Provider label implied by the shape; `unknown` when unrecognized.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::OpenAi(_) => "openai",
            Self::Anthropic(_) => "anthropic",
            Self::Unrecognized(_) => "unknown",
        }
    }
}

// ============================================================================
// SECTION: Step Producers
// ============================================================================

/// Logs an `llm.request` step.
///
/// # Errors
///
/// Returns [`SessionError`] when the session rejects the step.
pub fn log_llm_request(
    session: &Session,
    provider: &str,
    request: &ChatRequest,
) -> Result<(), SessionError> {
    session.log_step(KIND_LLM_REQUEST, Value::Object(request_content(provider, request)))
}

/// Builds `llm.request` content; request parameters never replace core fields.
fn request_content(provider: &str, request: &ChatRequest) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("provider".to_string(), json!(provider));
    content.insert("model".to_string(), json!(request.model));
    content.insert("messages".to_string(), json!(request.messages));
    for (key, value) in &request.params {
        content.entry(key.clone()).or_insert_with(|| value.clone());
    }
    content
}

/// Logs an `llm.response` step for a raw provider payload.
///
/// # Errors
///
/// Returns [`SessionError`] when the session rejects the step.
pub fn log_llm_response(
    session: &Session,
    provider: &str,
    raw: &Value,
    latency: Option<Duration>,
) -> Result<(), SessionError> {
    let response = ProviderResponse::classify(raw);
    let mut content = json!({
        "provider": provider,
        "shape": response.shape(),
        "raw": raw,
    });
    if let Some(shape) = response.recognized() {
        content["model"] = json!(shape.model());
        content["text"] = json!(shape.text());
        content["usage"] = json!(shape.usage());
        content["finish_reason"] = json!(shape.finish_reason());
    }
    if let Some(latency) = latency {
        content["latency_ms"] = json!(millis(latency));
    }
    session.log_step(KIND_LLM_RESPONSE, content)
}

/// Logs a provider payload, detecting the provider from its shape.
///
/// When `messages` are given an `llm.request` step is written first, using
/// the response model (or `unknown`).
///
/// # Errors
///
/// Returns [`SessionError`] when the session rejects a step.
pub fn log_llm_call(
    session: &Session,
    raw: &Value,
    messages: Option<&[ChatMessage]>,
    latency: Option<Duration>,
) -> Result<(), SessionError> {
    let response = ProviderResponse::classify(raw);
    let provider = response.provider();
    if let Some(messages) = messages {
        let model = response.recognized().and_then(ResponseShape::model).unwrap_or("unknown");
        log_llm_request(session, provider, &ChatRequest::new(model, messages.to_vec()))?;
    }
    log_llm_response(session, provider, raw, latency)
}

/// Logs an `llm.error` step.
///
/// # Errors
///
/// Returns [`SessionError`] when the session rejects the step.
pub fn log_llm_error(
    session: &Session,
    provider: &str,
    model: &str,
    error: &dyn fmt::Display,
    error_type: &str,
    latency: Option<Duration>,
) -> Result<(), SessionError> {
    let mut content = json!({
        "provider": provider,
        "model": model,
        "error": error.to_string(),
        "error_type": error_type,
    });
    if let Some(latency) = latency {
        content["latency_ms"] = json!(millis(latency));
    }
    session.log_step(KIND_LLM_ERROR, content)
}

/// Logs a completed exchange as a request/response pair.
///
/// # Errors
///
/// Returns [`SessionError`] when the session rejects either step.
pub fn log_chat(
    session: &Session,
    provider: &str,
    model: &str,
    messages: &[ChatMessage],
    response_content: &str,
) -> Result<(), SessionError> {
    log_llm_request(session, provider, &ChatRequest::new(model, messages.to_vec()))?;
    session.log_step(
        KIND_LLM_RESPONSE,
        json!({
            "provider": provider,
            "shape": "chat_text",
            "model": model,
            "text": response_content,
        }),
    )
}

/// Converts a duration to whole milliseconds, saturating.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SECTION: Traced Client
// ============================================================================

/// Chat client that [`Traced`] can instrument.
pub trait ChatClient {
    /// Client error type.
    type Error: fmt::Display;

    /// Provider label recorded in steps.
    fn provider(&self) -> &str;

    /// Sends one chat request and returns the raw provider payload.
    ///
    /// # Errors
    ///
    /// Returns the client's error when the call fails.
    fn chat(&self, request: &ChatRequest) -> Result<Value, Self::Error>;
}

/// Explicit recording proxy around a [`ChatClient`].
#[derive(Debug, Clone)]
pub struct Traced<C> {
    /// Wrapped client.
    inner: C,
}

impl<C: ChatClient> Traced<C> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Returns the wrapped client.
    #[must_use]
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    /// Unwraps the proxy.
    #[must_use]
    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Sends `request`, logging it to the current session if there is one.
    ///
    /// Logging never changes the call result.
    ///
    /// # Errors
    ///
    /// Returns the wrapped client's error unchanged.
    pub fn chat(&self, request: &ChatRequest) -> Result<Value, C::Error> {
        let session = get_current_session();
        let provider = self.inner.provider();
        if let Some(session) = &session {
            let _ = log_llm_request(session, provider, request);
        }
        let started = Instant::now();
        let result = self.inner.chat(request);
        let latency = Some(started.elapsed());
        if let Some(session) = &session {
            let _ = match &result {
                Ok(raw) => log_llm_response(session, provider, raw, latency),
                Err(err) => log_llm_error(
                    session,
                    provider,
                    &request.model,
                    err,
                    type_name::<C::Error>(),
                    latency,
                ),
            };
        }
        result
    }

    /// Streams `request`, logging it to the current session if there is one.
    ///
    /// The request step carries `"stream": true`. The response step is
    /// written when the returned stream ends, with the accumulated text.
    ///
    /// # Errors
    ///
    /// Returns the wrapped client's error unchanged when the stream cannot
    /// be opened; that failure is logged as `llm.error`.
    pub fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<TracedStream<C::Chunks, C::Error>, C::Error>
    where
        C: StreamingChatClient,
    {
        let session = get_current_session();
        let provider = self.inner.provider();
        if let Some(session) = &session {
            let mut content = request_content(provider, request);
            content.insert("stream".to_string(), json!(true));
            let _ = session.log_step(KIND_LLM_REQUEST, Value::Object(content));
        }
        let started = Instant::now();
        let mut stream = TracedStream {
            chunks: None,
            session,
            provider: provider.to_string(),
            model: request.model.clone(),
            text: String::new(),
            started,
            _error: PhantomData,
        };
        match self.inner.chat_stream(request) {
            Ok(chunks) => {
                stream.chunks = Some(chunks);
                Ok(stream)
            }
            Err(err) => {
                stream.log_error(&err);
                Err(err)
            }
        }
    }
}

// ============================================================================
// SECTION: Streaming
// ============================================================================

/// Chat client that can stream text deltas.
pub trait StreamingChatClient: ChatClient {
    /// Stream of text deltas; an `Err` item ends the stream.
    type Chunks: Iterator<Item = Result<String, Self::Error>>;

    /// Opens a streaming chat call.
    ///
    /// # Errors
    ///
    /// Returns the client's error when the stream cannot be opened.
    fn chat_stream(&self, request: &ChatRequest) -> Result<Self::Chunks, Self::Error>;
}

/// Pass-through stream that records the call when it ends.
///
/// Exhaustion logs `llm.response`; an error item logs `llm.error`. Dropping
/// the stream early logs the partial text with `"complete": false`.
pub struct TracedStream<I, E> {
    /// Wrapped chunks; `None` once the call has been logged.
    chunks: Option<I>,
    /// Session captured when the stream was opened.
    session: Option<Session>,
    /// Provider label.
    provider: String,
    /// Requested model.
    model: String,
    /// Text received so far.
    text: String,
    /// Call start.
    started: Instant,
    /// Error type of the wrapped chunks.
    _error: PhantomData<fn() -> E>,
}

impl<I, E> fmt::Debug for TracedStream<I, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedStream")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("text", &self.text)
            .finish_non_exhaustive()
    }
}

impl<I, E> TracedStream<I, E> {
    /// Returns the text received so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Logs the accumulated response once and releases the chunks.
    fn log_response(&mut self, complete: bool) {
        self.chunks = None;
        let Some(session) = self.session.take() else {
            return;
        };
        let mut content = json!({
            "provider": self.provider,
            "shape": "stream",
            "model": self.model,
            "text": self.text,
            "stream": true,
            "latency_ms": millis(self.started.elapsed()),
        });
        if !complete {
            content["complete"] = json!(false);
        }
        let _ = session.log_step(KIND_LLM_RESPONSE, content);
    }
}

impl<I, E: fmt::Display> TracedStream<I, E> {
    /// Logs a stream failure once and releases the chunks.
    fn log_error(&mut self, error: &E) {
        self.chunks = None;
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = session.log_step(
            KIND_LLM_ERROR,
            json!({
                "provider": self.provider,
                "model": self.model,
                "error": error.to_string(),
                "error_type": type_name::<E>(),
                "stream": true,
                "text": self.text,
                "latency_ms": millis(self.started.elapsed()),
            }),
        );
    }
}

impl<I, E> Iterator for TracedStream<I, E>
where
    I: Iterator<Item = Result<String, E>>,
    E: fmt::Display,
{
    type Item = Result<String, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.chunks.as_mut()?.next();
        match &item {
            Some(Ok(delta)) => self.text.push_str(delta),
            Some(Err(err)) => self.log_error(err),
            None => self.log_response(true),
        }
        item
    }
}

impl<I, E> Drop for TracedStream<I, E> {
    fn drop(&mut self) {
        if self.chunks.is_some() {
            self.log_response(false);
        }
    }
}
