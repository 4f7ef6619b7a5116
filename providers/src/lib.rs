//! OpenAI client for Tally.
//!
//! # Architecture
//!
//! - [`ChatBackend`] - the seam every caller talks to: one request in, one
//!   complete response out (no streaming)
//! - [`openai`] - OpenAI Responses API implementation of [`ChatBackend`]
//! - [`logging`] - [`LoggingBackend`] middleware that records every request
//!   and response through `tracing` before delegating
//! - [`retry`] - backoff policy shared by all HTTP calls
//!
//! # Structured output
//!
//! Setting [`ChatRequest::response_format`] asks the model for JSON matching a
//! schema (`strict: true`). The raw JSON text comes back in
//! [`ChatResponse::text`]; validating and decoding it is the caller's job.

pub mod logging;
pub mod openai;
pub mod retry;

pub use logging::LoggingBackend;
pub use openai::OpenAIClient;
pub use tally_types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use tally_types::{ApiKey, ApiUsage, Message, ModelName, ToolCall, ToolDefinition};
use thiserror::Error;

/// Canonical OpenAI API base URL. `/v1/responses` is appended per request.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com";

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

const CONNECT_TIMEOUT_SECS: u64 = 30;

// reqwest only exposes tcp_keepalive (idle time); interval/retries use platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response failed: {0}")]
    Failed(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// A JSON Schema the response text must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub schema: Value,
}

impl JsonSchemaFormat {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// One inference call.
///
/// `model` overrides the backend's configured model for this call only.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: Option<ModelName>,
    pub instructions: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub response_format: Option<JsonSchemaFormat>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: ModelName) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_format(mut self, format: JsonSchemaFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A complete model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub id: Option<String>,
    /// Concatenated `output_text` parts; `None` when the model produced none.
    pub text: Option<String>,
    pub refusal: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: ApiUsage,
}

impl ChatResponse {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

pub type ChatFut<'a> = Pin<Box<dyn Future<Output = Result<ChatResponse, ProviderError>> + Send + 'a>>;

/// Something that can answer a [`ChatRequest`].
pub trait ChatBackend: Send + Sync {
    fn respond(&self, request: ChatRequest) -> ChatFut<'_>;
}

impl<B: ChatBackend + ?Sized> ChatBackend for Arc<B> {
    fn respond(&self, request: ChatRequest) -> ChatFut<'_> {
        (**self).respond(request)
    }
}

impl<B: ChatBackend + ?Sized> ChatBackend for Box<B> {
    fn respond(&self, request: ChatRequest) -> ChatFut<'_> {
        (**self).respond(request)
    }
}

/// Credentials, endpoint and transport tuning for [`OpenAIClient`].
///
/// ```rust
/// use std::time::Duration;
/// use tally_providers::ApiConfig;
/// use tally_providers::retry::RetryConfig;
/// use tally_types::{ApiKey, ModelName};
///
/// let config = ApiConfig::new(ApiKey::new("sk-test").unwrap(), ModelName::default())
///     .with_base_url("http://127.0.0.1:8080")
///     .with_timeout(Duration::from_secs(10))
///     .with_retry(RetryConfig::disabled());
/// # let _ = config;
/// ```
#[derive(Debug, Clone)]
pub struct ApiConfig {
    api_key: ApiKey,
    model: ModelName,
    base_url: String,
    timeout: Duration,
    retry: retry::RetryConfig,
}

impl ApiConfig {
    #[must_use]
    pub fn new(api_key: ApiKey, model: ModelName) -> Self {
        Self {
            api_key,
            model,
            base_url: OPENAI_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: retry::RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: retry::RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    #[must_use]
    pub fn model(&self) -> &ModelName {
        &self.model
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn retry(&self) -> &retry::RetryConfig {
        &self.retry
    }
}

/// Parse a base URL and decide whether plain HTTP is acceptable for it.
///
/// Only loopback hosts may use `http`; everything else must be `https`.
pub fn validate_base_url(raw: &str) -> Result<(Url, bool), ProviderError> {
    let invalid = |reason: &str| ProviderError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    let loopback = is_loopback_host(url.host_str().unwrap_or_default());

    match url.scheme() {
        "https" => Ok((url, false)),
        "http" if loopback => Ok((url, true)),
        "http" => Err(invalid("plain http is only allowed for loopback hosts")),
        other => Err(invalid(&format!("unsupported scheme '{other}'"))),
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<std::net::IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

fn base_client_builder(allow_http: bool) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(!allow_http)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
}

pub fn http_client_with_timeout(
    allow_http: bool,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    base_client_builder(allow_http).timeout(timeout).build()
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turn a retry outcome into a successful response or a [`ProviderError`].
pub(crate) async fn handle_response(
    outcome: retry::RetryOutcome,
) -> Result<reqwest::Response, ProviderError> {
    match outcome {
        retry::RetryOutcome::Success(response) => Ok(response),
        retry::RetryOutcome::HttpError(response) => {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            Err(ProviderError::Api { status, body })
        }
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            Err(ProviderError::Connection { attempts, source })
        }
        retry::RetryOutcome::NonRetryable(e) => Err(ProviderError::Http(e)),
    }
}
