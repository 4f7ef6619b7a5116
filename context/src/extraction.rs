//! Structured extraction of named values from a finished turn.
//!
//! [`ModelExtractionClient`] sends the turn transcript to a secondary model
//! call with a strict JSON Schema response format, validates the reply
//! against the same schema, and decodes it into an [`ExtractionResult`].
//! Nothing here ever panics on model output; every failure is an
//! [`ExtractionError`].

use std::collections::VecDeque;
use std::fmt::Write;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tally_providers::{ChatBackend, ChatRequest, JsonSchemaFormat, ProviderError};
use tally_types::{ExtractionResult, Message, ModelName, NonEmptyString};
use thiserror::Error;

pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(30);

const EXTRACTION_SCHEMA_NAME: &str = "calculator_facts";
const EXTRACTION_MAX_OUTPUT_TOKENS: u32 = 1024;

const EXTRACTION_INSTRUCTIONS: &str = "\
Analyze the conversation and extract:
1. Every value the user explicitly named or asked to remember (for example \"that is the discount\", \"remember it as X\", \"save that as Y\"). Return each one in namedValues with the name the user gave it.
2. The most recent numeric result calculated in this conversation, if any, in lastCalculatedResult.

IMPORTANT: return ONLY values the user explicitly named or wanted saved. If the user named nothing, return an empty namedValues list. Use null for lastCalculatedResult when nothing was calculated.";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction request failed: {0}")]
    Transport(#[from] ProviderError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction returned no text")]
    EmptyResponse,
    #[error("extraction refused: {0}")]
    Refused(String),
    #[error("extraction output is not JSON: {0}")]
    Malformed(String),
    #[error("extraction output does not match schema: {0}")]
    SchemaViolation(String),
}

pub type ExtractionFut<'a> =
    Pin<Box<dyn Future<Output = Result<ExtractionResult, ExtractionError>> + Send + 'a>>;

/// Turns one turn's messages into an [`ExtractionResult`].
pub trait ExtractionClient: Send + Sync {
    fn extract(&self, messages: Vec<Message>) -> ExtractionFut<'_>;
}

impl<C: ExtractionClient + ?Sized> ExtractionClient for Arc<C> {
    fn extract(&self, messages: Vec<Message>) -> ExtractionFut<'_> {
        (**self).extract(messages)
    }
}

/// JSON Schema sent as the structured output format and used to validate
/// the reply. Strict mode requires every property to be listed as required,
/// so absence is expressed as `null`.
#[must_use]
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "namedValues": {
                "type": ["array", "null"],
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "value": { "type": "number" }
                    },
                    "required": ["name", "value"],
                    "additionalProperties": false
                }
            },
            "lastCalculatedResult": { "type": ["number", "null"] }
        },
        "required": ["namedValues", "lastCalculatedResult"],
        "additionalProperties": false
    })
}

/// Rename snake_case top-level keys to their wire names.
fn normalize_keys(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for (alias, canonical) in [
        ("named_values", "namedValues"),
        ("last_calculated_result", "lastCalculatedResult"),
    ] {
        if !object.contains_key(canonical)
            && let Some(v) = object.remove(alias)
        {
            object.insert(canonical.to_string(), v);
        }
    }
}

/// Validate and decode the text of an extraction reply.
pub fn parse_extraction(text: &str) -> Result<ExtractionResult, ExtractionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractionError::EmptyResponse);
    }

    let mut value: Value =
        serde_json::from_str(trimmed).map_err(|e| ExtractionError::Malformed(e.to_string()))?;
    normalize_keys(&mut value);

    let schema = extraction_schema();
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| ExtractionError::SchemaViolation(format!("invalid schema: {e}")))?;
    if let Err(err) = validator.validate(&value) {
        return Err(ExtractionError::SchemaViolation(err.to_string()));
    }

    // Decode from text so decimals keep the digits the model wrote.
    let normalized = serde_json::to_string(&value)
        .map_err(|e| ExtractionError::SchemaViolation(e.to_string()))?;
    serde_json::from_str(&normalized).map_err(|e| ExtractionError::SchemaViolation(e.to_string()))
}

/// Plain-text transcript of a turn for the extraction prompt.
#[must_use]
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        match msg {
            Message::System(_) => {}
            Message::User(m) => {
                let _ = writeln!(out, "USER: {}", m.content());
            }
            Message::Assistant(m) => {
                let _ = writeln!(out, "ASSISTANT: {}", m.content());
            }
            Message::ToolUse(call) => {
                let _ = writeln!(out, "TOOL CALL {}: {}", call.name, call.arguments);
            }
            Message::ToolResult(result) => {
                let marker = if result.is_error { " (error)" } else { "" };
                let _ = writeln!(
                    out,
                    "TOOL RESULT {}{marker}: {}",
                    result.tool_name, result.content
                );
            }
        }
    }
    out
}

/// Extraction through a structured-output model call.
pub struct ModelExtractionClient {
    backend: Arc<dyn ChatBackend>,
    model: Option<ModelName>,
    timeout: Duration,
}

impl ModelExtractionClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            model: None,
            timeout: DEFAULT_EXTRACTION_TIMEOUT,
        }
    }

    /// Use `model` for extraction instead of the backend's default.
    pub fn with_model(mut self, model: ModelName) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(&self, transcript: NonEmptyString) -> ChatRequest {
        let mut request = ChatRequest::new(vec![Message::user(transcript)])
            .with_instructions(EXTRACTION_INSTRUCTIONS)
            .with_response_format(JsonSchemaFormat::new(
                EXTRACTION_SCHEMA_NAME,
                extraction_schema(),
            ))
            .with_max_output_tokens(EXTRACTION_MAX_OUTPUT_TOKENS);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        request
    }

    async fn run(&self, messages: Vec<Message>) -> Result<ExtractionResult, ExtractionError> {
        let Ok(transcript) = NonEmptyString::new(render_transcript(&messages)) else {
            return Ok(ExtractionResult::default());
        };

        let request = self.build_request(transcript);
        let response = tokio::time::timeout(self.timeout, self.backend.respond(request))
            .await
            .map_err(|_| ExtractionError::Timeout(self.timeout))??;

        match (response.text, response.refusal) {
            (Some(text), _) => parse_extraction(&text),
            (None, Some(refusal)) => Err(ExtractionError::Refused(refusal)),
            (None, None) => Err(ExtractionError::EmptyResponse),
        }
    }
}

impl ExtractionClient for ModelExtractionClient {
    fn extract(&self, messages: Vec<Message>) -> ExtractionFut<'_> {
        Box::pin(self.run(messages))
    }
}

/// Scripted extraction outcomes, returned in order.
///
/// Once the script runs out every call yields an empty result.
#[derive(Default)]
pub struct StaticExtractionClient {
    script: Mutex<VecDeque<Result<ExtractionResult, ExtractionError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl StaticExtractionClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, outcome: Result<ExtractionResult, ExtractionError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Messages received by every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExtractionClient for StaticExtractionClient {
    fn extract(&self, messages: Vec<Message>) -> ExtractionFut<'_> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(ExtractionResult::default()));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        })
    }
}
