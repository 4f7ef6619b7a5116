//! Request/response logging middleware.

use std::borrow::Cow;

use tally_types::Message;

use crate::{ChatBackend, ChatFut, ChatRequest, ChatResponse};

pub const DEFAULT_MAX_LOGGED_CHARS: usize = 500;

/// Truncate `text` to at most `max_chars` characters, marking the cut.
#[must_use]
pub fn truncate_for_log(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(format!("{}...", &text[..byte_idx])),
        None => Cow::Borrowed(text),
    }
}

/// Wraps a [`ChatBackend`] and logs every message sent and every response
/// received at `debug`, errors at `warn`.
#[derive(Debug, Clone)]
pub struct LoggingBackend<B> {
    inner: B,
    max_logged_chars: usize,
}

impl<B: ChatBackend> LoggingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            max_logged_chars: DEFAULT_MAX_LOGGED_CHARS,
        }
    }

    pub fn with_max_logged_chars(mut self, max_chars: usize) -> Self {
        self.max_logged_chars = max_chars;
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn log_request(&self, request: &ChatRequest) {
        let max = self.max_logged_chars;
        tracing::debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            structured = request.response_format.is_some(),
            "Sending chat request"
        );
        for msg in &request.messages {
            match msg {
                Message::ToolUse(call) => tracing::debug!(
                    role = msg.role_str(),
                    tool = %call.name,
                    call_id = %call.id,
                    arguments = %truncate_for_log(&call.arguments.to_string(), max),
                    "-> tool call"
                ),
                Message::ToolResult(result) => tracing::debug!(
                    role = msg.role_str(),
                    tool = %result.tool_name,
                    call_id = %result.tool_call_id,
                    is_error = result.is_error,
                    content = %truncate_for_log(&result.content, max),
                    "-> tool result"
                ),
                _ => tracing::debug!(
                    role = msg.role_str(),
                    text = %truncate_for_log(msg.content(), max),
                    "-> message"
                ),
            }
        }
    }

    fn log_response(max: usize, response: &ChatResponse) {
        tracing::debug!(
            id = response.id.as_deref().unwrap_or("-"),
            text = %truncate_for_log(response.text.as_deref().unwrap_or(""), max),
            tool_calls = response.tool_calls.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "<- response"
        );
        for call in &response.tool_calls {
            tracing::debug!(
                tool = %call.name,
                call_id = %call.id,
                arguments = %truncate_for_log(&call.arguments.to_string(), max),
                "<- tool call"
            );
        }
        if let Some(refusal) = &response.refusal {
            tracing::warn!(refusal = %truncate_for_log(refusal, max), "<- refusal");
        }
    }
}

impl<B: ChatBackend> ChatBackend for LoggingBackend<B> {
    fn respond(&self, request: ChatRequest) -> ChatFut<'_> {
        self.log_request(&request);
        let max = self.max_logged_chars;
        let fut = self.inner.respond(request);
        Box::pin(async move {
            let result = fut.await;
            match &result {
                Ok(response) => Self::log_response(max, response),
                Err(e) => tracing::warn!(error = %e, "<- chat request failed"),
            }
            result
        })
    }
}
