//! Shared test utilities and fixtures
//!
//! Builders for Responses API payloads and a client wired to a mock server.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use tally_providers::retry::RetryConfig;
use tally_providers::{ApiConfig, OpenAIClient};
use tally_types::{ApiKey, ModelName};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const TEST_API_KEY: &str = "test-key";

/// Marker present only in extraction requests (the schema name).
pub const EXTRACTION_MARKER: &str = "calculator_facts";

/// Start a mock server that simulates the OpenAI API
pub async fn start_openai_mock() -> MockServer {
    MockServer::start().await
}

/// Fast retries so failure paths don't slow the suite down.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
    }
}

pub fn test_config(server: &MockServer) -> ApiConfig {
    ApiConfig::new(
        ApiKey::new(TEST_API_KEY).unwrap(),
        ModelName::parse("gpt-4o-mini").unwrap(),
    )
    .with_base_url(server.uri())
    .with_timeout(Duration::from_secs(5))
    .with_retry(fast_retry())
}

pub fn test_client(server: &MockServer) -> OpenAIClient {
    OpenAIClient::new(test_config(server)).unwrap()
}

pub fn message_item(text: &str) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "content": [{ "type": "output_text", "text": text }]
    })
}

pub fn function_call_item(call_id: &str, name: &str, arguments: &Value) -> Value {
    json!({
        "id": format!("fc_{call_id}"),
        "type": "function_call",
        "call_id": call_id,
        "name": name,
        "arguments": arguments.to_string()
    })
}

/// A completed Responses API body with the given output items.
pub fn response_body(output: Vec<Value>) -> Value {
    json!({
        "id": "resp_test",
        "object": "response",
        "status": "completed",
        "model": "gpt-4o-mini",
        "output": output,
        "usage": {
            "input_tokens": 10,
            "output_tokens": 20,
            "total_tokens": 30
        }
    })
}

/// Mount a plain text answer for primary (non-extraction) requests.
///
/// `times` limits how often the mock answers; later mounts take over after.
pub async fn mount_answer(server: &MockServer, output: Vec<Value>, times: Option<u64>) {
    let mut mock = Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body(output)));
    if let Some(times) = times {
        mock = mock.up_to_n_times(times);
    }
    mock.mount(server).await;
}

/// Mount the structured-output reply for extraction requests.
pub async fn mount_extraction(server: &MockServer, facts: &Value) {
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_string_contains(EXTRACTION_MARKER))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(response_body(vec![message_item(&facts.to_string())])),
        )
        .with_priority(1)
        .mount(server)
        .await;
}

pub fn request_json(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap()
}

pub fn is_extraction(request: &Request) -> bool {
    String::from_utf8_lossy(&request.body).contains(EXTRACTION_MARKER)
}

/// Received primary requests, in arrival order.
pub async fn primary_requests(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| !is_extraction(r))
        .map(request_json)
        .collect()
}

/// Received extraction requests, in arrival order.
pub async fn extraction_requests(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| is_extraction(r))
        .map(request_json)
        .collect()
}
