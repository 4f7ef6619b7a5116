//! OpenAI client and extraction against a mock Responses API

use std::sync::Arc;

use serde_json::json;
use tally_context::{ExtractionClient, ExtractionError, ModelExtractionClient};
use tally_providers::{ChatBackend, ChatRequest, LoggingBackend, ProviderError};
use tally_types::{Message, ModelName, ToolCall, ToolResult};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{
    TEST_API_KEY, extraction_requests, message_item, mount_answer, mount_extraction,
    response_body, start_openai_mock, test_client,
};

fn user(text: &str) -> Message {
    Message::try_user(text).unwrap()
}

#[tokio::test]
async fn logging_backend_passes_responses_through() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(header("Authorization", format!("Bearer {TEST_API_KEY}").as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(response_body(vec![message_item("4")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = LoggingBackend::new(test_client(&server));
    let response = backend
        .respond(ChatRequest::new(vec![user("2+2")]).with_instructions("be brief"))
        .await
        .unwrap();

    assert_eq!(response.text.as_deref(), Some("4"));
    assert_eq!(response.usage.input_tokens, 10);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["instructions"], "be brief");
    assert_eq!(body["stream"], false);
    assert_eq!(body["input"][0]["role"], "user");
}

#[tokio::test]
async fn transient_errors_retry_with_one_idempotency_key() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_answer(&server, vec![message_item("ok")], None).await;

    let response = test_client(&server)
        .respond(ChatRequest::new(vec![user("hi")]))
        .await
        .unwrap();
    assert_eq!(response.text.as_deref(), Some("ok"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let keys: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("idempotency-key").unwrap().clone())
        .collect();
    assert!(keys.iter().all(|k| *k == keys[0]));
    let counts: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("x-retry-count").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(counts, ["0", "1", "2"]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let err = test_client(&server)
        .respond(ChatRequest::new(vec![user("hi")]))
        .await
        .unwrap_err();

    match err {
        ProviderError::Api { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("bad request"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn extraction_sends_strict_schema_and_decodes_exact_decimals() {
    let server = start_openai_mock().await;
    mount_extraction(
        &server,
        &json!({
            "namedValues": [{ "name": "sleva", "value": 21.00 }],
            "lastCalculatedResult": 0.1
        }),
    )
    .await;

    let client = ModelExtractionClient::new(Arc::new(test_client(&server)))
        .with_model(ModelName::parse("gpt-4o").unwrap());
    let result = client
        .extract(vec![
            user("100 * 0.21, call it sleva"),
            Message::tool_use(ToolCall::new(
                "call_1",
                "calculate",
                json!({ "expression": "100 * 0.21" }),
            )),
            Message::tool_result(ToolResult::success("call_1", "calculate", "21")),
            Message::try_assistant("Saved sleva = 21.").unwrap(),
        ])
        .await
        .unwrap();

    let named = result.named_values.unwrap();
    assert_eq!(named[0].name, "sleva");
    assert_eq!(named[0].value.normalize().to_string(), "21");
    assert_eq!(result.last_calculated_result.unwrap().to_string(), "0.1");

    let requests = extraction_requests(&server).await;
    assert_eq!(requests.len(), 1);
    let body = &requests[0];
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["text"]["format"]["type"], "json_schema");
    assert_eq!(body["text"]["format"]["strict"], true);
    assert!(body.get("tools").is_none());

    let transcript = body["input"][0]["content"].as_str().unwrap();
    assert!(transcript.contains("USER: 100 * 0.21, call it sleva"));
    assert!(transcript.contains("TOOL RESULT calculate: 21"));
    assert!(transcript.contains("ASSISTANT: Saved sleva = 21."));
}

#[tokio::test]
async fn extraction_rejects_output_outside_schema() {
    let server = start_openai_mock().await;
    mount_extraction(&server, &json!({ "namedValues": [{ "name": "x" }] })).await;

    let client = ModelExtractionClient::new(Arc::new(test_client(&server)));
    let err = client.extract(vec![user("x is 5")]).await.unwrap_err();
    assert!(matches!(err, ExtractionError::SchemaViolation(_)));
}

#[tokio::test]
async fn extraction_surfaces_transport_failures() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
        .mount(&server)
        .await;

    let client = ModelExtractionClient::new(Arc::new(test_client(&server)));
    let err = client.extract(vec![user("x is 5")]).await.unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::Transport(ProviderError::Api { status: 401, .. })
    ));
}
