//! OpenAI Responses API client (non-streaming).

use serde_json::{Value, json};
use tally_types::{ApiUsage, Message, ModelName, ToolCall};

use crate::retry::send_with_retry;
use crate::{
    ApiConfig, ChatBackend, ChatFut, ChatRequest, ChatResponse, ProviderError, handle_response,
    http_client_with_timeout, validate_base_url,
};

/// Role mapping for the Responses API.
///
/// API callers operate at "developer" level, so `Message::System` maps to
/// "developer", not "system".
fn openai_role(msg: &Message) -> &'static str {
    match msg {
        Message::System(_) => "developer",
        Message::User(_) | Message::ToolResult(_) => "user",
        Message::Assistant(_) | Message::ToolUse(_) => "assistant",
    }
}

pub(crate) fn build_request_body(default_model: &ModelName, request: &ChatRequest) -> Value {
    let mut input_items: Vec<Value> = Vec::new();
    for msg in &request.messages {
        match msg {
            Message::ToolUse(call) => {
                let args_json =
                    serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string());
                input_items.push(json!({
                    "type": "function_call",
                    "call_id": call.id,
                    "name": call.name,
                    "arguments": args_json,
                }));
            }
            Message::ToolResult(result) => {
                input_items.push(json!({
                    "type": "function_call_output",
                    "call_id": result.tool_call_id,
                    "output": result.content,
                }));
            }
            _ => {
                input_items.push(json!({
                    "role": openai_role(msg),
                    "content": msg.content(),
                }));
            }
        }
    }

    let model = request.model.as_ref().unwrap_or(default_model);

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model.as_str()));
    body.insert("input".to_string(), Value::Array(input_items));
    body.insert("stream".to_string(), json!(false));

    if let Some(instructions) = &request.instructions
        && !instructions.trim().is_empty()
    {
        body.insert("instructions".to_string(), json!(instructions));
    }

    if let Some(tokens) = request.max_output_tokens {
        body.insert("max_output_tokens".to_string(), json!(tokens));
    }

    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }

    if !request.tools.is_empty() {
        let tool_defs: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tool_defs));
    }

    if let Some(format) = &request.response_format {
        body.insert(
            "text".to_string(),
            json!({
                "format": {
                    "type": "json_schema",
                    "name": format.name,
                    "schema": format.schema,
                    "strict": true,
                }
            }),
        );
    }

    Value::Object(body)
}

fn usage_from(json: &Value) -> ApiUsage {
    let tokens = |key: &str| {
        json.get("usage")
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    };
    ApiUsage {
        input_tokens: tokens("input_tokens"),
        output_tokens: tokens("output_tokens"),
    }
}

fn parse_function_call(item: &Value) -> Result<ToolCall, ProviderError> {
    let id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Decode("function_call without call_id".to_string()))?;
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Decode("function_call without name".to_string()))?;
    let raw_args = item.get("arguments").and_then(Value::as_str).unwrap_or("{}");

    // Malformed arguments are passed through as a string; schema validation
    // at the tool rejects them with a readable error.
    let arguments = serde_json::from_str(raw_args)
        .unwrap_or_else(|_| Value::String(raw_args.to_string()));

    Ok(ToolCall::new(id, name, arguments))
}

/// Walk a Responses API payload into a [`ChatResponse`].
pub(crate) fn parse_response(json: &Value) -> Result<ChatResponse, ProviderError> {
    match json.get("status").and_then(Value::as_str) {
        Some("failed") => {
            let message = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ProviderError::Failed(message.to_string()));
        }
        Some("incomplete") => {
            let reason = json
                .get("incomplete_details")
                .and_then(|d| d.get("reason"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::warn!(reason, "OpenAI response incomplete");
        }
        _ => {}
    }

    let output = json
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Decode("missing output array".to_string()))?;

    let mut text = String::new();
    let mut has_text = false;
    let mut refusal: Option<String> = None;
    let mut tool_calls = Vec::new();

    for item in output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                let Some(parts) = item.get("content").and_then(Value::as_array) else {
                    continue;
                };
                for part in parts {
                    match part.get("type").and_then(Value::as_str) {
                        Some("output_text") => {
                            if let Some(t) = part.get("text").and_then(Value::as_str) {
                                text.push_str(t);
                                has_text = true;
                            }
                        }
                        Some("refusal") => {
                            refusal = part
                                .get("refusal")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                        }
                        _ => {}
                    }
                }
            }
            Some("function_call") => tool_calls.push(parse_function_call(item)?),
            // Reasoning items and other output kinds carry nothing we replay.
            _ => {}
        }
    }

    Ok(ChatResponse {
        id: json.get("id").and_then(Value::as_str).map(str::to_string),
        text: has_text.then_some(text),
        refusal,
        tool_calls,
        usage: usage_from(json),
    })
}

/// [`ChatBackend`] over `POST {base_url}/v1/responses`.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    endpoint: String,
    config: ApiConfig,
}

impl OpenAIClient {
    pub fn new(config: ApiConfig) -> Result<Self, ProviderError> {
        let (base, allow_http) = validate_base_url(config.base_url())?;
        let endpoint = format!("{}/v1/responses", base.as_str().trim_end_matches('/'));
        let http = http_client_with_timeout(allow_http, config.timeout())?;
        Ok(Self {
            http,
            endpoint,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(self.config.model(), &request);
        let auth_header = format!("Bearer {}", self.config.api_key());

        let outcome = send_with_retry(
            || {
                self.http
                    .post(&self.endpoint)
                    .header("Authorization", &auth_header)
                    .header("content-type", "application/json")
                    .json(&body)
            },
            self.config.retry(),
        )
        .await;

        let response = handle_response(outcome).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_response(&json)
    }
}

impl ChatBackend for OpenAIClient {
    fn respond(&self, request: ChatRequest) -> ChatFut<'_> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonSchemaFormat;
    use crate::retry::RetryConfig;
    use tally_types::{ApiKey, NonEmptyString, ToolDefinition, ToolResult};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user(text: &str) -> Message {
        Message::user(NonEmptyString::new(text).unwrap())
    }

    #[test]
    fn maps_system_message_to_developer_role() {
        let request = ChatRequest::new(vec![
            Message::system(NonEmptyString::new("rules").unwrap()),
            user("hi"),
        ]);
        let body = build_request_body(&ModelName::default(), &request);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["role"], "developer");
        assert_eq!(input[1]["role"], "user");
        assert_eq!(input[1]["content"], "hi");
        assert_eq!(body["stream"], false);
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn encodes_tool_calls_and_outputs() {
        let request = ChatRequest::new(vec![
            user("what is 2+2"),
            Message::tool_use(ToolCall::new(
                "call_1",
                "calculate",
                json!({"expression": "2+2"}),
            )),
            Message::tool_result(ToolResult::success("call_1", "calculate", "4")),
        ]);
        let body = build_request_body(&ModelName::default(), &request);
        let input = body["input"].as_array().unwrap();

        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_1");
        assert_eq!(input[1]["arguments"], r#"{"expression":"2+2"}"#);
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "4");
    }

    #[test]
    fn includes_tools_instructions_and_model_override() {
        let request = ChatRequest::new(vec![user("hi")])
            .with_model(ModelName::known("gpt-4.1-mini"))
            .with_instructions("You are a calculator.")
            .with_tools(vec![ToolDefinition::new(
                "calculate",
                "Evaluate an expression",
                json!({"type": "object"}),
            )]);
        let body = build_request_body(&ModelName::default(), &request);

        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["instructions"], "You are a calculator.");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["name"], "calculate");
        assert!(body.get("text").is_none());
    }

    #[test]
    fn omits_blank_instructions() {
        let request = ChatRequest::new(vec![user("hi")]).with_instructions("   ");
        let body = build_request_body(&ModelName::default(), &request);
        assert!(body.get("instructions").is_none());
    }

    #[test]
    fn structured_output_sets_strict_json_schema() {
        let schema = json!({"type": "object", "properties": {}});
        let request = ChatRequest::new(vec![user("hi")])
            .with_response_format(JsonSchemaFormat::new("facts", schema.clone()));
        let body = build_request_body(&ModelName::default(), &request);

        let format = &body["text"]["format"];
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["name"], "facts");
        assert_eq!(format["strict"], true);
        assert_eq!(format["schema"], schema);
    }

    #[test]
    fn parses_text_and_usage() {
        let json = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "The answer "},
                    {"type": "output_text", "text": "is 4."}
                ]}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 5}
        });
        let response = parse_response(&json).unwrap();
        assert_eq!(response.id.as_deref(), Some("resp_1"));
        assert_eq!(response.text.as_deref(), Some("The answer is 4."));
        assert_eq!(response.usage.total(), 17);
        assert!(!response.has_tool_calls());
    }

    #[test]
    fn parses_function_calls() {
        let json = json!({
            "status": "completed",
            "output": [{
                "type": "function_call",
                "id": "fc_1",
                "call_id": "call_1",
                "name": "calculate",
                "arguments": "{\"expression\":\"100*0.21\"}"
            }]
        });
        let response = parse_response(&json).unwrap();
        assert!(response.text.is_none());
        assert_eq!(
            response.tool_calls,
            vec![ToolCall::new(
                "call_1",
                "calculate",
                json!({"expression": "100*0.21"})
            )]
        );
    }

    #[test]
    fn parses_refusal() {
        let json = json!({
            "output": [{"type": "message", "content": [
                {"type": "refusal", "refusal": "I can't help with that."}
            ]}]
        });
        let response = parse_response(&json).unwrap();
        assert!(response.text.is_none());
        assert_eq!(response.refusal.as_deref(), Some("I can't help with that."));
    }

    #[test]
    fn failed_status_is_an_error() {
        let json = json!({
            "status": "failed",
            "error": {"message": "server overloaded"},
            "output": []
        });
        match parse_response(&json) {
            Err(ProviderError::Failed(msg)) => assert_eq!(msg, "server overloaded"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn missing_output_is_decode_error() {
        assert!(matches!(
            parse_response(&json!({"status": "completed"})),
            Err(ProviderError::Decode(_))
        ));
    }

    fn test_client(server: &MockServer) -> OpenAIClient {
        let config = ApiConfig::new(ApiKey::new("sk-test").unwrap(), ModelName::default())
            .with_base_url(server.uri())
            .with_retry(RetryConfig::disabled());
        OpenAIClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn respond_posts_to_responses_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "status": "completed",
                "output": [{"type": "message", "content": [
                    {"type": "output_text", "text": "4"}
                ]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let response = client
            .respond(ChatRequest::new(vec![user("2+2")]))
            .await
            .unwrap();
        assert_eq!(response.text.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn respond_maps_error_status_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        match client.respond(ChatRequest::new(vec![user("2+2")])).await {
            Err(ProviderError::Api { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_remote_plain_http() {
        let config = ApiConfig::new(ApiKey::new("sk-test").unwrap(), ModelName::default())
            .with_base_url("http://example.com");
        assert!(matches!(
            OpenAIClient::new(config),
            Err(ProviderError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let config = ApiConfig::new(ApiKey::new("sk-test").unwrap(), ModelName::default())
            .with_base_url("http://127.0.0.1:9999/");
        let client = OpenAIClient::new(config).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9999/v1/responses");
    }
}
