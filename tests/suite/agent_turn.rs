//! Full agent turns: tool loop, background extraction, memory projection

use std::sync::Arc;

use serde_json::json;
use tally_context::{FactStore, ModelExtractionClient};
use tally_engine::Agent;
use tally_providers::{ChatBackend, LoggingBackend};
use tally_tools::ToolRegistry;

use crate::common::{
    extraction_requests, function_call_item, message_item, mount_answer, mount_extraction,
    primary_requests, start_openai_mock, test_client,
};

fn agent_for(server: &wiremock::MockServer) -> Agent {
    let backend: Arc<dyn ChatBackend> = Arc::new(LoggingBackend::new(test_client(server)));
    let extractor = Arc::new(ModelExtractionClient::new(Arc::clone(&backend)));
    Agent::new(backend, ToolRegistry::with_builtins(), "You are a calculator.")
        .with_extractor(extractor, FactStore::new())
}

#[tokio::test]
async fn named_result_is_remembered_for_the_next_turn() {
    let server = start_openai_mock().await;
    mount_extraction(
        &server,
        &json!({
            "namedValues": [{ "name": "sleva", "value": 21 }],
            "lastCalculatedResult": 21
        }),
    )
    .await;
    mount_answer(
        &server,
        vec![function_call_item(
            "call_1",
            "calculate",
            &json!({ "expression": "100 * 0.21" }),
        )],
        Some(1),
    )
    .await;
    mount_answer(&server, vec![message_item("That is 21, saved as sleva.")], None).await;

    let mut agent = agent_for(&server);

    let answer = agent.run_turn("100 * 0.21, call it sleva").await.unwrap();
    assert_eq!(answer, "That is 21, saved as sleva.");
    assert_eq!(agent.memory_status().await.as_deref(), Some("sleva=21"));

    agent.run_turn("what is sleva times 2?").await.unwrap();
    agent.shutdown().await.unwrap();

    let primary = primary_requests(&server).await;
    assert_eq!(primary.len(), 3);

    assert_eq!(primary[0]["instructions"], "You are a calculator.");
    assert_eq!(primary[0]["tools"][0]["name"], "calculate");

    let tool_round = primary[1]["input"].as_array().unwrap();
    assert_eq!(tool_round[1]["type"], "function_call");
    assert_eq!(tool_round[2]["type"], "function_call_output");
    assert_eq!(tool_round[2]["call_id"], "call_1");
    assert_eq!(tool_round[2]["output"], "21");

    let second_turn = primary[2]["instructions"].as_str().unwrap();
    assert!(second_turn.starts_with("You are a calculator.\n\n"));
    assert!(second_turn.contains("sleva = 21"));
    assert!(second_turn.contains("Last calculated result: 21"));
    assert_eq!(primary[2]["input"].as_array().unwrap().len(), 5);

    let extraction = extraction_requests(&server).await;
    assert_eq!(extraction.len(), 2);
    let transcript = extraction[0]["input"][0]["content"].as_str().unwrap();
    assert!(transcript.contains("TOOL CALL calculate"));
    assert!(transcript.contains("TOOL RESULT calculate: 21"));
}

#[tokio::test]
async fn failed_extraction_leaves_memory_empty() {
    let server = start_openai_mock().await;
    mount_extraction(&server, &json!("not an object")).await;
    mount_answer(&server, vec![message_item("4")], None).await;

    let mut agent = agent_for(&server);
    assert_eq!(agent.run_turn("2 + 2, call it four").await.unwrap(), "4");

    assert!(agent.memory_status().await.is_none());
    assert!(agent.memory().unwrap().snapshot().await.is_empty());

    agent.run_turn("and again").await.unwrap();
    let primary = primary_requests(&server).await;
    assert_eq!(primary[1]["instructions"], "You are a calculator.");
}

#[tokio::test]
async fn calculator_errors_reach_the_model_as_tool_errors() {
    let server = start_openai_mock().await;
    mount_extraction(
        &server,
        &json!({ "namedValues": [], "lastCalculatedResult": null }),
    )
    .await;
    mount_answer(
        &server,
        vec![function_call_item(
            "call_1",
            "calculate",
            &json!({ "expression": "1 / 0" }),
        )],
        Some(1),
    )
    .await;
    mount_answer(&server, vec![message_item("Division by zero.")], None).await;

    let mut agent = agent_for(&server);
    agent.run_turn("1 / 0").await.unwrap();

    let primary = primary_requests(&server).await;
    let output = primary[1]["input"][2]["output"].as_str().unwrap();
    assert!(output.starts_with("Calculation error:"));
    assert!(agent.memory_status().await.is_none());
}
