//! Session persistence through config, the agent and the session file

use std::fs;
use std::path::Path;

use serde_json::{Value, json};
use tally_engine::{Agent, Settings, TallyConfig};

use crate::common::{
    message_item, mount_answer, mount_extraction, primary_requests, start_openai_mock,
};

fn write_config(dir: &Path, base_url: &str, session: &Path) -> TallyConfig {
    let path = dir.join("config.toml");
    fs::write(
        &path,
        format!(
            "[app]\n\
             model = \"gpt-4o-mini\"\n\
             instructions = \"You are a calculator.\"\n\
             \n\
             [api_keys]\n\
             openai = \"test-key\"\n\
             \n\
             [openai]\n\
             base_url = \"{base_url}\"\n\
             timeout_secs = 5\n\
             \n\
             [memory]\n\
             session_path = \"{}\"\n",
            session.display()
        ),
    )
    .unwrap();
    TallyConfig::load_from(path).unwrap()
}

fn settings(dir: &Path, base_url: &str, session: &Path) -> Settings {
    Settings::resolve(Some(write_config(dir, base_url, session)), |_| None).unwrap()
}

#[tokio::test]
async fn saved_values_survive_a_restart() {
    let server = start_openai_mock().await;
    mount_extraction(
        &server,
        &json!({
            "namedValues": [{ "name": "sleva", "value": 21 }],
            "lastCalculatedResult": 21
        }),
    )
    .await;
    mount_answer(&server, vec![message_item("Saved.")], None).await;

    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("state").join("session.json");
    let settings = settings(dir.path(), &server.uri(), &session);
    assert!(settings.memory_enabled);

    let mut first = Agent::from_settings(&settings).unwrap();
    first.run_turn("21, call it sleva").await.unwrap();
    first.shutdown().await.unwrap();
    drop(first);

    let blob: Value = serde_json::from_str(&fs::read_to_string(&session).unwrap()).unwrap();
    assert_eq!(blob["savedValues"]["sleva"], json!(21));
    assert_eq!(blob["lastResult"], "21");

    let mut second = Agent::from_settings(&settings).unwrap();
    assert_eq!(second.memory_status().await.as_deref(), Some("sleva=21"));
    second.run_turn("what is sleva?").await.unwrap();

    let primary = primary_requests(&server).await;
    let restored = primary.last().unwrap()["instructions"].as_str().unwrap();
    assert!(restored.contains("sleva = 21"));
    assert_eq!(
        primary.last().unwrap()["input"].as_array().unwrap().len(),
        1,
        "conversation history is not persisted"
    );
}

#[tokio::test]
async fn corrupt_session_file_starts_empty() {
    let server = start_openai_mock().await;
    mount_extraction(
        &server,
        &json!({ "namedValues": null, "lastCalculatedResult": null }),
    )
    .await;
    mount_answer(&server, vec![message_item("4")], None).await;

    let dir = tempfile::tempdir().unwrap();
    let session = dir.path().join("session.json");
    fs::write(&session, "[1, 2, 3]").unwrap();
    let settings = settings(dir.path(), &server.uri(), &session);

    let mut agent = Agent::from_settings(&settings).unwrap();
    assert!(agent.memory_status().await.is_none());
    agent.run_turn("2 + 2").await.unwrap();
    agent.shutdown().await.unwrap();

    let primary = primary_requests(&server).await;
    assert_eq!(primary[0]["instructions"], "You are a calculator.");

    let blob: Value = serde_json::from_str(&fs::read_to_string(&session).unwrap()).unwrap();
    assert_eq!(blob["savedValues"], json!({}));
}
