//! Invalid-cursor recovery integration tests.
//!
//! An `invalid_cursor` error from the incremental pipeline resets the
//! watermark (the unsafe path), clears the display list, and re-runs
//! initialization; the re-init performs a fresh seed run.

use pb_agent::agent::Agent;
use pb_agent::config::{AgentConfig, load_config_from_str};
use pb_agent::state::AgentState;
use pb_agent::store::Store;
use pb_test_utils::{MockApiServer, MockStreamServer};
use serde_json::json;
use std::time::Duration;

const TOKEN: &str = "AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHHII";

fn test_config(api_base: &str, stream_base: &str, store_path: &std::path::Path) -> AgentConfig {
    let toml = format!(
        r#"
schema_version = 1

[server]
api_base = "{api_base}"
stream_base = "{stream_base}"

[store]
sqlite_path = "{}"

[timing]
reconnect_delay_ms = 50
polling_period_ms = 100
long_sleep_period_ms = 600000
http_timeout_ms = 2000
"#,
        store_path.display()
    );
    load_config_from_str(&toml).expect("test config must parse")
}

async fn wait_for_state(agent: &Agent, target: AgentState, timeout_ms: u64) {
    let mut watch = agent.state_watch();
    tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        watch.wait_for(|s| *s == target),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
    .unwrap();
}

/// E2E: invalid cursor on a push tickle triggers recovery and a re-seed
/// at the newest server `modified`.
#[tokio::test]
async fn invalid_cursor_recovery_reseeds_watermark() {
    let api = MockApiServer::start(TOKEN).await.unwrap();
    let stream = MockStreamServer::start().await.unwrap();
    api.add_push(json!({
        "iden": "p1", "type": "note", "title": "hi",
        "created": 100.0, "modified": 250.5,
    }));

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("agent.sqlite3");
    Store::open(&store_path).unwrap().set_token(TOKEN).unwrap();

    let mut agent = Agent::new(test_config(&api.base_url(), &stream.base_url(), &store_path))
        .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert_eq!(agent.snapshot().last_modified_cutoff, 250.5, "seeded");

    // The next incremental fetch fails with invalid_cursor; a newer push
    // exists server-side by then.
    api.set_invalid_cursor_once();
    api.add_push(json!({
        "iden": "p2", "type": "note", "title": "newer",
        "created": 290.0, "modified": 300.0,
    }));
    stream.send_tickle("push");

    // Recovery re-initializes; the second seed run lands on the newest
    // modified.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = agent.snapshot();
        if snapshot.last_modified_cutoff == 300.0 && !snapshot.recent_pushes.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovery did not reseed (cutoff {})",
            snapshot.last_modified_cutoff
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(api.hits("GET /pushes?modified_after"), 1, "one failed fetch");
    assert_eq!(api.hits("GET /pushes?limit=1"), 2, "seed ran twice");
    let store = Store::open(&store_path).unwrap();
    assert_eq!(store.cutoff().unwrap(), 300.0, "watermark persisted");

    agent.stop().await;
}
