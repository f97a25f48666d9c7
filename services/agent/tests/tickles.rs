//! Tickle handling integration tests.
//!
//! A `push` tickle re-runs the incremental pipeline (advancing the
//! watermark) and refreshes the display; a `device` tickle re-fetches the
//! device list and broadcasts the update.

use pb_agent::agent::Agent;
use pb_agent::bus::BusEvent;
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

/// A push tickle picks up pushes newer than the watermark, advances it,
/// and publishes a pipeline event per push.
#[tokio::test]
async fn push_tickle_advances_watermark_and_publishes() {
    let api = MockApiServer::start(TOKEN).await.unwrap();
    let stream = MockStreamServer::start().await.unwrap();
    api.add_push(json!({
        "iden": "p1", "type": "note", "title": "seed anchor",
        "created": 100.0, "modified": 100.0,
    }));

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("agent.sqlite3");
    Store::open(&store_path).unwrap().set_token(TOKEN).unwrap();

    let mut agent = Agent::new(test_config(&api.base_url(), &stream.base_url(), &store_path))
        .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert!(stream.wait_for_connections(1, 2000).await);
    assert_eq!(agent.snapshot().last_modified_cutoff, 100.0);

    let mut bus = agent.subscribe();
    api.add_push(json!({
        "iden": "p2", "type": "note", "title": "fresh",
        "created": 150.0, "modified": 180.0,
    }));
    // A dismissed push moves the watermark but is never surfaced.
    api.add_push(json!({
        "iden": "p3", "type": "note", "title": "dismissed",
        "created": 151.0, "modified": 190.0, "dismissed": true,
    }));
    stream.send_tickle("push");

    let push = tokio::time::timeout(Duration::from_millis(3000), async {
        loop {
            match bus.recv().await {
                Ok(BusEvent::Pipeline1Push { push, .. }) => return push,
                Ok(_) => continue,
                Err(e) => panic!("bus closed: {e}"),
            }
        }
    })
    .await
    .expect("expected a pipeline event");
    assert_eq!(push.iden.as_deref(), Some("p2"));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(2000);
    while agent.snapshot().last_modified_cutoff != 190.0 {
        assert!(tokio::time::Instant::now() < deadline, "watermark did not advance");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(api.hits("GET /pushes?modified_after"), 1);
    assert!(
        agent
            .snapshot()
            .recent_pushes
            .iter()
            .all(|p| p.view.iden.as_deref() != Some("p3")),
        "dismissed pushes stay out of the display list"
    );

    agent.stop().await;
}

/// A device tickle refreshes the device list and broadcasts it.
#[tokio::test]
async fn device_tickle_refreshes_device_list() {
    let api = MockApiServer::start(TOKEN).await.unwrap();
    let stream = MockStreamServer::start().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("agent.sqlite3");
    Store::open(&store_path).unwrap().set_token(TOKEN).unwrap();

    let mut agent = Agent::new(test_config(&api.base_url(), &stream.base_url(), &store_path))
        .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert!(stream.wait_for_connections(1, 2000).await);

    let mut bus = agent.subscribe();
    api.add_device(json!({
        "iden": "d-phone", "nickname": "Phone", "type": "android", "active": true,
    }));
    stream.send_tickle("device");

    let devices = tokio::time::timeout(Duration::from_millis(3000), async {
        loop {
            match bus.recv().await {
                Ok(BusEvent::DevicesUpdated(devices)) => return devices,
                Ok(_) => continue,
                Err(e) => panic!("bus closed: {e}"),
            }
        }
    })
    .await
    .expect("expected a devices update");
    assert!(devices.iter().any(|d| d.iden == "d-phone"));
    assert!(
        agent.snapshot().devices.iter().any(|d| d.iden == "d-phone"),
        "cache mirrors the refreshed list"
    );

    agent.stop().await;
}
