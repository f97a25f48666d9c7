//! End-to-end encrypted push integration tests.
//!
//! A `push` frame with an encrypted envelope is decrypted when a password
//! is configured; without one, the push is retained with its envelope and
//! a diagnostic event is emitted. The original envelope survives either
//! way.

use pb_agent::agent::Agent;
use pb_agent::bus::BusEvent;
use pb_agent::config::{AgentConfig, load_config_from_str};
use pb_agent::crypto::{EncryptionKey, encrypt_envelope};
use pb_agent::state::AgentState;
use pb_agent::store::Store;
use pb_test_utils::{MockApiServer, MockStreamServer};
use serde_json::json;
use std::time::Duration;

const TOKEN: &str = "AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHHII";
const PASSWORD: &str = "hunter2";

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

async fn wait_for_display_entry(agent: &Agent, timeout_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while agent.snapshot().recent_pushes.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "push never reached the display list"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// E2E: with a configured password, an encrypted push frame is decrypted,
/// merged over its envelope, and surfaced with `encrypted = false` while
/// the envelope keeps the ciphertext.
#[tokio::test]
async fn encrypted_push_decrypts_with_password() {
    let api = MockApiServer::start(TOKEN).await.unwrap();
    let stream = MockStreamServer::start().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("agent.sqlite3");
    {
        let store = Store::open(&store_path).unwrap();
        store.set_token(TOKEN).unwrap();
        store.set_encryption_password(PASSWORD).unwrap();
    }

    let mut agent = Agent::new(test_config(&api.base_url(), &stream.base_url(), &store_path))
        .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert!(stream.wait_for_connections(1, 2000).await);

    // The mock user iden is the PBKDF2 salt.
    let key = EncryptionKey::derive(PASSWORD, "u-mock");
    let ciphertext = encrypt_envelope(r#"{"type":"note","title":"Hi","body":"secret"}"#, &key);
    stream.send_push_frame(&json!({
        "iden": "enc-1",
        "created": 400.0,
        "modified": 400.0,
        "encrypted": true,
        "ciphertext": ciphertext,
    }));

    wait_for_display_entry(&agent, 2000).await;
    let snapshot = agent.snapshot();
    let entry = &snapshot.recent_pushes[0];
    assert_eq!(entry.view.title.as_deref(), Some("Hi"));
    assert_eq!(entry.view.body.as_deref(), Some("secret"));
    assert_eq!(entry.view.encrypted, Some(false), "decrypted view");
    assert_eq!(entry.view.iden.as_deref(), Some("enc-1"), "envelope metadata kept");
    assert_eq!(entry.envelope.encrypted, Some(true), "envelope preserved");
    assert!(entry.envelope.ciphertext.is_some(), "ciphertext preserved");

    agent.stop().await;
}

/// E2E: without a password the push stays in the display list as an
/// encrypted envelope and a diagnostic event fires.
#[tokio::test]
async fn encrypted_push_without_password_keeps_envelope() {
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
    let key = EncryptionKey::derive(PASSWORD, "u-mock");
    let ciphertext = encrypt_envelope(r#"{"type":"note","title":"Hi"}"#, &key);
    stream.send_push_frame(&json!({
        "iden": "enc-2",
        "encrypted": true,
        "ciphertext": ciphertext,
    }));

    wait_for_display_entry(&agent, 2000).await;
    let snapshot = agent.snapshot();
    let entry = &snapshot.recent_pushes[0];
    assert_eq!(entry.view.encrypted, Some(true), "still an envelope");
    assert!(entry.view.is_renderable(), "shown as an encrypted message");

    let diagnostic = tokio::time::timeout(Duration::from_millis(2000), async {
        loop {
            match bus.recv().await {
                Ok(BusEvent::DecryptDiagnostic { iden, .. }) => return iden,
                Ok(_) => continue,
                Err(e) => panic!("bus closed: {e}"),
            }
        }
    })
    .await
    .expect("expected a decrypt diagnostic");
    assert_eq!(diagnostic.as_deref(), Some("enc-2"));

    agent.stop().await;
}
