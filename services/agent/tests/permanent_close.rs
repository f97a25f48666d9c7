//! Permanent stream failure integration tests.
//!
//! Close code 4001 (auth revoked) moves the agent to ERROR, sets the ERR
//! badge, surfaces a persistent notification, and never schedules a
//! reconnect. A fresh token recovers via API_KEY_SET.

use pb_agent::agent::Agent;
use pb_agent::config::{AgentConfig, load_config_from_str};
use pb_agent::notify::{Notification, Notifier};
use pb_agent::state::AgentState;
use pb_agent::store::Store;
use pb_test_utils::{MockApiServer, MockStreamServer};
use std::sync::{Arc, Mutex};
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

/// Records notifications and badge text for assertions.
#[derive(Default)]
struct RecordingNotifier {
    notifications: Mutex<Vec<(String, Notification)>>,
    badge: Mutex<Option<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, id: &str, notification: &Notification) {
        self.notifications
            .lock()
            .unwrap()
            .push((id.to_owned(), notification.clone()));
    }

    fn clear(&self, _id: &str) {}

    fn set_badge(&self, text: &str) {
        *self.badge.lock().unwrap() = Some(text.to_owned());
    }

    fn clear_badge(&self) {
        *self.badge.lock().unwrap() = None;
    }
}

/// E2E: auth revocation on the stream parks the agent in ERROR until the
/// user supplies a token again.
#[tokio::test]
async fn permanent_close_stops_reconnecting_until_new_token() {
    let api = MockApiServer::start(TOKEN).await.unwrap();
    let stream = MockStreamServer::start().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("agent.sqlite3");
    Store::open(&store_path).unwrap().set_token(TOKEN).unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let mut agent = Agent::with_notifier(
        test_config(&api.base_url(), &stream.base_url(), &store_path),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    )
    .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert!(stream.wait_for_connections(1, 2000).await);
    assert!(notifier.badge.lock().unwrap().is_none());

    stream.close_latest(4001);
    wait_for_state(&agent, AgentState::Error, 2000).await;

    assert_eq!(notifier.badge.lock().unwrap().as_deref(), Some("ERR"));
    assert!(
        notifier
            .notifications
            .lock()
            .unwrap()
            .iter()
            .any(|(_, n)| n.persistent),
        "a persistent error notification was surfaced"
    );

    // Well past the reconnect delay: no new connection attempts.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(stream.total_connections(), 1, "no reconnect after permanent close");
    assert_eq!(agent.current_state(), AgentState::Error);

    // User pastes a token: API_KEY_SET re-initializes and reconnects.
    agent.set_token(TOKEN);
    wait_for_state(&agent, AgentState::Ready, 5000).await;
    assert!(stream.wait_for_connections(2, 2000).await, "fresh connection");
    assert!(
        notifier.badge.lock().unwrap().is_none(),
        "badge cleared on successful connect"
    );

    agent.stop().await;
}
