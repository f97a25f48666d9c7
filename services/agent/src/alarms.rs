//! Named alarms.
//!
//! One-shot and periodic timers addressed by reserved names. Alarms with
//! the same name coalesce: scheduling a one-shot that is already pending
//! keeps the earlier deadline, and a periodic is never doubled. Fires are
//! delivered as names on an mpsc channel consumed by the agent loop, so
//! timer callbacks never re-enter the subsystems that scheduled them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One-shot reconnect after a transient stream close.
pub const ALARM_WEBSOCKET_RECONNECT: &str = "websocketReconnect";
/// Periodic heartbeat watchdog.
pub const ALARM_HEALTH_CHECK: &str = "websocketHealthCheck";
/// Periodic display refresh while in polling fallback.
pub const ALARM_POLLING_FALLBACK: &str = "pollingFallback";
/// Periodic check that resurrects an idle/errored agent.
pub const ALARM_LONG_SLEEP_RECOVERY: &str = "longSleepRecovery";

struct AlarmEntry {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

struct AlarmsInner {
    entries: Mutex<HashMap<String, AlarmEntry>>,
    next_generation: Mutex<u64>,
    fire_tx: mpsc::UnboundedSender<String>,
}

/// Shared handle to the alarm scheduler.
#[derive(Clone)]
pub struct Alarms {
    inner: Arc<AlarmsInner>,
}

impl Alarms {
    /// Create the scheduler and the receiver the agent loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(AlarmsInner {
                    entries: Mutex::new(HashMap::new()),
                    next_generation: Mutex::new(0),
                    fire_tx,
                }),
            },
            fire_rx,
        )
    }

    /// Schedule a one-shot alarm. Coalesces with a pending alarm of the
    /// same name. The entry is removed when it fires.
    pub fn schedule_once(&self, name: &str, delay: Duration) {
        let mut entries = self.inner.entries.lock().unwrap();
        if entries.contains_key(name) {
            debug!(name, "alarm already pending, coalescing");
            return;
        }
        let generation = self.bump_generation();
        let inner = Arc::clone(&self.inner);
        let task_name = name.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Remove our own entry first so a handler rescheduling the
            // same name is not treated as a coalesce.
            {
                let mut entries = inner.entries.lock().unwrap();
                if entries.get(&task_name).is_some_and(|e| e.generation == generation) {
                    entries.remove(&task_name);
                }
            }
            let _ = inner.fire_tx.send(task_name);
        });
        entries.insert(name.to_owned(), AlarmEntry { generation, handle });
        debug!(name, delay_ms = delay.as_millis() as u64, "one-shot alarm scheduled");
    }

    /// Schedule a periodic alarm. A second call with the same name is a
    /// no-op while the first is active.
    pub fn schedule_periodic(&self, name: &str, period: Duration) {
        let mut entries = self.inner.entries.lock().unwrap();
        if entries.contains_key(name) {
            debug!(name, "periodic alarm already active, coalescing");
            return;
        }
        let generation = self.bump_generation();
        let inner = Arc::clone(&self.inner);
        let task_name = name.to_owned();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if inner.fire_tx.send(task_name.clone()).is_err() {
                    break;
                }
            }
        });
        entries.insert(name.to_owned(), AlarmEntry { generation, handle });
        debug!(name, period_ms = period.as_millis() as u64, "periodic alarm scheduled");
    }

    /// Cancel an alarm by name. Cancelling a name with no alarm is a no-op.
    pub fn cancel(&self, name: &str) {
        if let Some(entry) = self.inner.entries.lock().unwrap().remove(name) {
            entry.handle.abort();
            debug!(name, "alarm cancelled");
        }
    }

    /// Whether an alarm with this name is currently scheduled.
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.inner.entries.lock().unwrap().contains_key(name)
    }

    /// Cancel everything (agent shutdown).
    pub fn cancel_all(&self) {
        let mut entries = self.inner.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }

    fn bump_generation(&self) -> u64 {
        let mut g = self.inner.next_generation.lock().unwrap();
        *g += 1;
        *g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_clears() {
        let (alarms, mut rx) = Alarms::new();
        alarms.schedule_once("a", Duration::from_millis(100));
        assert!(alarms.is_scheduled("a"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert!(!alarms.is_scheduled("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_one_shots_coalesce() {
        let (alarms, mut rx) = Alarms::new();
        alarms.schedule_once("a", Duration::from_millis(100));
        alarms.schedule_once("a", Duration::from_millis(100));
        alarms.schedule_once("a", Duration::from_millis(5000));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert!(rx.try_recv().is_err(), "coalesced alarms fire exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_repeatedly_until_cancelled() {
        let (alarms, mut rx) = Alarms::new();
        alarms.schedule_periodic("p", Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(350)).await;
        assert_eq!(rx.recv().await.unwrap(), "p");
        assert_eq!(rx.recv().await.unwrap(), "p");
        assert_eq!(rx.recv().await.unwrap(), "p");

        alarms.cancel("p");
        assert!(!alarms.is_scheduled("p"));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_one_shot_prevents_fire() {
        let (alarms, mut rx) = Alarms::new();
        alarms.schedule_once("a", Duration::from_millis(100));
        alarms.cancel("a");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_after_fire_is_a_fresh_alarm() {
        let (alarms, mut rx) = Alarms::new();
        alarms.schedule_once("a", Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await.unwrap(), "a");

        alarms.schedule_once("a", Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await.unwrap(), "a");
    }
}
