//! User-visible notifications and the connection-status badge.
//!
//! The agent core only talks to the [`Notifier`] trait; the default
//! implementation logs, and tests install a recording impl. Message text
//! must never include secrets (token, ciphertext, decrypted bodies are
//! fine for the user's own notifications but never for error surfaces).

use pb_protocol::Push;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Bound on the notification id → push map.
pub const NOTIFICATION_MAP_CAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Persistent notifications survive the auto-dismiss timeout.
    pub persistent: bool,
}

/// Port for surfacing notifications and badge state to the host.
pub trait Notifier: Send + Sync {
    fn notify(&self, id: &str, notification: &Notification);
    fn clear(&self, id: &str);
    fn set_badge(&self, text: &str);
    fn clear_badge(&self);
}

/// Default notifier: structured log lines.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, id: &str, notification: &Notification) {
        info!(
            id,
            title = %notification.title,
            persistent = notification.persistent,
            "notification"
        );
    }

    fn clear(&self, id: &str) {
        info!(id, "notification cleared");
    }

    fn set_badge(&self, text: &str) {
        info!(text, "badge set");
    }

    fn clear_badge(&self) {
        info!("badge cleared");
    }
}

/// Bounded map from notification id to the push that produced it, so an
/// embedding UI can resolve clicks. Oldest entries are evicted first.
pub struct NotificationMap {
    inner: Mutex<NotificationMapInner>,
}

struct NotificationMapInner {
    order: VecDeque<String>,
    by_id: HashMap<String, Push>,
}

impl NotificationMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NotificationMapInner {
                order: VecDeque::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, id: &str, push: Push) {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_id.insert(id.to_owned(), push).is_none() {
            inner.order.push_back(id.to_owned());
        }
        while inner.order.len() > NOTIFICATION_MAP_CAP {
            if let Some(evicted) = inner.order.pop_front() {
                inner.by_id.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Push> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Push> {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|x| x != id);
        inner.by_id.remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NotificationMap {
    fn default() -> Self {
        Self::new()
    }
}
