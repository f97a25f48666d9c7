//! In-memory session cache.
//!
//! The process-wide authoritative view of user/devices/chats/recent pushes
//! plus the cutoff watermark. Mutations come only from the sync pipelines
//! and the stream handlers; every other subsystem reads snapshots.
//!
//! The cutoff can only move forward through [`SessionCache::safe_set_cutoff`].
//! The two reset paths (logout, invalid-cursor recovery) go through
//! [`SessionCache::unsafe_reset_cutoff`].

use pb_protocol::{Chat, Device, Push, User};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

/// Display-list bound: the last N renderable server pushes.
pub const RECENT_PUSHES_CAP: usize = 50;

/// Wall-clock unix seconds. Persisted (`cached_at`), so monotonic time is
/// not an option here.
pub fn unix_now() -> f64 {
    let ms = chrono::Utc::now().timestamp_millis();
    ms as f64 / 1000.0
}

/// A display-list entry.
///
/// `envelope` is the push exactly as the server delivered it; `view` is
/// what a UI should render. For an encrypted push that was successfully
/// decrypted, `view` is the merged plaintext (with `encrypted = false`)
/// while `envelope` still carries the ciphertext, so a password change can
/// re-attempt decryption later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPush {
    pub envelope: Push,
    pub view: Push,
}

impl DisplayPush {
    pub fn plain(push: Push) -> Self {
        Self {
            envelope: push.clone(),
            view: push,
        }
    }

    pub fn decrypted(envelope: Push, view: Push) -> Self {
        Self { envelope, view }
    }
}

/// The cached session, both the live in-memory view and the persisted
/// blob layout (`cachedSession` store key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionState {
    pub user: Option<User>,
    pub devices: Vec<Device>,
    pub chats: Vec<Chat>,
    pub recent_pushes: Vec<DisplayPush>,
    pub is_authenticated: bool,
    /// Unix seconds of the last mutation, for UI staleness hints.
    pub last_updated: Option<f64>,
    pub auto_open_links: bool,
    pub device_nickname: String,
    pub last_modified_cutoff: f64,
    /// Unix seconds when the session blob was persisted; drives the
    /// cache-first fast path.
    pub cached_at: Option<f64>,
}

impl SessionState {
    /// Freshness rule: `cached_at` set, younger than `ttl_ms`, and the
    /// session was authenticated. Exactly at the TTL counts as stale.
    pub fn is_fresh(&self, now: f64, ttl_ms: u64) -> bool {
        match self.cached_at {
            Some(cached_at) => {
                self.is_authenticated && (now - cached_at) * 1000.0 < ttl_ms as f64
            }
            None => false,
        }
    }
}

/// Shared handle to the session cache.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<RwLock<SessionState>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionState::default())),
        }
    }

    /// Copy of the full state. Readers never hold the lock across awaits.
    pub fn snapshot(&self) -> SessionState {
        self.inner.read().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().unwrap().is_authenticated
    }

    pub fn cutoff(&self) -> f64 {
        self.inner.read().unwrap().last_modified_cutoff
    }

    pub fn user_iden(&self) -> Option<String> {
        self.inner.read().unwrap().user.as_ref().map(|u| u.iden.clone())
    }

    /// Replace the whole state (cache-first hydration from the store blob).
    pub fn hydrate(&self, state: SessionState) {
        *self.inner.write().unwrap() = state;
    }

    /// Mutate under the write lock; stamps `last_updated`.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.inner.write().unwrap();
        let out = f(&mut guard);
        guard.last_updated = Some(unix_now());
        out
    }

    // -----------------------------------------------------------------------
    // Cutoff watermark
    // -----------------------------------------------------------------------

    /// Advance the cutoff. Rejects non-positive and decreasing values;
    /// setting the current value again is an accepted no-op.
    ///
    /// Returns whether the cutoff now equals `candidate`.
    pub fn safe_set_cutoff(&self, candidate: f64) -> bool {
        let mut guard = self.inner.write().unwrap();
        if !candidate.is_finite() || candidate <= 0.0 {
            error!(candidate, "rejected non-positive cutoff");
            return false;
        }
        if candidate < guard.last_modified_cutoff {
            warn!(
                candidate,
                current = guard.last_modified_cutoff,
                "rejected backwards cutoff"
            );
            return false;
        }
        guard.last_modified_cutoff = candidate;
        true
    }

    /// Reset the cutoff to 0. Only the logout and invalid-cursor recovery
    /// paths may call this.
    pub fn unsafe_reset_cutoff(&self) {
        self.inner.write().unwrap().last_modified_cutoff = 0.0;
    }

    // -----------------------------------------------------------------------
    // Display list
    // -----------------------------------------------------------------------

    /// Wholesale replacement by the display pipeline.
    pub fn replace_recent_pushes(&self, pushes: Vec<DisplayPush>) {
        self.update(|s| {
            s.recent_pushes = pushes;
            s.recent_pushes.truncate(RECENT_PUSHES_CAP);
        });
    }

    /// Prepend one push (direct stream arrival), keeping the list bounded.
    pub fn prepend_recent_push(&self, push: DisplayPush) {
        self.update(|s| {
            s.recent_pushes.insert(0, push);
            s.recent_pushes.truncate(RECENT_PUSHES_CAP);
        });
    }

    pub fn clear_recent_pushes(&self) {
        self.update(|s| s.recent_pushes.clear());
    }

    // -----------------------------------------------------------------------
    // Logout
    // -----------------------------------------------------------------------

    /// Reset to initial values; the cutoff goes through the unsafe path.
    pub fn reset(&self) {
        let mut guard = self.inner.write().unwrap();
        let nickname = guard.device_nickname.clone();
        *guard = SessionState {
            device_nickname: nickname,
            ..SessionState::default()
        };
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(iden: &str) -> DisplayPush {
        DisplayPush::plain(Push {
            iden: Some(iden.to_owned()),
            ..Push::default()
        })
    }

    #[test]
    fn safe_set_cutoff_only_moves_forward() {
        let cache = SessionCache::new();
        assert!(!cache.safe_set_cutoff(0.0));
        assert!(!cache.safe_set_cutoff(-1.0));
        assert_eq!(cache.cutoff(), 0.0);

        assert!(cache.safe_set_cutoff(100.5));
        assert_eq!(cache.cutoff(), 100.5);

        // Idempotent for the current value.
        assert!(cache.safe_set_cutoff(100.5));
        assert_eq!(cache.cutoff(), 100.5);

        assert!(!cache.safe_set_cutoff(99.0));
        assert_eq!(cache.cutoff(), 100.5);

        assert!(cache.safe_set_cutoff(101.0));
        assert_eq!(cache.cutoff(), 101.0);
    }

    #[test]
    fn unsafe_reset_returns_to_zero() {
        let cache = SessionCache::new();
        cache.safe_set_cutoff(42.0);
        cache.unsafe_reset_cutoff();
        assert_eq!(cache.cutoff(), 0.0);
    }

    #[test]
    fn recent_pushes_stay_bounded() {
        let cache = SessionCache::new();
        let many: Vec<_> = (0..80).map(|i| push(&format!("p{i}"))).collect();
        cache.replace_recent_pushes(many);
        assert_eq!(cache.snapshot().recent_pushes.len(), RECENT_PUSHES_CAP);

        cache.prepend_recent_push(push("newest"));
        let snap = cache.snapshot();
        assert_eq!(snap.recent_pushes.len(), RECENT_PUSHES_CAP);
        assert_eq!(
            snap.recent_pushes[0].view.iden.as_deref(),
            Some("newest")
        );
    }

    #[test]
    fn freshness_boundary_is_strict() {
        let state = SessionState {
            is_authenticated: true,
            cached_at: Some(1000.0),
            ..SessionState::default()
        };
        let ttl = 300_000u64;
        // One millisecond under the TTL: fresh.
        assert!(state.is_fresh(1000.0 + 299.999, ttl));
        // Exactly at the TTL: stale.
        assert!(!state.is_fresh(1000.0 + 300.0, ttl));
        // Unauthenticated is never fresh.
        let unauth = SessionState {
            is_authenticated: false,
            ..state
        };
        assert!(!unauth.is_fresh(1000.0 + 1.0, ttl));
    }

    #[test]
    fn reset_clears_session_but_keeps_nickname() {
        let cache = SessionCache::new();
        cache.update(|s| {
            s.is_authenticated = true;
            s.device_nickname = "My Browser".to_owned();
            s.user = Some(pb_protocol::User {
                iden: "u1".to_owned(),
                name: None,
                email: None,
                image_url: None,
            });
        });
        cache.safe_set_cutoff(7.0);
        cache.prepend_recent_push(push("p"));

        cache.reset();
        cache.unsafe_reset_cutoff();

        let snap = cache.snapshot();
        assert!(!snap.is_authenticated);
        assert!(snap.user.is_none());
        assert!(snap.recent_pushes.is_empty());
        assert_eq!(snap.last_modified_cutoff, 0.0);
        assert_eq!(snap.device_nickname, "My Browser");
    }

    #[test]
    fn session_blob_round_trips_through_json() {
        let cache = SessionCache::new();
        cache.update(|s| {
            s.is_authenticated = true;
            s.last_modified_cutoff = 123.456;
            s.cached_at = Some(999.0);
        });
        cache.prepend_recent_push(push("p1"));
        let blob = serde_json::to_string(&cache.snapshot()).unwrap();
        let restored: SessionState = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored, cache.snapshot());
    }
}
