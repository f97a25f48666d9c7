//! Dual sync pipelines over the pushes endpoint.
//!
//! Pipeline-1 (incremental) is driven by the cutoff watermark: it fetches
//! everything modified after the cutoff, advances the watermark, and
//! publishes each surviving push on the bus. Its first run after install
//! or recovery is a *seed run* that only positions the watermark.
//!
//! Pipeline-2 (display) fetches a fixed-size recent window and replaces
//! the display list wholesale. It never reads or writes the cutoff.
//!
//! The two pipelines share only the REST client.

use pb_protocol::Push;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::bus::{Bus, BusEvent};
use crate::cache::{DisplayPush, SessionCache};
use crate::crypto::{self, EncryptionKey};
use crate::error::{AgentError, DecryptError};
use crate::store::SharedStore;

/// Hard stop for cursor paging; a well-behaved server exhausts long before.
const MAX_PAGES: usize = 50;

/// Result of one incremental run.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalOutcome {
    pub pushes: Vec<Push>,
    pub is_seed_run: bool,
}

pub struct Pipelines {
    api: Arc<ApiClient>,
    cache: SessionCache,
    store: SharedStore,
    bus: Bus,
    /// Serializes Pipeline-1 runs: a second caller awaits the first.
    run_lock: tokio::sync::Mutex<()>,
    /// One-shot: the next incremental run must not auto-open.
    suppress_next_auto_open: AtomicBool,
}

impl Pipelines {
    pub fn new(api: Arc<ApiClient>, cache: SessionCache, store: SharedStore, bus: Bus) -> Self {
        Self {
            api,
            cache,
            store,
            bus,
            run_lock: tokio::sync::Mutex::new(()),
            suppress_next_auto_open: AtomicBool::new(false),
        }
    }

    /// Mark the next incremental run as auto-open-suppressed (reconnect
    /// with the reconnect knob off, or invalid-cursor recovery).
    pub fn suppress_auto_open_once(&self) {
        self.suppress_next_auto_open.store(true, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Pipeline-1: incremental, cutoff-driven
    // -----------------------------------------------------------------------

    /// Detect pushes created or modified since the last run.
    ///
    /// On `invalid_cursor` the recovery routine has already reset the
    /// watermark and cleared the display list by the time the error is
    /// returned; the caller re-initializes.
    pub async fn refresh_incremental(
        &self,
        token: &str,
    ) -> Result<IncrementalOutcome, AgentError> {
        let _guard = self.run_lock.lock().await;

        let cutoff = {
            let store = self.store.lock().await;
            store.cutoff().map_err(AgentError::internal)?
        };

        if cutoff == 0.0 {
            return self.seed_run(token).await;
        }

        let fetched = match self.fetch_all_since(token, cutoff).await {
            Ok(pushes) => pushes,
            Err(AgentError::InvalidCursor) => {
                self.recover_invalid_cursor().await?;
                return Err(AgentError::InvalidCursor);
            }
            Err(e) => return Err(e),
        };

        // Logout may have raced the fetch; discard rather than resurrect
        // state for a signed-out user.
        if !self.cache.is_authenticated() {
            debug!("discarding incremental results after logout");
            return Ok(IncrementalOutcome {
                pushes: Vec::new(),
                is_seed_run: false,
            });
        }

        // The watermark advances over everything the server returned,
        // dismissed or not; filtering below is display policy only.
        let next_cutoff = newest_modified(&fetched).max(cutoff);
        self.advance_cutoff(next_cutoff).await?;

        let key = self.decryption_key().await;
        let suppress = self.suppress_next_auto_open.swap(false, Ordering::SeqCst);
        let mut surviving = Vec::new();
        for push in fetched {
            if push.dismissed {
                continue;
            }
            let (view, failure) = decrypt_view(&push, key.as_ref());
            if let Some(reason) = failure {
                self.bus.publish(BusEvent::DecryptDiagnostic {
                    iden: push.iden.clone(),
                    reason: reason.to_string(),
                });
            }
            if !view.is_renderable() {
                continue;
            }
            self.bus.publish(BusEvent::Pipeline1Push {
                push: view.clone(),
                suppress_auto_open: suppress,
            });
            surviving.push(view);
        }

        info!(
            count = surviving.len(),
            cutoff = next_cutoff,
            "incremental refresh complete"
        );
        Ok(IncrementalOutcome {
            pushes: surviving,
            is_seed_run: false,
        })
    }

    /// First run: position the watermark at the newest server `modified`
    /// without processing or auto-opening anything.
    async fn seed_run(&self, token: &str) -> Result<IncrementalOutcome, AgentError> {
        let newest = self.api.recent_pushes(token, 1).await?;
        let latest = newest_modified(&newest);
        if latest > 0.0 {
            self.advance_cutoff(latest).await?;
        }
        info!(cutoff = latest, "seed run positioned watermark");
        Ok(IncrementalOutcome {
            pushes: Vec::new(),
            is_seed_run: true,
        })
    }

    async fn fetch_all_since(&self, token: &str, cutoff: f64) -> Result<Vec<Push>, AgentError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .api
                .pushes_modified_after(token, cutoff, cursor.as_deref())
                .await?;
            all.extend(page.pushes);
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => return Ok(all),
            }
        }
        warn!(pages = MAX_PAGES, "incremental paging hit the page cap");
        Ok(all)
    }

    async fn advance_cutoff(&self, candidate: f64) -> Result<(), AgentError> {
        if !self.cache.safe_set_cutoff(candidate) {
            return Ok(());
        }
        let store = self.store.lock().await;
        store.set_cutoff(candidate).map_err(AgentError::internal)
    }

    /// Invalid-cursor recovery: the only watermark reset besides logout.
    ///
    /// Also drops the persisted session blob so the re-initialization
    /// takes the cold path and runs a fresh seed instead of hydrating the
    /// stale watermark back from disk.
    pub async fn recover_invalid_cursor(&self) -> Result<(), AgentError> {
        warn!("invalid cursor: resetting watermark and display list");
        self.cache.unsafe_reset_cutoff();
        self.cache.clear_recent_pushes();
        self.suppress_auto_open_once();
        let store = self.store.lock().await;
        store.set_cutoff(0.0).map_err(AgentError::internal)?;
        store.clear_cached_session().map_err(AgentError::internal)
    }

    // -----------------------------------------------------------------------
    // Pipeline-2: display history
    // -----------------------------------------------------------------------

    /// Replace the display list with the newest `limit` renderable
    /// non-dismissed pushes. Does not touch the cutoff.
    pub async fn fetch_display(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<DisplayPush>, AgentError> {
        let pushes = self.api.recent_pushes(token, limit).await?;

        if !self.cache.is_authenticated() {
            debug!("discarding display results after logout");
            return Ok(Vec::new());
        }

        let key = self.decryption_key().await;
        let display_pushes: Vec<DisplayPush> = pushes
            .into_iter()
            .filter(|p| !p.dismissed && p.is_renderable())
            .map(|envelope| {
                let (view, failure) = decrypt_view(&envelope, key.as_ref());
                if let Some(reason) = failure {
                    self.bus.publish(BusEvent::DecryptDiagnostic {
                        iden: envelope.iden.clone(),
                        reason: reason.to_string(),
                    });
                }
                DisplayPush::decrypted(envelope, view)
            })
            .collect();

        self.cache.replace_recent_pushes(display_pushes.clone());
        self.bus.publish(BusEvent::SessionUpdated);
        debug!(count = display_pushes.len(), "display history refreshed");
        Ok(display_pushes)
    }

    // -----------------------------------------------------------------------
    // Decryption support
    // -----------------------------------------------------------------------

    /// Derive the AES key when both the password and the user iden are
    /// known; once per pipeline run, not per push.
    pub async fn decryption_key(&self) -> Option<EncryptionKey> {
        let password = {
            let store = self.store.lock().await;
            store.encryption_password().ok().flatten()
        }?;
        let user_iden = self.cache.user_iden()?;
        Some(EncryptionKey::derive(&password, &user_iden))
    }
}

/// Produce the displayable view of a push: the decrypted merge when
/// possible, the untouched envelope otherwise. The envelope itself is
/// never modified.
pub fn decrypt_view(push: &Push, key: Option<&EncryptionKey>) -> (Push, Option<DecryptError>) {
    if !push.is_encrypted() {
        return (push.clone(), None);
    }
    let Some(key) = key else {
        return (push.clone(), Some(DecryptError::MissingPassword));
    };
    let Some(ciphertext) = push.ciphertext.as_deref() else {
        return (push.clone(), Some(DecryptError::TooShort(0)));
    };
    match crypto::decrypt_envelope(ciphertext, key) {
        Ok(plaintext) => match push.merged_with_plaintext(&plaintext) {
            Ok(merged) => (merged, None),
            Err(_) => (push.clone(), Some(DecryptError::BadPlaintext)),
        },
        Err(e) => (push.clone(), Some(e)),
    }
}

/// The newest `modified` stamp across a batch; 0.0 for an empty batch.
pub fn newest_modified(pushes: &[Push]) -> f64 {
    pushes
        .iter()
        .filter_map(|p| p.modified)
        .fold(0.0, f64::max)
}
