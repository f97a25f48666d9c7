//! Cache-first hydration orchestrator.
//!
//! Every external trigger (startup, wake alarm, UI request, force-wake)
//! funnels into [`Orchestrator::orchestrate_initialization`]. At most one
//! initialization is in flight at a time: concurrent callers await the
//! same shared future, and the slot is cleared in a terminal step whether
//! the run succeeded or failed.
//!
//! The fast path hydrates from a fresh persisted session and refreshes in
//! a detached task; the cold path performs the full bootstrap sequence.

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use pb_protocol::DeviceRegistration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alarms::{ALARM_HEALTH_CHECK, ALARM_LONG_SLEEP_RECOVERY, Alarms};
use crate::api::ApiClient;
use crate::bus::{Bus, BusEvent};
use crate::cache::{RECENT_PUSHES_CAP, SessionCache, SessionState, unix_now};
use crate::config::{APP_VERSION, PrefsConfig, TimingConfig};
use crate::error::AgentError;
use crate::store::SharedStore;
use crate::sync::Pipelines;

type InitFuture = Shared<BoxFuture<'static, Result<Option<String>, AgentError>>>;

/// Shared orchestrator handle. Cloning is cheap; all clones share the
/// single-flight slot.
#[derive(Clone)]
pub struct Orchestrator {
    api: Arc<ApiClient>,
    store: SharedStore,
    cache: SessionCache,
    bus: Bus,
    pipelines: Arc<Pipelines>,
    alarms: Alarms,
    prefs: PrefsConfig,
    timing: TimingConfig,
    flight: Arc<tokio::sync::Mutex<Option<InitFuture>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<ApiClient>,
        store: SharedStore,
        cache: SessionCache,
        bus: Bus,
        pipelines: Arc<Pipelines>,
        alarms: Alarms,
        prefs: PrefsConfig,
        timing: TimingConfig,
    ) -> Self {
        Self {
            api,
            store,
            cache,
            bus,
            pipelines,
            alarms,
            prefs,
            timing,
            flight: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Initialize (or join an initialization already in flight).
    ///
    /// Returns the access token when the agent ended up authenticated,
    /// `None` when no token is configured.
    pub async fn orchestrate_initialization(
        &self,
        source: &str,
    ) -> Result<Option<String>, AgentError> {
        let (future, leader) = {
            let mut slot = self.flight.lock().await;
            match slot.as_ref() {
                Some(existing) => {
                    debug!(source, "joining initialization already in flight");
                    (existing.clone(), false)
                }
                None => {
                    let this = self.clone();
                    let src = source.to_owned();
                    let future: InitFuture =
                        async move { this.run_init(&src).await }.boxed().shared();
                    *slot = Some(future.clone());
                    (future, true)
                }
            }
        };

        let result = future.await;
        if leader {
            // Terminal step: clear the slot on success and failure alike.
            *self.flight.lock().await = None;
        }
        result
    }

    /// Whether an initialization is currently in flight.
    pub async fn init_in_flight(&self) -> bool {
        self.flight.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // The actual initialization
    // -----------------------------------------------------------------------

    async fn run_init(&self, source: &str) -> Result<Option<String>, AgentError> {
        info!(source, "initialization started");

        let (token, blob, stored_cutoff) = {
            let store = self.store.lock().await;
            let token = store.token().map_err(AgentError::internal)?;
            let blob = store.cached_session_raw().map_err(AgentError::internal)?;
            let cutoff = store.cutoff().map_err(AgentError::internal)?;
            (token, blob, cutoff)
        };
        let Some(token) = token else {
            debug!(source, "no token configured");
            return Ok(None);
        };

        // Fast path: fresh persisted session. A long downtime overrides
        // TTL freshness: past the downtime threshold the cache is never
        // trusted, no matter how large the configured TTL is.
        if let Some(raw) = blob {
            match serde_json::from_str::<SessionState>(&raw) {
                Ok(mut state) => {
                    // The dedicated cutoff key is authoritative over the
                    // blob's copy.
                    state.last_modified_cutoff = stored_cutoff;
                    let now = unix_now();
                    let down_ms = state.cached_at.map(|cached_at| (now - cached_at) * 1000.0);
                    if let Some(down_ms) =
                        down_ms.filter(|d| *d > self.timing.downtime_warning_ms as f64)
                    {
                        warn!(
                            downtime_mins = (down_ms / 60_000.0) as u64,
                            "long downtime detected, forcing full re-initialization"
                        );
                    } else if state.is_fresh(now, self.prefs.cache_ttl_ms) {
                        self.cache.hydrate(state);
                        let this = self.clone();
                        let background_token = token.clone();
                        tokio::spawn(async move {
                            this.refresh_in_background(&background_token).await;
                        });
                        info!(source, "hydrated from fresh cache");
                        return Ok(Some(token));
                    }
                }
                Err(e) => warn!(error = %e, "discarding undecodable session blob"),
            }
        }

        self.cold_bootstrap(&token).await?;
        Ok(Some(token))
    }

    /// Full bootstrap: user, devices, chats, both pipelines, device
    /// registration, periodic alarms, session persist.
    async fn cold_bootstrap(&self, token: &str) -> Result<(), AgentError> {
        let user = self.api.get_user(token).await?;
        info!(user_iden = %user.iden, "authenticated");

        let (nickname, auto_open) = {
            let store = self.store.lock().await;
            (
                store
                    .device_nickname()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| self.prefs.device_nickname.clone()),
                store
                    .auto_open_links()
                    .ok()
                    .flatten()
                    .unwrap_or(self.prefs.auto_open_links),
            )
        };

        self.cache.update(|s| {
            s.user = Some(user);
            s.is_authenticated = true;
            s.device_nickname = nickname.clone();
            s.auto_open_links = auto_open;
        });

        let devices = self.api.list_devices(token).await?;
        // Chats are optional decoration; their absence never fails a
        // bootstrap.
        let chats = match self.api.list_chats(token).await {
            Ok(chats) => chats,
            Err(AgentError::Unauthenticated) => return Err(AgentError::Unauthenticated),
            Err(e) => {
                warn!(error = %e, "chat fetch failed, continuing without chats");
                Vec::new()
            }
        };
        self.cache.update(|s| {
            s.devices = devices;
            s.chats = chats;
        });

        let outcome = self.pipelines.refresh_incremental(token).await?;
        if outcome.is_seed_run {
            info!("first run: watermark seeded, no pushes processed");
        }
        self.pipelines.fetch_display(token, RECENT_PUSHES_CAP).await?;

        self.register_device(token, &nickname).await?;

        self.alarms.schedule_periodic(
            ALARM_HEALTH_CHECK,
            Duration::from_millis(self.timing.health_check_period_ms),
        );
        self.alarms.schedule_periodic(
            ALARM_LONG_SLEEP_RECOVERY,
            Duration::from_millis(self.timing.long_sleep_period_ms),
        );

        self.persist_session().await?;
        self.bus.publish(BusEvent::SessionUpdated);
        Ok(())
    }

    /// Fast-path follow-up: refresh the display window and the device
    /// list, then persist and broadcast. Runs detached; failures are
    /// logged, never propagated.
    async fn refresh_in_background(&self, token: &str) {
        debug!("background refresh started");
        if let Err(e) = self.pipelines.fetch_display(token, RECENT_PUSHES_CAP).await {
            warn!(error = %e, "background display refresh failed");
            return;
        }
        match self.api.list_devices(token).await {
            Ok(devices) => {
                self.cache.update(|s| s.devices = devices);
            }
            Err(e) => warn!(error = %e, "background device refresh failed"),
        }
        if let Err(e) = self.persist_session().await {
            warn!(error = %e, "background session persist failed");
        }
        self.bus.publish(BusEvent::SessionUpdated);
    }

    /// Serialize the current session with a fresh `cached_at`.
    pub async fn persist_session(&self) -> Result<(), AgentError> {
        self.cache.update(|s| s.cached_at = Some(unix_now()));
        let blob = serde_json::to_string(&self.cache.snapshot()).map_err(AgentError::internal)?;
        let store = self.store.lock().await;
        store
            .set_cached_session_raw(&blob)
            .map_err(AgentError::internal)
    }

    // -----------------------------------------------------------------------
    // Device registration
    // -----------------------------------------------------------------------

    /// Register or update this client's device record. Registration
    /// failures other than 401 are non-fatal for the bootstrap.
    async fn register_device(&self, token: &str, nickname: &str) -> Result<(), AgentError> {
        {
            let store = self.store.lock().await;
            if store.registration_in_progress().map_err(AgentError::internal)? {
                debug!("device registration already in progress, skipping");
                return Ok(());
            }
            store
                .set_registration_in_progress(true)
                .map_err(AgentError::internal)?;
        }

        let result = self.register_or_update(token, nickname).await;

        {
            let store = self.store.lock().await;
            if let Err(e) = store.set_registration_in_progress(false) {
                warn!(error = %e, "failed to clear registration guard");
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(AgentError::Unauthenticated) => Err(AgentError::Unauthenticated),
            Err(e) => {
                warn!(error = %e, "device registration failed, continuing bootstrap");
                Ok(())
            }
        }
    }

    async fn register_or_update(&self, token: &str, nickname: &str) -> Result<(), AgentError> {
        let existing = {
            let store = self.store.lock().await;
            store.device_iden().map_err(AgentError::internal)?
        };

        if let Some(iden) = existing {
            match self
                .api
                .update_device_nickname(token, &iden, nickname)
                .await
            {
                Ok(_) => return Ok(()),
                Err(AgentError::Unauthenticated) => return Err(AgentError::Unauthenticated),
                Err(e) => {
                    // Stale iden (server dropped the device): recreate.
                    warn!(error = %e, "nickname update failed, re-registering device");
                    let store = self.store.lock().await;
                    store.clear_device_iden().map_err(AgentError::internal)?;
                }
            }
        }

        let registration = DeviceRegistration::new(nickname, APP_VERSION);
        let device = self
            .api
            .register_device(token, &registration)
            .await
            .map_err(|e| match e {
                AgentError::Unauthenticated => AgentError::Unauthenticated,
                other => AgentError::Registration(other.to_string()),
            })?;
        let store = self.store.lock().await;
        store
            .set_device_iden(&device.iden)
            .map_err(AgentError::internal)?;
        info!(device_iden = %device.iden, "device registered");
        Ok(())
    }
}
