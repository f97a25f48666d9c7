//! Agent wiring and event loop.
//!
//! [`Agent`] owns every long-lived subsystem and runs the single event
//! loop that consumes alarm fires, channel events, bus events, and UI
//! commands. All lifecycle decisions go through the state machine; the
//! loop only executes the side effects transitions hand back.
//!
//! The loop is one task: channel frames, pipeline runs, and state
//! transitions are therefore processed strictly in arrival order.

use pb_protocol::{OutgoingPush, Push, PushKind, StreamFrame, TickleSubtype};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::alarms::{
    ALARM_HEALTH_CHECK, ALARM_LONG_SLEEP_RECOVERY, ALARM_POLLING_FALLBACK,
    ALARM_WEBSOCKET_RECONNECT, Alarms,
};
use crate::api::ApiClient;
use crate::bus::{Bus, BusEvent};
use crate::cache::{DisplayPush, RECENT_PUSHES_CAP, SessionCache, SessionState};
use crate::channel::{Channel, ChannelEvent, CloseClass};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::notify::{LogNotifier, Notification, NotificationMap, Notifier};
use crate::orchestrator::Orchestrator;
use crate::state::{AgentEvent, AgentState, SideEffect, StateMachine};
use crate::store::{SharedStore, Store};
use crate::sync::{Pipelines, decrypt_view};

/// Commands from the embedding surface into the loop.
enum Command {
    Startup,
    SetToken(String),
    Logout,
    ForceWake,
    InitDone(Result<Option<String>, AgentError>),
}

/// The long-running client agent. `new()` wires the subsystems,
/// `start()` spawns the loop, `stop()` shuts everything down.
pub struct Agent {
    store: SharedStore,
    cache: SessionCache,
    bus: Bus,
    api: Arc<ApiClient>,
    pipelines: Arc<Pipelines>,
    orchestrator: Orchestrator,
    alarms: Alarms,
    notification_map: Arc<NotificationMap>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<AgentState>,
    loop_task: Option<tokio::task::JoinHandle<()>>,
    parts: Option<LoopParts>,
}

/// Everything the loop consumes, moved out at `start()`.
struct LoopParts {
    machine: StateMachine,
    channel: Channel,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    alarm_rx: mpsc::UnboundedReceiver<String>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    bus_rx: broadcast::Receiver<BusEvent>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<AgentState>,
    notifier: Arc<dyn Notifier>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        config: AgentConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AgentError> {
        let store = Store::open(&config.store.sqlite_path).map_err(AgentError::internal)?;
        if let Some(seed) = &config.seed_token {
            let current = store.token().map_err(AgentError::internal)?;
            if current.as_deref() != Some(seed.as_str()) {
                store.set_token(seed).map_err(AgentError::internal)?;
                info!("access token seeded from token file");
            }
        }
        let store: SharedStore = Arc::new(tokio::sync::Mutex::new(store));

        let cache = SessionCache::new();
        let bus = Bus::new();
        let api = Arc::new(ApiClient::new(
            &config.server.api_base,
            config.timing.http_timeout_ms,
        )?);
        let (alarms, alarm_rx) = Alarms::new();
        let pipelines = Arc::new(Pipelines::new(
            Arc::clone(&api),
            cache.clone(),
            Arc::clone(&store),
            bus.clone(),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&api),
            Arc::clone(&store),
            cache.clone(),
            bus.clone(),
            Arc::clone(&pipelines),
            alarms.clone(),
            config.prefs.clone(),
            config.timing.clone(),
        );
        let (channel, channel_rx) = Channel::new(
            &config.server.stream_base,
            config.timing.clone(),
            alarms.clone(),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(AgentState::Idle);
        let bus_rx = bus.subscribe();

        Ok(Self {
            store,
            cache: cache.clone(),
            bus: bus.clone(),
            api,
            pipelines,
            orchestrator,
            alarms,
            notification_map: Arc::new(NotificationMap::new()),
            cmd_tx,
            shutdown_tx,
            state_rx,
            loop_task: None,
            parts: Some(LoopParts {
                machine: StateMachine::new(),
                channel,
                channel_rx,
                alarm_rx,
                cmd_rx,
                bus_rx,
                shutdown_rx,
                state_tx,
                notifier,
                config,
            }),
        })
    }

    /// Spawn the event loop and feed it the startup trigger.
    pub fn start(&mut self) -> Result<(), AgentError> {
        let parts = self
            .parts
            .take()
            .ok_or_else(|| AgentError::internal("agent already started"))?;
        let agent_loop = AgentLoop {
            machine: parts.machine,
            channel: parts.channel,
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            bus: self.bus.clone(),
            api: Arc::clone(&self.api),
            pipelines: Arc::clone(&self.pipelines),
            orchestrator: self.orchestrator.clone(),
            alarms: self.alarms.clone(),
            notifier: parts.notifier,
            notification_map: Arc::clone(&self.notification_map),
            state_tx: parts.state_tx,
            cmd_tx: self.cmd_tx.clone(),
            config: parts.config,
            auto_opened_since_reconnect: 0,
            recovery_inits: 0,
        };
        self.loop_task = Some(tokio::spawn(agent_loop.run(
            parts.cmd_rx,
            parts.alarm_rx,
            parts.channel_rx,
            parts.bus_rx,
            parts.shutdown_rx,
        )));
        self.cmd_tx
            .send(Command::Startup)
            .map_err(|_| AgentError::internal("agent loop unavailable"))?;
        Ok(())
    }

    /// Shut the loop down and cancel every alarm.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.alarms.cancel_all();
        if let Some(task) = self.loop_task.take() {
            let _ = task.await;
        }
    }

    // -----------------------------------------------------------------------
    // Embedding surface
    // -----------------------------------------------------------------------

    /// Current state (observer of the state machine's single variable).
    pub fn current_state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Waitable view of state changes, for tests and UIs.
    pub fn state_watch(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Copy of the in-memory session view.
    pub fn snapshot(&self) -> SessionState {
        self.cache.snapshot()
    }

    /// UI request for session data: joins (or starts) the single-flight
    /// initialization and returns the freshest snapshot.
    pub async fn session(&self) -> Result<SessionState, AgentError> {
        self.orchestrator.orchestrate_initialization("ui").await?;
        Ok(self.cache.snapshot())
    }

    /// Resolve a previously surfaced notification id to its push.
    pub fn notification_push(&self, id: &str) -> Option<Push> {
        self.notification_map.get(id)
    }

    pub fn set_token(&self, token: &str) {
        let _ = self.cmd_tx.send(Command::SetToken(token.to_owned()));
    }

    pub fn logout(&self) {
        let _ = self.cmd_tx.send(Command::Logout);
    }

    /// Manual wake: re-kick a stalled agent.
    pub fn force_wake(&self) {
        let _ = self.cmd_tx.send(Command::ForceWake);
    }

    pub async fn send_push(&self, push: &OutgoingPush) -> Result<Push, AgentError> {
        let token = {
            let store = self.store.lock().await;
            store.token().map_err(AgentError::internal)?
        };
        let Some(token) = token else {
            return Err(AgentError::Unauthenticated);
        };
        self.api.send_push(&token, push).await
    }

    pub async fn send_note(
        &self,
        title: Option<String>,
        body: Option<String>,
    ) -> Result<Push, AgentError> {
        self.send_push(&OutgoingPush::note(title, body)).await
    }

    pub async fn send_link(
        &self,
        title: Option<String>,
        url: String,
    ) -> Result<Push, AgentError> {
        self.send_push(&OutgoingPush::link(title, url, None)).await
    }
}

// ---------------------------------------------------------------------------
// The event loop
// ---------------------------------------------------------------------------

struct AgentLoop {
    machine: StateMachine,
    channel: Channel,
    store: SharedStore,
    cache: SessionCache,
    bus: Bus,
    api: Arc<ApiClient>,
    pipelines: Arc<Pipelines>,
    orchestrator: Orchestrator,
    alarms: Alarms,
    notifier: Arc<dyn Notifier>,
    notification_map: Arc<NotificationMap>,
    state_tx: watch::Sender<AgentState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    config: AgentConfig,
    auto_opened_since_reconnect: u32,
    /// Bounds automatic re-initialization after invalid-cursor recovery.
    recovery_inits: u32,
}

impl AgentLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut alarm_rx: mpsc::UnboundedReceiver<String>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut bus_rx: broadcast::Receiver<BusEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("agent loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.channel.close();
                        info!("agent loop stopped");
                        return;
                    }
                }
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                Some(event) = channel_rx.recv() => self.handle_channel_event(event).await,
                Some(name) = alarm_rx.recv() => self.handle_alarm(&name).await,
                event = bus_rx.recv() => match event {
                    Ok(event) => self.handle_bus_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "agent loop lagged on bus events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
    }

    async fn token(&self) -> Option<String> {
        let store = self.store.lock().await;
        store.token().ok().flatten()
    }

    // -----------------------------------------------------------------------
    // State machine driving
    // -----------------------------------------------------------------------

    async fn apply(&mut self, event: AgentEvent) {
        let Some(transition) = self.machine.transition(event) else {
            return;
        };
        for effect in transition.effects {
            self.execute(*effect).await;
        }
        // Observers hear about the new state only once its entry effects
        // have run.
        let _ = self.state_tx.send(transition.to);
        self.bus.publish(BusEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
    }

    async fn execute(&mut self, effect: SideEffect) {
        match effect {
            SideEffect::OrchestrateInit => self.spawn_init("state-machine"),
            SideEffect::ConnectChannel => {
                if let Some(token) = self.token().await {
                    self.channel.connect(&token);
                }
            }
            SideEffect::ShowErrorNotification => {
                self.notifier.notify(
                    "agent-error",
                    &Notification {
                        title: "Pushbullet agent".to_owned(),
                        body: "Connection problem. Check your network, or re-enter your \
                               access token from the options page."
                            .to_owned(),
                        persistent: true,
                    },
                );
            }
            SideEffect::StartPolling => self.channel.maybe_start_polling(),
            SideEffect::StopPolling => self.channel.stop_polling(),
            SideEffect::LogoutCleanup => self.logout_cleanup().await,
        }
    }

    fn spawn_init(&self, source: &'static str) {
        let orchestrator = self.orchestrator.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = orchestrator.orchestrate_initialization(source).await;
            let _ = cmd_tx.send(Command::InitDone(result));
        });
    }

    async fn logout_cleanup(&mut self) {
        self.channel.close();
        self.channel.stop_polling();
        self.alarms.cancel(ALARM_WEBSOCKET_RECONNECT);
        self.cache.reset();
        self.cache.unsafe_reset_cutoff();
        {
            let store = self.store.lock().await;
            if let Err(e) = store.clear_session_state() {
                warn!(error = %e, "failed to clear persisted session state");
            }
        }
        self.notifier.clear_badge();
        self.bus.publish(BusEvent::SessionUpdated);
        info!("logged out");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Startup => {
                let has_token = self.token().await.is_some();
                self.apply(AgentEvent::Startup { has_token }).await;
            }
            Command::SetToken(token) => {
                {
                    let store = self.store.lock().await;
                    if let Err(e) = store.set_token(&token) {
                        warn!(error = %e, "failed to persist token");
                        return;
                    }
                }
                self.apply(AgentEvent::ApiKeySet).await;
            }
            Command::Logout => self.apply(AgentEvent::Logout).await,
            Command::ForceWake => self.handle_force_wake().await,
            Command::InitDone(result) => self.handle_init_done(result).await,
        }
    }

    async fn handle_force_wake(&mut self) {
        let has_token = self.token().await.is_some();
        match self.machine.current() {
            AgentState::Idle => self.apply(AgentEvent::Startup { has_token }).await,
            AgentState::Error => self.apply(AgentEvent::AttemptReconnect { has_token }).await,
            _ => {
                if !self.channel.is_open() {
                    if let Some(token) = self.token().await {
                        self.channel.connect(&token);
                    }
                }
            }
        }
    }

    async fn handle_init_done(&mut self, result: Result<Option<String>, AgentError>) {
        match result {
            Ok(Some(_)) => {
                self.recovery_inits = 0;
                self.apply(AgentEvent::InitSuccess).await;
            }
            Ok(None) => {
                debug!("initialization ran without a token");
                self.apply(AgentEvent::InitFailure).await;
            }
            Err(AgentError::Unauthenticated) => {
                self.notifier.notify(
                    "reauth-required",
                    &Notification {
                        title: "Pushbullet agent".to_owned(),
                        body: "Your access token was rejected. Please enter a new one."
                            .to_owned(),
                        persistent: true,
                    },
                );
                self.apply(AgentEvent::Logout).await;
            }
            Err(AgentError::InvalidCursor) if self.recovery_inits == 0 => {
                // Recovery already reset the watermark; re-run once. The
                // next run starts with a seed.
                self.recovery_inits += 1;
                info!("re-initializing after invalid-cursor recovery");
                self.spawn_init("invalid-cursor-recovery");
            }
            Err(e) => {
                warn!(error = %e, "initialization failed");
                self.recovery_inits = 0;
                self.apply(AgentEvent::InitFailure).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Alarms
    // -----------------------------------------------------------------------

    async fn handle_alarm(&mut self, name: &str) {
        match name {
            ALARM_WEBSOCKET_RECONNECT => {
                // Idempotence: an alarm that races a successful open is a
                // no-op.
                if self.channel.is_open() {
                    debug!("reconnect alarm fired while connected, ignoring");
                    return;
                }
                let Some(token) = self.token().await else {
                    return;
                };
                match self.machine.current() {
                    AgentState::Error => {
                        self.apply(AgentEvent::AttemptReconnect { has_token: true })
                            .await;
                    }
                    AgentState::Idle => {}
                    _ => self.channel.connect(&token),
                }
            }
            ALARM_HEALTH_CHECK => self.channel.health_check(),
            ALARM_POLLING_FALLBACK => {
                if let Some(token) = self.token().await {
                    if let Err(e) = self
                        .pipelines
                        .fetch_display(&token, RECENT_PUSHES_CAP)
                        .await
                    {
                        warn!(error = %e, "polling refresh failed");
                        self.handle_pipeline_error(e).await;
                    }
                }
            }
            ALARM_LONG_SLEEP_RECOVERY => {
                if matches!(self.machine.current(), AgentState::Idle | AgentState::Error)
                    && self.token().await.is_some()
                {
                    info!("long-sleep recovery kicking initialization");
                    self.apply(AgentEvent::ApiKeySet).await;
                }
            }
            other => debug!(name = other, "unhandled alarm"),
        }
    }

    async fn handle_pipeline_error(&mut self, error: AgentError) {
        match error {
            AgentError::Unauthenticated => {
                self.notifier.notify(
                    "reauth-required",
                    &Notification {
                        title: "Pushbullet agent".to_owned(),
                        body: "Your access token was rejected. Please enter a new one."
                            .to_owned(),
                        persistent: true,
                    },
                );
                self.apply(AgentEvent::Logout).await;
            }
            AgentError::InvalidCursor => {
                // The pipeline already reset the watermark and display
                // list; rebuild the session from scratch.
                self.spawn_init("invalid-cursor-recovery");
            }
            e if e.is_transient() => debug!(error = %e, "transient pipeline failure"),
            e => warn!(error = %e, "pipeline failure"),
        }
    }

    // -----------------------------------------------------------------------
    // Channel events
    // -----------------------------------------------------------------------

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { generation } => {
                let was_reconnect = self.channel.consecutive_failures() > 0;
                if !self.channel.handle_opened(generation) {
                    return;
                }
                self.notifier.clear_badge();
                self.auto_opened_since_reconnect = 0;
                if was_reconnect && !self.effective_auto_open_on_reconnect().await {
                    self.pipelines.suppress_auto_open_once();
                }
                self.apply(AgentEvent::WsConnected).await;
            }
            ChannelEvent::Frame { generation, frame } => {
                if !self.channel.accept_frame(generation) {
                    return;
                }
                self.handle_frame(frame).await;
            }
            ChannelEvent::Closed {
                generation,
                code,
                was_clean,
            } => match self.channel.handle_closed(generation, code, was_clean) {
                None | Some(CloseClass::Clean) => {}
                Some(CloseClass::Transient) => self.apply(AgentEvent::WsDisconnected).await,
                Some(CloseClass::Permanent) => {
                    self.notifier.set_badge("ERR");
                    self.apply(AgentEvent::WsPermanentError).await;
                }
            },
        }
    }

    async fn handle_frame(&mut self, frame: StreamFrame) {
        match frame {
            StreamFrame::Nop => debug!("keep-alive"),
            StreamFrame::Tickle {
                subtype: Some(TickleSubtype::Push),
            } => {
                let Some(token) = self.token().await else {
                    return;
                };
                let pipelines = Arc::clone(&self.pipelines);
                if let Err(e) = pipelines.refresh_incremental(&token).await {
                    self.handle_pipeline_error(e).await;
                    return;
                }
                if let Err(e) = pipelines.fetch_display(&token, RECENT_PUSHES_CAP).await {
                    self.handle_pipeline_error(e).await;
                }
            }
            StreamFrame::Tickle {
                subtype: Some(TickleSubtype::Device),
            } => self.refresh_devices().await,
            StreamFrame::Tickle { subtype } => {
                debug!(?subtype, "ignoring tickle for unknown category");
            }
            StreamFrame::Push { push } => self.handle_direct_push(push).await,
            StreamFrame::Unknown => warn!("ignoring unknown frame type"),
        }
    }

    async fn refresh_devices(&mut self) {
        let Some(token) = self.token().await else {
            return;
        };
        let devices = match self.api.list_devices(&token).await {
            Ok(devices) => devices,
            Err(e) => {
                self.handle_pipeline_error(e).await;
                return;
            }
        };
        // A nickname edit made on another surface wins over our local
        // record.
        let own_iden = {
            let store = self.store.lock().await;
            store.device_iden().ok().flatten()
        };
        if let Some(own) = own_iden.and_then(|iden| devices.iter().find(|d| d.iden == iden)) {
            if let Some(nickname) = &own.nickname {
                let store = self.store.lock().await;
                let stored = store.device_nickname().ok().flatten();
                if stored.as_deref() != Some(nickname.as_str()) {
                    if let Err(e) = store.set_device_nickname(nickname) {
                        warn!(error = %e, "failed to persist nickname change");
                    }
                    self.cache.update(|s| s.device_nickname = nickname.clone());
                }
            }
        }
        self.cache.update(|s| s.devices = devices.clone());
        self.bus.publish(BusEvent::DevicesUpdated(devices));
        self.bus.publish(BusEvent::SessionUpdated);
    }

    async fn handle_direct_push(&mut self, push: Push) {
        let key = self.pipelines.decryption_key().await;
        let (view, failure) = decrypt_view(&push, key.as_ref());
        if let Some(reason) = failure {
            self.bus.publish(BusEvent::DecryptDiagnostic {
                iden: push.iden.clone(),
                reason: reason.to_string(),
            });
        }
        if push.dismissed || !view.is_renderable() {
            debug!("ignoring non-displayable direct push");
            return;
        }

        self.cache
            .prepend_recent_push(DisplayPush::decrypted(push, view.clone()));
        self.bus.publish(BusEvent::SessionUpdated);
        self.surface_notification(&view).await;
    }

    // -----------------------------------------------------------------------
    // Notifications and auto-open
    // -----------------------------------------------------------------------

    async fn surface_notification(&mut self, push: &Push) {
        let id = uuid::Uuid::new_v4().to_string();
        self.notifier.notify(
            &id,
            &Notification {
                title: push.display_title(),
                body: push.display_body(),
                persistent: false,
            },
        );
        self.notification_map.insert(&id, push.clone());

        let timeout_ms = {
            let store = self.store.lock().await;
            store
                .notification_timeout_ms()
                .ok()
                .flatten()
                .unwrap_or(self.config.prefs.notification_timeout_ms)
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            notifier.clear(&id);
        });
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        if let BusEvent::Pipeline1Push {
            push,
            suppress_auto_open,
        } = event
        {
            self.surface_notification(&push).await;
            if !suppress_auto_open {
                self.maybe_auto_open(&push).await;
            }
        }
    }

    async fn maybe_auto_open(&mut self, push: &Push) {
        if push.kind != Some(PushKind::Link) {
            return;
        }
        let Some(url) = &push.url else { return };
        if !self.effective_auto_open().await {
            return;
        }
        if self.auto_opened_since_reconnect >= self.config.prefs.max_auto_open_per_reconnect {
            debug!("auto-open cap reached for this connection");
            return;
        }
        self.auto_opened_since_reconnect += 1;
        info!(%url, "auto-opening link push");
        if let Err(e) = open::that_detached(url) {
            warn!(error = %e, "failed to open link");
        }
    }

    async fn effective_auto_open(&self) -> bool {
        let store = self.store.lock().await;
        store
            .auto_open_links()
            .ok()
            .flatten()
            .unwrap_or(self.config.prefs.auto_open_links)
    }

    async fn effective_auto_open_on_reconnect(&self) -> bool {
        let store = self.store.lock().await;
        store
            .auto_open_links_on_reconnect()
            .ok()
            .flatten()
            .unwrap_or(self.config.prefs.auto_open_links_on_reconnect)
    }
}
