//! Agent lifecycle state machine.
//!
//! The single authority for what the agent is doing. `transition` computes
//! the next state atomically and returns the side effects the caller must
//! execute; the machine itself never performs I/O, which keeps every
//! transition synchronous and serialized by construction.
//!
//! Unrecognized (state, event) pairs are ignored but counted.

use tracing::{debug, info};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No token, or logged out.
    Idle,
    /// Bootstrap in progress.
    Initializing,
    /// Stream connected, cache populated.
    Ready,
    /// Stream down; polling keeps data approximately fresh.
    Degraded,
    /// Bootstrap failed or the stream died permanently.
    Error,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Idle => "IDLE",
            AgentState::Initializing => "INITIALIZING",
            AgentState::Ready => "READY",
            AgentState::Degraded => "DEGRADED",
            AgentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Startup { has_token: bool },
    ApiKeySet,
    InitSuccess,
    InitFailure,
    WsConnected,
    WsDisconnected,
    WsPermanentError,
    Logout,
    AttemptReconnect { has_token: bool },
}

impl std::fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentEvent::Startup { .. } => "STARTUP",
            AgentEvent::ApiKeySet => "API_KEY_SET",
            AgentEvent::InitSuccess => "INIT_SUCCESS",
            AgentEvent::InitFailure => "INIT_FAILURE",
            AgentEvent::WsConnected => "WS_CONNECTED",
            AgentEvent::WsDisconnected => "WS_DISCONNECTED",
            AgentEvent::WsPermanentError => "WS_PERMANENT_ERROR",
            AgentEvent::Logout => "LOGOUT",
            AgentEvent::AttemptReconnect { .. } => "ATTEMPT_RECONNECT",
        };
        f.write_str(s)
    }
}

/// Side effects the agent loop executes after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Kick the single-flight initialization.
    OrchestrateInit,
    /// Open the real-time channel.
    ConnectChannel,
    /// Surface a persistent error notification.
    ShowErrorNotification,
    /// Enter polling fallback if the failure threshold is met.
    StartPolling,
    /// Leave polling fallback.
    StopPolling,
    /// Clear cache, disconnect, reset cutoff, drop token.
    LogoutCleanup,
}

/// A completed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub effects: &'static [SideEffect],
}

/// The state machine. One instance per agent; the current state is the
/// only variable carrying lifecycle meaning anywhere in the process.
#[derive(Debug)]
pub struct StateMachine {
    current: AgentState,
    ignored: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: AgentState::Idle,
            ignored: 0,
        }
    }

    pub fn current(&self) -> AgentState {
        self.current
    }

    /// Count of (state, event) pairs that were ignored.
    pub fn ignored_count(&self) -> u64 {
        self.ignored
    }

    /// Apply an event. Returns the transition when the pair is recognized;
    /// `None` (counted) otherwise.
    pub fn transition(&mut self, event: AgentEvent) -> Option<Transition> {
        use AgentEvent as E;
        use AgentState as S;
        use SideEffect as FX;

        let next: Option<(S, &'static [FX])> = match (self.current, event) {
            (S::Idle, E::Startup { has_token: true }) => Some((S::Initializing, &[FX::OrchestrateInit])),
            (S::Idle, E::Startup { has_token: false }) => Some((S::Idle, &[])),
            (S::Idle, E::ApiKeySet) => Some((S::Initializing, &[FX::OrchestrateInit])),
            (S::Initializing, E::InitSuccess) => Some((S::Ready, &[FX::ConnectChannel])),
            (S::Initializing, E::InitFailure) => Some((S::Error, &[FX::ShowErrorNotification])),
            (S::Ready, E::WsDisconnected) => Some((S::Degraded, &[FX::StartPolling])),
            (S::Ready, E::WsPermanentError) => Some((S::Error, &[FX::ShowErrorNotification])),
            (S::Degraded, E::WsConnected) => Some((S::Ready, &[FX::StopPolling])),
            (S::Degraded, E::WsPermanentError) => Some((S::Error, &[FX::ShowErrorNotification])),
            (S::Error, E::ApiKeySet) => Some((S::Initializing, &[FX::OrchestrateInit])),
            (S::Error, E::AttemptReconnect { has_token: true }) => {
                Some((S::Initializing, &[FX::OrchestrateInit]))
            }
            (_, E::Logout) => Some((S::Idle, &[FX::LogoutCleanup])),
            _ => None,
        };

        match next {
            Some((to, effects)) => {
                let from = self.current;
                self.current = to;
                info!(%from, %event, %to, "state {from} --{event}--> {to}");
                Some(Transition { from, to, effects })
            }
            None => {
                self.ignored += 1;
                debug!(state = %self.current, %event, "ignored event");
                None
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentEvent as E;
    use AgentState as S;
    use SideEffect as FX;

    fn machine_in(state: S) -> StateMachine {
        let mut m = StateMachine::new();
        match state {
            S::Idle => {}
            S::Initializing => {
                m.transition(E::ApiKeySet);
            }
            S::Ready => {
                m.transition(E::ApiKeySet);
                m.transition(E::InitSuccess);
            }
            S::Degraded => {
                m.transition(E::ApiKeySet);
                m.transition(E::InitSuccess);
                m.transition(E::WsDisconnected);
            }
            S::Error => {
                m.transition(E::ApiKeySet);
                m.transition(E::InitFailure);
            }
        }
        assert_eq!(m.current(), state);
        m
    }

    #[test]
    fn cold_start_with_token_initializes() {
        let mut m = StateMachine::new();
        let t = m.transition(E::Startup { has_token: true }).unwrap();
        assert_eq!(t.to, S::Initializing);
        assert_eq!(t.effects, &[FX::OrchestrateInit]);
    }

    #[test]
    fn cold_start_without_token_stays_idle() {
        let mut m = StateMachine::new();
        let t = m.transition(E::Startup { has_token: false }).unwrap();
        assert_eq!(t.to, S::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn full_happy_path() {
        let mut m = StateMachine::new();
        m.transition(E::Startup { has_token: true }).unwrap();
        let t = m.transition(E::InitSuccess).unwrap();
        assert_eq!(t.to, S::Ready);
        assert_eq!(t.effects, &[FX::ConnectChannel]);
    }

    #[test]
    fn transient_disconnect_and_recovery() {
        let mut m = machine_in(S::Ready);
        let t = m.transition(E::WsDisconnected).unwrap();
        assert_eq!(t.to, S::Degraded);
        assert_eq!(t.effects, &[FX::StartPolling]);
        let t = m.transition(E::WsConnected).unwrap();
        assert_eq!(t.to, S::Ready);
        assert_eq!(t.effects, &[FX::StopPolling]);
    }

    #[test]
    fn permanent_error_from_ready_and_degraded() {
        for start in [S::Ready, S::Degraded] {
            let mut m = machine_in(start);
            let t = m.transition(E::WsPermanentError).unwrap();
            assert_eq!(t.to, S::Error);
            assert_eq!(t.effects, &[FX::ShowErrorNotification]);
        }
    }

    #[test]
    fn error_recovers_via_new_token_or_reconnect() {
        let mut m = machine_in(S::Error);
        assert_eq!(m.transition(E::ApiKeySet).unwrap().to, S::Initializing);

        let mut m = machine_in(S::Error);
        let t = m.transition(E::AttemptReconnect { has_token: true }).unwrap();
        assert_eq!(t.to, S::Initializing);
        assert_eq!(t.effects, &[FX::OrchestrateInit]);

        let mut m = machine_in(S::Error);
        assert!(m.transition(E::AttemptReconnect { has_token: false }).is_none());
    }

    #[test]
    fn logout_from_every_state() {
        for start in [S::Idle, S::Initializing, S::Ready, S::Degraded, S::Error] {
            let mut m = machine_in(start);
            let t = m.transition(E::Logout).unwrap();
            assert_eq!(t.to, S::Idle);
            assert_eq!(t.effects, &[FX::LogoutCleanup]);
        }
    }

    #[test]
    fn unrecognized_pairs_are_counted_noops() {
        let mut m = machine_in(S::Ready);
        assert!(m.transition(E::InitSuccess).is_none());
        assert!(m.transition(E::WsConnected).is_none());
        assert_eq!(m.current(), S::Ready);
        assert_eq!(m.ignored_count(), 2);
    }
}
