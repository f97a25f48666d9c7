//! Real-time channel controller.
//!
//! Owns the single streaming connection to the cloud. A spawned reader
//! task turns transport callbacks into [`ChannelEvent`]s on an mpsc
//! channel; the agent loop feeds them back into the controller, which
//! classifies closes, drives the reconnect/polling machinery, and leaves
//! the actual state transitions to the state machine.
//!
//! Only this module touches the transport. At most one connection exists
//! at a time; `connect` closes the previous one first, and a generation
//! counter discards events from connections that have been superseded.

use futures_util::{SinkExt, StreamExt};
use pb_protocol::StreamFrame;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::alarms::{ALARM_POLLING_FALLBACK, ALARM_WEBSOCKET_RECONNECT, Alarms};
use crate::config::TimingConfig;

/// Consecutive transient failures before polling fallback engages.
pub const POLLING_THRESHOLD: u32 = 3;

/// Close code reported when the transport dies without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// What a close code means for the reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Deliberate shutdown; no reconnect, no error surface.
    Clean,
    /// Reconnect after the usual delay.
    Transient,
    /// Stop reconnecting; requires user action.
    Permanent,
}

/// Close codes 1008, 4001 and everything in [4000, 5000) are permanent;
/// a completed close handshake with a normal status is clean; everything
/// else is transient.
pub fn classify_close(code: u16, was_clean: bool) -> CloseClass {
    if code == 1008 || (4000..5000).contains(&code) {
        return CloseClass::Permanent;
    }
    if was_clean && (code == 1000 || code == 1005) {
        return CloseClass::Clean;
    }
    CloseClass::Transient
}

/// Events emitted by the reader task.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened {
        generation: u64,
    },
    Frame {
        generation: u64,
        frame: StreamFrame,
    },
    Closed {
        generation: u64,
        code: u16,
        was_clean: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Open,
}

struct Connection {
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// The channel controller. Owned (mutably) by the agent loop.
pub struct Channel {
    stream_base: String,
    timing: TimingConfig,
    alarms: Alarms,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    status: ChannelStatus,
    consecutive_failures: u32,
    polling: bool,
    generation: u64,
    connection: Option<Connection>,
    last_frame_at: Arc<Mutex<Instant>>,
}

impl Channel {
    /// Create the controller and the event receiver the agent loop drains.
    pub fn new(
        stream_base: &str,
        timing: TimingConfig,
        alarms: Alarms,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                stream_base: stream_base.trim_end_matches('/').to_owned(),
                timing,
                alarms,
                events_tx,
                status: ChannelStatus::Disconnected,
                consecutive_failures: 0,
                polling: false,
                generation: 0,
                connection: None,
                last_frame_at: Arc::new(Mutex::new(Instant::now())),
            },
            events_rx,
        )
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, ChannelStatus::Open | ChannelStatus::Connecting)
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // -----------------------------------------------------------------------
    // Connect / close
    // -----------------------------------------------------------------------

    /// Open a new connection, closing any prior one first.
    pub fn connect(&mut self, token: &str) {
        self.close();
        self.generation += 1;
        let generation = self.generation;
        self.status = ChannelStatus::Connecting;

        let url = format!("{}/{}", self.stream_base, token);
        let events_tx = self.events_tx.clone();
        let last_frame_at = Arc::clone(&self.last_frame_at);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            reader_task(url, generation, events_tx, last_frame_at, shutdown_rx).await;
        });
        self.connection = Some(Connection {
            generation,
            shutdown_tx,
            task,
        });
        info!(generation, "stream connecting");
    }

    /// Deliberately close the current connection, if any. No close event
    /// is emitted for a shutdown we initiated.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.shutdown_tx.send(true);
            conn.task.abort();
            debug!(generation = conn.generation, "stream closed locally");
        }
        self.status = ChannelStatus::Disconnected;
    }

    // -----------------------------------------------------------------------
    // Event handling (called from the agent loop)
    // -----------------------------------------------------------------------

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Record a successful open. Returns false for a stale connection.
    pub fn handle_opened(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            debug!(generation, "ignoring open from superseded connection");
            return false;
        }
        self.status = ChannelStatus::Open;
        self.consecutive_failures = 0;
        self.alarms.cancel(ALARM_WEBSOCKET_RECONNECT);
        self.stop_polling();
        info!(generation, "stream connected");
        true
    }

    /// Whether a frame from this generation should be processed.
    pub fn accept_frame(&self, generation: u64) -> bool {
        self.is_current(generation)
    }

    /// Classify a close and run the reconnect policy for transient ones.
    /// Returns `None` for stale connections.
    pub fn handle_closed(
        &mut self,
        generation: u64,
        code: u16,
        was_clean: bool,
    ) -> Option<CloseClass> {
        if !self.is_current(generation) {
            debug!(generation, code, "ignoring close from superseded connection");
            return None;
        }
        self.connection = None;
        self.status = ChannelStatus::Disconnected;

        let class = classify_close(code, was_clean);
        match class {
            CloseClass::Clean => {
                info!(code, "stream closed cleanly");
            }
            CloseClass::Permanent => {
                warn!(code, "stream closed permanently, not reconnecting");
                self.alarms.cancel(ALARM_WEBSOCKET_RECONNECT);
            }
            CloseClass::Transient => {
                self.consecutive_failures += 1;
                warn!(
                    code,
                    failures = self.consecutive_failures,
                    "stream closed, scheduling reconnect"
                );
                self.maybe_start_polling();
                self.alarms.schedule_once(
                    ALARM_WEBSOCKET_RECONNECT,
                    Duration::from_millis(self.timing.reconnect_delay_ms),
                );
            }
        }
        Some(class)
    }

    // -----------------------------------------------------------------------
    // Polling fallback
    // -----------------------------------------------------------------------

    /// Enter polling mode when the failure threshold is met. Idempotent.
    pub fn maybe_start_polling(&mut self) {
        if self.polling || self.consecutive_failures < POLLING_THRESHOLD {
            return;
        }
        self.polling = true;
        self.alarms.schedule_periodic(
            ALARM_POLLING_FALLBACK,
            Duration::from_millis(self.timing.polling_period_ms),
        );
        info!(
            failures = self.consecutive_failures,
            "entering polling fallback"
        );
    }

    pub fn stop_polling(&mut self) {
        if !self.polling {
            return;
        }
        self.polling = false;
        self.alarms.cancel(ALARM_POLLING_FALLBACK);
        info!("leaving polling fallback");
    }

    // -----------------------------------------------------------------------
    // Heartbeat watchdog
    // -----------------------------------------------------------------------

    /// Periodic diagnostics: ready-state plus time since the last frame.
    /// A stale stream is reported, not reconnected; the close code from
    /// the transport drives reconnects.
    pub fn health_check(&self) {
        let elapsed = self.last_frame_at.lock().unwrap().elapsed();
        let stale = self.status == ChannelStatus::Open
            && elapsed > Duration::from_millis(self.timing.nop_stale_threshold_ms);
        if stale {
            warn!(
                status = ?self.status,
                since_last_frame_ms = elapsed.as_millis() as u64,
                "no keep-alive within threshold"
            );
        } else {
            debug!(
                status = ?self.status,
                since_last_frame_ms = elapsed.as_millis() as u64,
                "stream health"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

async fn reader_task(
    url: String,
    generation: u64,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    last_frame_at: Arc<Mutex<Instant>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let connect = tokio_tungstenite::connect_async(&url);
    let mut ws = tokio::select! {
        biased;
        _ = shutdown_rx.changed() => return,
        result = connect => match result {
            Ok((ws, _response)) => ws,
            Err(e) => {
                debug!(generation, error = %e, "stream connect failed");
                let _ = events_tx.send(ChannelEvent::Closed {
                    generation,
                    code: ABNORMAL_CLOSE,
                    was_clean: false,
                });
                return;
            }
        },
    };

    let _ = events_tx.send(ChannelEvent::Opened { generation });
    *last_frame_at.lock().unwrap() = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = ws.close(None).await;
                    return;
                }
            }
            msg = ws.next() => {
                match msg {
                    None => {
                        let _ = events_tx.send(ChannelEvent::Closed {
                            generation,
                            code: ABNORMAL_CLOSE,
                            was_clean: false,
                        });
                        return;
                    }
                    Some(Err(e)) => {
                        debug!(generation, error = %e, "stream read error");
                        let _ = events_tx.send(ChannelEvent::Closed {
                            generation,
                            code: ABNORMAL_CLOSE,
                            was_clean: false,
                        });
                        return;
                    }
                    Some(Ok(Message::Text(text))) => {
                        *last_frame_at.lock().unwrap() = Instant::now();
                        match serde_json::from_str::<StreamFrame>(&text) {
                            Ok(frame) => {
                                let _ = events_tx.send(ChannelEvent::Frame { generation, frame });
                            }
                            Err(e) => warn!(generation, error = %e, "undecodable frame"),
                        }
                    }
                    Some(Ok(Message::Close(close_frame))) => {
                        let (code, was_clean) = match close_frame {
                            Some(cf) => (u16::from(cf.code), true),
                            None => (1005, true),
                        };
                        let _ = events_tx.send(ChannelEvent::Closed {
                            generation,
                            code,
                            was_clean,
                        });
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_classification_table() {
        // (code, was_clean) -> class
        let cases = [
            (1000, true, CloseClass::Clean),
            (1000, false, CloseClass::Transient),
            (1005, true, CloseClass::Clean),
            (1006, false, CloseClass::Transient),
            (1008, true, CloseClass::Permanent),
            (1008, false, CloseClass::Permanent),
            (1011, false, CloseClass::Transient),
            (3000, false, CloseClass::Transient),
            (4000, true, CloseClass::Permanent),
            (4001, true, CloseClass::Permanent),
            (4500, false, CloseClass::Permanent),
            (4999, true, CloseClass::Permanent),
            (5000, false, CloseClass::Transient),
        ];
        for (code, was_clean, expected) in cases {
            assert_eq!(
                classify_close(code, was_clean),
                expected,
                "code {code} clean {was_clean}"
            );
        }
    }

    fn test_channel() -> (Channel, Alarms) {
        let (alarms, _rx) = Alarms::new();
        let timing = TimingConfig::default();
        let (channel, _events) = Channel::new("wss://example.test/ws", timing, alarms.clone());
        (channel, alarms)
    }

    #[tokio::test]
    async fn transient_close_schedules_reconnect_and_counts() {
        let (mut channel, alarms) = test_channel();
        channel.generation = 1;

        let class = channel.handle_closed(1, 1006, false).unwrap();
        assert_eq!(class, CloseClass::Transient);
        assert_eq!(channel.consecutive_failures(), 1);
        assert!(alarms.is_scheduled(ALARM_WEBSOCKET_RECONNECT));
        assert!(!channel.is_polling(), "below threshold");
    }

    #[tokio::test]
    async fn third_transient_failure_starts_polling_and_open_stops_it() {
        let (mut channel, alarms) = test_channel();
        for i in 1..=3u64 {
            channel.generation = i;
            channel.handle_closed(i, 1006, false);
        }
        assert_eq!(channel.consecutive_failures(), 3);
        assert!(channel.is_polling());
        assert!(alarms.is_scheduled(ALARM_POLLING_FALLBACK));

        channel.generation = 4;
        assert!(channel.handle_opened(4));
        assert_eq!(channel.consecutive_failures(), 0);
        assert!(!channel.is_polling());
        assert!(!alarms.is_scheduled(ALARM_POLLING_FALLBACK));
        assert!(!alarms.is_scheduled(ALARM_WEBSOCKET_RECONNECT));
    }

    #[tokio::test]
    async fn permanent_close_never_schedules_reconnect() {
        let (mut channel, alarms) = test_channel();
        for code in [1008u16, 4001, 4500] {
            channel.generation += 1;
            let class = channel
                .handle_closed(channel.generation, code, true)
                .unwrap();
            assert_eq!(class, CloseClass::Permanent);
            assert!(!alarms.is_scheduled(ALARM_WEBSOCKET_RECONNECT), "code {code}");
        }
        assert_eq!(channel.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let (mut channel, _alarms) = test_channel();
        channel.generation = 5;
        assert!(!channel.handle_opened(4));
        assert!(channel.handle_closed(3, 1006, false).is_none());
        assert!(!channel.accept_frame(2));
        assert!(channel.accept_frame(5));
        assert_eq!(channel.consecutive_failures(), 0);
    }
}
