// mock_stream_server: A scriptable WebSocket server for stream tests.
//
// Accepts connections on ws://127.0.0.1:<port>/<anything>, keeps a handle
// per connection, and lets the test push frames or close with a chosen
// close code. Incoming client frames are drained and discarded.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

enum Script {
    SendText(String),
    Close(u16),
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Script>,
}

#[derive(Default)]
struct StreamState {
    connections: Vec<ConnectionHandle>,
    total_connections: u64,
}

/// A mock stream server for integration testing.
pub struct MockStreamServer {
    addr: SocketAddr,
    state: Arc<Mutex<StreamState>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockStreamServer {
    /// Start the server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(StreamState::default()));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        {
                            let mut guard = accept_state.lock().unwrap();
                            guard.connections.push(ConnectionHandle { tx });
                            guard.total_connections += 1;
                        }
                        tokio::spawn(async move {
                            let _ = serve_connection(stream, rx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    /// Stream base URL; the client appends `/<token>`.
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connections accepted over the server's lifetime.
    pub fn total_connections(&self) -> u64 {
        self.state.lock().unwrap().total_connections
    }

    /// Wait until at least `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: u64, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if self.total_connections() >= n {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        false
    }

    /// Send a raw JSON frame on the most recent connection.
    pub fn send_frame(&self, frame: &serde_json::Value) {
        let guard = self.state.lock().unwrap();
        if let Some(conn) = guard.connections.last() {
            let _ = conn.tx.send(Script::SendText(frame.to_string()));
        }
    }

    pub fn send_nop(&self) {
        self.send_frame(&serde_json::json!({"type": "nop"}));
    }

    pub fn send_tickle(&self, subtype: &str) {
        self.send_frame(&serde_json::json!({"type": "tickle", "subtype": subtype}));
    }

    pub fn send_push_frame(&self, push: &serde_json::Value) {
        self.send_frame(&serde_json::json!({"type": "push", "push": push}));
    }

    /// Send a typed frame from the protocol crate.
    pub fn send_stream_frame(&self, frame: &pb_protocol::StreamFrame) {
        let value = serde_json::to_value(frame).expect("stream frames always serialize");
        self.send_frame(&value);
    }

    /// Close the most recent connection with the given close code.
    pub fn close_latest(&self, code: u16) {
        let guard = self.state.lock().unwrap();
        if let Some(conn) = guard.connections.last() {
            let _ = conn.tx.send(Script::Close(code));
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    mut script_rx: mpsc::UnboundedReceiver<Script>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    loop {
        tokio::select! {
            script = script_rx.recv() => {
                match script {
                    None => break,
                    Some(Script::SendText(text)) => {
                        ws.send(Message::Text(text.into())).await?;
                    }
                    Some(Script::Close(code)) => {
                        ws.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: "scripted close".into(),
                        })))
                        .await?;
                        break;
                    }
                }
            }
            msg = ws.next() => {
                match msg {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        ws.send(Message::Pong(data)).await?;
                    }
                    // Client frames are irrelevant to the scripts.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    Ok(())
}
