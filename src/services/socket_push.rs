//! Socket.IO (Engine.IO v4) push transport over a WebSocket.
//!
//! Reconnects on its own with the same stepped backoff the delivery queue
//! uses: 5s, 15s, 45s, 2min, then every 5min.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::push::{PushConnection, PushEvent, PushTransport};
use crate::error::{ChatError, Result};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Decoded Engine.IO / Socket.IO text packet.
#[derive(Debug, Clone, PartialEq)]
enum Packet {
    Open,
    Close,
    Ping,
    Pong,
    Connect,
    Disconnect,
    Event {
        name: String,
        payload: serde_json::Value,
    },
    ConnectError(String),
    Other,
}

fn parse_packet(text: &str) -> Packet {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Packet::Open,
        Some('1') => Packet::Close,
        Some('2') => Packet::Ping,
        Some('3') => Packet::Pong,
        Some('4') => parse_socket_packet(chars.as_str()),
        _ => Packet::Other,
    }
}

fn parse_socket_packet(body: &str) -> Packet {
    let mut chars = body.chars();
    match chars.next() {
        Some('0') => Packet::Connect,
        Some('1') => Packet::Disconnect,
        Some('2') => {
            // Optional ack id precedes the JSON array
            let rest = chars.as_str().trim_start_matches(|c: char| c.is_ascii_digit());
            match serde_json::from_str::<Vec<serde_json::Value>>(rest) {
                Ok(mut items) if !items.is_empty() => {
                    let Some(name) = items[0].as_str().map(str::to_string) else {
                        return Packet::Other;
                    };
                    let payload = if items.len() > 1 {
                        items.swap_remove(1)
                    } else {
                        serde_json::Value::Null
                    };
                    Packet::Event { name, payload }
                }
                _ => Packet::Other,
            }
        }
        Some('4') => Packet::ConnectError(chars.as_str().to_string()),
        _ => Packet::Other,
    }
}

fn encode_event(name: &str, payload: &serde_json::Value) -> String {
    format!("42{}", serde_json::json!([name, payload]))
}

/// Map the chat server's HTTP base URL to its Socket.IO WebSocket endpoint.
pub fn socket_url(base: &url::Url) -> Result<url::Url> {
    let mut url = base
        .join("socket.io/")
        .map_err(|e| ChatError::ConfigError(format!("Socket URL: {}", e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChatError::ConfigError(format!(
                "Unsupported server scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::ConfigError(format!("Cannot use scheme {}", scheme)))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// Reconnect delay after `attempt` consecutive failures.
fn reconnect_delay(attempt: u32) -> Duration {
    let secs = match attempt {
        0 | 1 => 5,
        2 => 15,
        3 => 45,
        4 => 120,
        _ => 300,
    };
    Duration::from_secs(secs)
}

/// Socket.IO client transport. Writes go through a channel to the socket task.
pub struct SocketIoTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketIoTransport {
    /// Start connecting in the background and return the connection handle.
    pub fn connect(server_url: &url::Url, session_cookie: Option<String>) -> Result<PushConnection> {
        let url = socket_url(server_url)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let supervisor = Supervisor {
            url,
            session_cookie,
            events: event_tx,
            outbound: outbound_rx,
            connected: connected.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        let transport = Arc::new(Self {
            outbound: outbound_tx,
            connected,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        });
        Ok(PushConnection::new(transport, event_rx))
    }
}

#[async_trait]
impl PushTransport for SocketIoTransport {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChatError::TransportError("push not connected".to_string()));
        }
        self.outbound
            .send(encode_event(event, &payload))
            .map_err(|_| ChatError::TransportError("push socket task stopped".to_string()))
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            log::warn!("Push socket did not close in time, aborting");
            task.abort();
        }
    }
}

struct Supervisor {
    url: url::Url,
    session_cookie: Option<String>,
    events: mpsc::UnboundedSender<PushEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed(reason)) => {
                    failures = 1;
                    self.mark_disconnected(reason);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    log::warn!("Push connection failed: {}", e);
                    self.mark_disconnected(e.to_string());
                }
            }

            let delay = reconnect_delay(failures);
            log::info!("Reconnecting push in {}s", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(PushEvent::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
        log::info!("Push transport stopped");
    }

    fn mark_disconnected(&self, reason: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::warn!("Push disconnected: {}", reason);
            let _ = self.events.send(PushEvent::Disconnected { reason });
        }
    }

    async fn run_once(&mut self) -> Result<SessionEnd> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::TransportError(format!("Socket request: {}", e)))?;
        if let Some(cookie) = &self.session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| ChatError::ConfigError(format!("Session cookie: {}", e)))?;
            request.headers_mut().insert("Cookie", value);
        }

        let (ws, _) = tokio::select! {
            res = tokio_tungstenite::connect_async(request) => res
                .map_err(|e| ChatError::TransportError(format!("Socket connect: {}", e)))?,
            _ = self.shutdown.changed() => return Ok(SessionEnd::Shutdown),
        };
        log::debug!("WebSocket open to {}", self.url);
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Closed("socket closed".to_string()))
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(ChatError::TransportError(format!("Socket read: {}", e)))
                        }
                    };
                    let reply = match parse_packet(&text) {
                        Packet::Open => Some("40".to_string()),
                        Packet::Ping => Some("3".to_string()),
                        Packet::Connect => {
                            if !self.connected.swap(true, Ordering::SeqCst) {
                                log::info!("Push connected");
                                let _ = self.events.send(PushEvent::Connected);
                            }
                            None
                        }
                        Packet::Event { name, payload } => {
                            let _ = self.events.send(PushEvent::Event { name, payload });
                            None
                        }
                        Packet::Disconnect | Packet::Close => {
                            return Ok(SessionEnd::Closed("server disconnect".to_string()))
                        }
                        Packet::ConnectError(reason) => {
                            return Err(ChatError::TransportError(format!(
                                "Namespace connect refused: {}",
                                reason
                            )))
                        }
                        Packet::Pong | Packet::Other => None,
                    };
                    if let Some(reply) = reply {
                        sink.send(Message::Text(reply))
                            .await
                            .map_err(|e| ChatError::TransportError(format!("Socket write: {}", e)))?;
                    }
                }
                out = self.outbound.recv() => {
                    let Some(packet) = out else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    sink.send(Message::Text(packet))
                        .await
                        .map_err(|e| ChatError::TransportError(format!("Socket write: {}", e)))?;
                }
                _ = self.shutdown.changed() => {
                    let _ = sink.send(Message::Text("41".to_string())).await;
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}
