//! Single relay connection management
//!
//! A [`RelayConnection`] owns one background socket task that connects, pumps
//! frames in both directions, and reconnects after a fixed delay whenever the
//! socket goes away. Transport failures never surface as errors to callers;
//! they show up as [`ConnectionEvent::Closed`] and a `Disconnected` state.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::pool::PoolEvent;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Disconnected, waiting to reconnect
    Disconnected,
}

/// Liveness changes and inbound frames of one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket is open
    Opened { relay_url: String },
    /// Socket closed or a connect attempt failed
    Closed { relay_url: String, reason: String },
    /// Parsed frame from the relay
    Message {
        relay_url: String,
        message: RelayMessage,
    },
}

impl ConnectionEvent {
    pub fn relay_url(&self) -> &str {
        match self {
            ConnectionEvent::Opened { relay_url }
            | ConnectionEvent::Closed { relay_url, .. }
            | ConnectionEvent::Message { relay_url, .. } => relay_url,
        }
    }
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Fixed delay before reconnecting
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    /// Socket went away; reconnect
    Closed(String),
    /// Nobody is listening anymore; stop for good
    Shutdown,
}

/// Relay connection
pub struct RelayConnection {
    /// Address exactly as configured; the pool keys relays by it
    address: String,
    /// Parsed form of `address`
    url: Url,
    /// Configuration
    config: RelayConfig,
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Outgoing frames for the socket task
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Taken by the socket task on start
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Number of disconnects that scheduled a reconnect
    reconnect_attempts: Arc<AtomicU32>,
    /// Socket task handle
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url_str: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url_str)?;

        // Validate WebSocket URL
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            address: url_str.to_string(),
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
        })
    }

    /// Relay address as configured (events carry this, not the normalized URL)
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get relay URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Check if the socket is down
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Number of reconnects scheduled so far
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Spawn the socket task. Events are reported on `events`.
    ///
    /// Calling this more than once has no effect.
    pub fn start(&self, events: mpsc::UnboundedSender<PoolEvent>) {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            debug!("Relay {} already started", self.url);
            return;
        };

        let handle = tokio::spawn(Self::run(
            self.address.clone(),
            self.config.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.reconnect_attempts),
            outbound_rx,
            events,
        ));
        *self.task.lock() = Some(handle);
    }

    /// Stop the socket task; no further reconnects happen.
    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            info!("Disconnecting from relay: {}", self.url);
            handle.abort();
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Queue a frame for the relay
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_text(message.to_json()?)
    }

    /// Queue a raw text frame for the relay
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.outbound_tx
            .send(text)
            .map_err(|_| ClientError::NotConnected)
    }

    async fn run(
        url: String,
        config: RelayConfig,
        state: Arc<RwLock<ConnectionState>>,
        reconnect_attempts: Arc<AtomicU32>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) {
        loop {
            *state.write() = ConnectionState::Connecting;
            info!("Connecting to relay: {}", url);

            let reason = match timeout(config.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    *state.write() = ConnectionState::Connected;
                    info!("Connected to relay: {}", url);
                    let opened = PoolEvent::Connection(ConnectionEvent::Opened {
                        relay_url: url.clone(),
                    });
                    if events.send(opened).is_err() {
                        return;
                    }
                    match Self::session(ws, &url, &mut outbound_rx, &events).await {
                        SessionEnd::Closed(reason) => reason,
                        SessionEnd::Shutdown => {
                            *state.write() = ConnectionState::Disconnected;
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to relay {}: {}", url, e);
                    e.to_string()
                }
                Err(_) => {
                    warn!("Connection timeout for relay {}", url);
                    format!("Connection timeout after {:?}", config.connect_timeout)
                }
            };

            *state.write() = ConnectionState::Disconnected;
            let closed = PoolEvent::Connection(ConnectionEvent::Closed {
                relay_url: url.clone(),
                reason,
            });
            if events.send(closed).is_err() {
                return;
            }

            reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            debug!("Reconnecting to {} in {:?}", url, config.reconnect_delay);
            sleep(config.reconnect_delay).await;

            // Frames queued for the previous session are stale.
            while outbound_rx.try_recv().is_ok() {}
        }
    }

    async fn session(
        ws: WsStream,
        url: &str,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        events: &mpsc::UnboundedSender<PoolEvent>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(text) = frame else {
                        let _ = write.close().await;
                        return SessionEnd::Shutdown;
                    };
                    debug!("Sending to {}: {}", url, text);
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("Failed to send to {}: {}", url, e);
                        return SessionEnd::Closed(e.to_string());
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", url, text.as_str());
                        match RelayMessage::from_json(text.as_str()) {
                            Ok(message) => {
                                let event = PoolEvent::Connection(ConnectionEvent::Message {
                                    relay_url: url.to_string(),
                                    message,
                                });
                                if events.send(event).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(e) => warn!("Dropping malformed frame from {}: {}", url, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Closed(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Relay {} closed connection", url);
                        return SessionEnd::Closed("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", url, e);
                        return SessionEnd::Closed(e.to_string());
                    }
                    None => {
                        return SessionEnd::Closed("stream ended".to_string());
                    }
                },
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
