//! Shared helpers for the relay-pool integration tests.
//!
//! [`MockRelay`] is an in-process WebSocket relay bound to `127.0.0.1:0`. It
//! records every frame clients send, answers through an optional responder, and
//! can push frames or drop the connection on demand.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_pool::{ConsumerHandle, Event, PoolConfig};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Builds replies to one inbound frame.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

enum Command {
    Send(String),
    Close,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    CloseImmediately,
}

pub struct MockRelay {
    url: String,
    connections: Arc<AtomicUsize>,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
}

impl MockRelay {
    /// A relay that records frames and never answers.
    pub async fn start() -> Self {
        Self::spawn(Mode::Serve, Arc::new(|_: &Value| Vec::<String>::new())).await
    }

    /// A relay that answers every frame through `responder`.
    pub async fn with_responder(responder: Responder) -> Self {
        Self::spawn(Mode::Serve, responder).await
    }

    /// A relay that accepts the handshake and closes straight away.
    pub async fn closing() -> Self {
        Self::spawn(Mode::CloseImmediately, Arc::new(|_: &Value| Vec::<String>::new())).await
    }

    async fn spawn(mode: Mode, responder: Responder) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>> = Arc::new(Mutex::new(None));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let accepted = Arc::clone(&connections);
        let slot = Arc::clone(&current);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                if mode == Mode::CloseImmediately {
                    let _ = ws.close(None).await;
                    continue;
                }

                let (command_tx, mut command_rx) = mpsc::unbounded_channel();
                *slot.lock() = Some(command_tx);
                let frames_tx = frames_tx.clone();
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            command = command_rx.recv() => match command {
                                Some(Command::Send(text)) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Close) | None => {
                                    let _ = write.close().await;
                                    break;
                                }
                            },
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                                        continue;
                                    };
                                    for reply in responder(&frame) {
                                        if write.send(Message::Text(reply.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    let _ = frames_tx.send(frame);
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}", addr),
            connections,
            frames: tokio::sync::Mutex::new(frames_rx),
            current,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Number of completed WebSocket handshakes so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next frame a client sent, waiting up to five seconds.
    pub async fn next_frame(&self) -> Value {
        let mut frames = self.frames.lock().await;
        timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("relay stopped")
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_no_frame(&self, wait: Duration) {
        let mut frames = self.frames.lock().await;
        if let Ok(Some(frame)) = timeout(wait, frames.recv()).await {
            panic!("unexpected frame: {}", frame);
        }
    }

    /// Push a raw frame to the connected client.
    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = self.current.lock().as_ref() {
            let _ = tx.send(Command::Send(text.into()));
        }
    }

    /// Drop the current connection.
    pub fn close_connection(&self) {
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.send(Command::Close);
        }
    }
}

/// Pool config tuned for tests.
pub fn test_config(relays: Vec<String>) -> PoolConfig {
    PoolConfig::new(relays)
        .reconnect_delay(Duration::from_millis(100))
        .connect_timeout(Duration::from_secs(2))
        .inactivity_timeout(Duration::from_secs(10))
        .publish_timeout(Duration::from_secs(2))
}

/// Wait until every url reports connected.
pub async fn wait_connected(consumer: &ConsumerHandle, urls: &[String]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let liveness = consumer.query_liveness().await.unwrap();
        if urls.iter().all(|url| liveness.get(url) == Some(&true)) {
            return;
        }
        assert!(Instant::now() < deadline, "relays never connected: {:?}", liveness);
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn event(id: &str, created_at: u64) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "a".repeat(64),
        created_at,
        kind: 1,
        tags: vec![],
        content: format!("note {}", id),
        sig: "b".repeat(128),
    }
}

/// `["EVENT", <sub>, <event>]`
pub fn event_frame(subscription_id: &str, event: &Event) -> String {
    serde_json::json!(["EVENT", subscription_id, event]).to_string()
}

pub fn frame_kind(frame: &Value) -> &str {
    frame[0].as_str().unwrap_or("")
}

pub fn frame_id(frame: &Value) -> &str {
    frame[1].as_str().unwrap_or("")
}

/// Responder that answers REQ with the given events and EOSE, and EVENT with OK.
pub fn stored_events(events: Vec<Event>) -> Responder {
    Arc::new(move |frame: &Value| match frame_kind(frame) {
        "REQ" => {
            let sub = frame_id(frame);
            let mut replies: Vec<String> = events.iter().map(|e| event_frame(sub, e)).collect();
            replies.push(serde_json::json!(["EOSE", sub]).to_string());
            replies
        }
        "EVENT" => {
            let id = frame[1]["id"].as_str().unwrap_or("");
            vec![serde_json::json!(["OK", id, true, ""]).to_string()]
        }
        _ => Vec::new(),
    })
}
