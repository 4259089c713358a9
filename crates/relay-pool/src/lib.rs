//! Nostr relay connection pool and subscription multiplexer.
//!
//! This crate provides:
//! - Persistent WebSocket connections to many relays, reconnecting after a fixed delay
//! - Message parsing (NIP-01 relay protocol)
//! - Per-connection admission of keep-alive and instant subscriptions
//! - Fan-out of one subscription to a selection of relays
//! - A broker task that lets many consumers share one pool of connections
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_pool::{Broker, Filter, PoolConfig, SubscribeOptions};
//!
//! #[tokio::main]
//! async fn main() -> relay_pool::Result<()> {
//!     let config = PoolConfig::new(vec![
//!         "wss://relay.damus.io".to_string(),
//!         "wss://nos.lol".to_string(),
//!     ]);
//!     let broker = Broker::spawn(config)?;
//!     let consumer = broker.connect()?;
//!
//!     // One-shot query: ends on EOSE or after the inactivity timeout.
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let notes = consumer
//!         .subscribe(filter, SubscribeOptions::instant())
//!         .await?
//!         .collect_events(Some(10))
//!         .await;
//!     println!("Got {} notes", notes.len());
//!
//!     // Long-lived feed.
//!     let filter = Filter::new().kinds(vec![1]).pubkey_refs(vec!["<pubkey>".to_string()]);
//!     let mut mentions = consumer
//!         .subscribe(filter, SubscribeOptions::keep_alive().id("mentions"))
//!         .await?;
//!     while let Some(received) = mentions.next().await {
//!         println!("{} from {}", received.event.id, received.relay_url);
//!     }
//!
//!     broker.shutdown().await
//! }
//! ```

pub mod admission;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod pool;
pub mod relay;
pub mod selection;
pub mod stream;
pub mod subscription;

// Re-export main types
pub use admission::{Admission, InstantOverflow, PoolAction, SubscriptionLimits, SubscriptionPools};
pub use broker::{Broker, BrokerHandle, Notification, Request};
pub use config::PoolConfig;
pub use consumer::{ConsumerHandle, PublishHandle, SubscribeOptions, SubscriptionHandle};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Event, Filter, MessageError, RelayMessage};
pub use pool::{
    PoolEvent, PoolNotice, PoolStats, PoolSubscription, PublishResult, PublishTicket, RelayPool,
    SubscribeRequest,
};
pub use relay::{ConnectionEvent, ConnectionState, RelayConfig, RelayConnection};
pub use selection::{CallRelay, CallRelayKind, RelaySelection};
pub use stream::{ReceivedEvent, StreamEnd, StreamRelease, StreamStatus, SubscriptionStream};
pub use subscription::{ConsumerId, SubscriptionTracker, generate_subscription_id};
