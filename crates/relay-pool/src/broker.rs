//! Multiplexing broker.
//!
//! One task owns the [`RelayPool`] and serializes every mutation of it. Consumers
//! talk to the broker through [`ConsumerHandle`]s: each request carries the
//! consumer's id and a one-shot reply channel, and every subscription id a
//! consumer uses is namespaced as `<consumer>:<id>` before it reaches a relay.

use crate::admission::Admission;
use crate::config::PoolConfig;
use crate::consumer::{ConsumerHandle, SubscribeOptions};
use crate::error::{ClientError, Result};
use crate::message::{Event, Filter};
use crate::pool::{
    PoolEvent, PoolNotice, PoolStats, PoolSubscription, PublishTicket, RelayPool, SubscribeRequest,
};
use crate::selection::RelaySelection;
use crate::subscription::{ConsumerId, generate_subscription_id, namespaced_id, owner_of};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Pushed to every consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A relay connected or disconnected; the full liveness map follows
    Liveness(IndexMap<String, bool>),
    /// Relay NOTICE frame
    Notice { relay_url: String, message: String },
    /// Relay AUTH challenge (NIP-42)
    AuthChallenge { relay_url: String, challenge: String },
    /// Another consumer replaced the relay set
    RelaysSwitched { relays: Vec<String> },
}

/// Consumer requests. Each carries its own reply channel.
#[derive(Debug)]
pub enum Request {
    Subscribe {
        filter: Filter,
        options: SubscribeOptions,
        reply: oneshot::Sender<Result<PoolSubscription>>,
    },
    Unsubscribe {
        id: String,
        reply: oneshot::Sender<()>,
    },
    Publish {
        event: Event,
        selection: RelaySelection,
        reply: oneshot::Sender<PublishTicket>,
    },
    AddRelay {
        url: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveRelay {
        url: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SwitchRelays {
        urls: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    QueryLiveness {
        reply: oneshot::Sender<IndexMap<String, bool>>,
    },
    Stats {
        reply: oneshot::Sender<Vec<PoolStats>>,
    },
}

#[derive(Debug)]
pub(crate) enum Inbox {
    Connect {
        consumer: ConsumerId,
        notifications: mpsc::UnboundedSender<Notification>,
    },
    Request {
        consumer: ConsumerId,
        request: Request,
    },
    Disconnect(ConsumerId),
    Shutdown(oneshot::Sender<()>),
}

struct ConsumerState {
    notifications: mpsc::UnboundedSender<Notification>,
    /// (relay url, namespaced id) of live or shared keep-alive subscriptions
    keep_alive: HashSet<(String, String)>,
}

/// Cloneable handle used to attach consumers to a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    inbox: mpsc::UnboundedSender<Inbox>,
    next_consumer: Arc<AtomicU64>,
    config: Arc<PoolConfig>,
}

impl BrokerHandle {
    /// Attach a new consumer.
    pub fn connect(&self) -> Result<ConsumerHandle> {
        let consumer = ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbox
            .send(Inbox::Connect {
                consumer,
                notifications: tx,
            })
            .map_err(|_| ClientError::BrokerClosed)?;
        Ok(ConsumerHandle::new(
            consumer,
            self.inbox.clone(),
            rx,
            Arc::clone(&self.config),
        ))
    }

    /// Whether the broker task has stopped.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Stop every connection and end the broker task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Inbox::Shutdown(tx))
            .map_err(|_| ClientError::BrokerClosed)?;
        rx.await.map_err(|_| ClientError::BrokerClosed)
    }
}

/// The broker task state.
pub struct Broker {
    pool: RelayPool,
    pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    inbox: mpsc::UnboundedReceiver<Inbox>,
    handle: Option<BrokerHandle>,
    consumers: HashMap<ConsumerId, ConsumerState>,
}

impl Broker {
    /// Build a broker and its pool. Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let mut pool = RelayPool::new(config.clone())?;
        let pool_events = pool
            .take_events()
            .ok_or_else(|| ClientError::InvalidConfig("pool events already taken".to_string()))?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Ok(Self {
            pool,
            pool_events,
            inbox,
            handle: Some(BrokerHandle {
                inbox: inbox_tx,
                next_consumer: Arc::new(AtomicU64::new(1)),
                config: Arc::new(config),
            }),
            consumers: HashMap::new(),
        })
    }

    /// Build a broker and run it on a new task.
    pub fn spawn(config: PoolConfig) -> Result<BrokerHandle> {
        let broker = Self::new(config)?;
        let handle = broker.handle().ok_or(ClientError::BrokerClosed)?;
        tokio::spawn(broker.run());
        Ok(handle)
    }

    /// Handle for attaching consumers; `None` once the broker runs.
    pub fn handle(&self) -> Option<BrokerHandle> {
        self.handle.clone()
    }

    /// Process messages until shutdown or until every handle is gone.
    pub async fn run(mut self) {
        // Only handles held by others keep the inbox open.
        self.handle = None;
        let mut monitor = self.pool.config().monitor_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!("Broker started with {} relays", self.pool.relay_urls().len());
        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => {
                        if !self.handle_inbox(message) {
                            return;
                        }
                    }
                    None => break,
                },
                Some(event) = self.pool_events.recv() => {
                    let notices = self.pool.handle_event(event);
                    self.dispatch(notices);
                }
                _ = tick(&mut monitor) => self.pool.log_stats(),
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        info!("Broker shutting down");
        let notices = self.pool.shutdown();
        self.dispatch(notices);
        self.consumers.clear();
    }

    /// Returns `false` once the broker should stop.
    fn handle_inbox(&mut self, message: Inbox) -> bool {
        match message {
            Inbox::Connect {
                consumer,
                notifications,
            } => {
                debug!("Consumer {} connected", consumer);
                self.consumers.insert(
                    consumer,
                    ConsumerState {
                        notifications,
                        keep_alive: HashSet::new(),
                    },
                );
            }
            Inbox::Request { consumer, request } => self.handle_request(consumer, request),
            Inbox::Disconnect(consumer) => self.disconnect(consumer),
            Inbox::Shutdown(reply) => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_request(&mut self, consumer: ConsumerId, request: Request) {
        match request {
            Request::Subscribe {
                filter,
                options,
                reply,
            } => {
                let local = options.id.clone().unwrap_or_else(generate_subscription_id);
                let id = namespaced_id(consumer, &local);
                let keep_alive = options.keep_alive;
                let result = self.pool.subscribe(SubscribeRequest {
                    id: id.clone(),
                    filter,
                    keep_alive,
                    selection: options.selection,
                    inactivity_timeout: options.inactivity_timeout,
                });
                let result = match result {
                    Ok((subscription, notices)) => {
                        self.dispatch(notices);
                        if keep_alive && let Some(state) = self.consumers.get_mut(&consumer) {
                            for (url, admission) in &subscription.admissions {
                                if matches!(admission, Admission::Activated | Admission::Duplicate { .. }) {
                                    state.keep_alive.insert((url.clone(), id.clone()));
                                }
                            }
                        }
                        Ok(subscription)
                    }
                    Err(e) => {
                        warn!("Subscribe {} for consumer {} rejected: {}", local, consumer, e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Request::Unsubscribe { id, reply } => {
                let notices = self.pool.unsubscribe(&namespaced_id(consumer, &id));
                self.dispatch(notices);
                let _ = reply.send(());
            }
            Request::Publish {
                event,
                selection,
                reply,
            } => {
                let _ = reply.send(self.pool.publish(event, &selection));
            }
            Request::AddRelay { url, reply } => {
                let _ = reply.send(self.pool.add_relay(&url));
            }
            Request::RemoveRelay { url, reply } => {
                let result = match self.pool.remove_relay(&url) {
                    Ok(notices) => {
                        self.dispatch(notices);
                        self.broadcast(Notification::Liveness(self.pool.liveness()), None);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::SwitchRelays { urls, reply } => {
                let result = match self.pool.switch_relays(&urls) {
                    Ok(notices) => {
                        self.dispatch(notices);
                        self.broadcast(Notification::RelaysSwitched { relays: urls }, Some(consumer));
                        self.broadcast(Notification::Liveness(self.pool.liveness()), None);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::QueryLiveness { reply } => {
                let _ = reply.send(self.pool.liveness());
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.pool.stats());
            }
        }
    }

    fn disconnect(&mut self, consumer: ConsumerId) {
        let Some(state) = self.consumers.remove(&consumer) else {
            return;
        };
        info!(
            "Consumer {} disconnected, closing {} keep-alive subscriptions",
            consumer,
            state.keep_alive.len()
        );
        let mut notices = Vec::new();
        for (url, id) in state.keep_alive {
            notices.extend(self.pool.unsubscribe_on(&url, &id));
        }
        self.dispatch(notices);
    }

    fn dispatch(&mut self, notices: Vec<PoolNotice>) {
        let mut liveness_changed = false;
        for notice in notices {
            match notice {
                PoolNotice::Liveness {
                    relay_url,
                    connected,
                } => {
                    debug!("Relay {} liveness: {}", relay_url, connected);
                    liveness_changed = true;
                }
                PoolNotice::Notice { relay_url, message } => {
                    self.broadcast(Notification::Notice { relay_url, message }, None);
                }
                PoolNotice::AuthChallenge {
                    relay_url,
                    challenge,
                } => {
                    self.broadcast(
                        Notification::AuthChallenge {
                            relay_url,
                            challenge,
                        },
                        None,
                    );
                }
                PoolNotice::Removed { relay_url, id } => {
                    if let Some(owner) = owner_of(&id)
                        && let Some(state) = self.consumers.get_mut(&owner)
                    {
                        state.keep_alive.remove(&(relay_url, id));
                    }
                }
            }
        }
        if liveness_changed {
            self.broadcast(Notification::Liveness(self.pool.liveness()), None);
        }
    }

    fn broadcast(&self, notification: Notification, except: Option<ConsumerId>) {
        for (id, state) in &self.consumers {
            if Some(*id) == except {
                continue;
            }
            if state.notifications.send(notification.clone()).is_err() {
                debug!("Consumer {} stopped listening for notifications", id);
            }
        }
    }

    #[cfg(test)]
    fn keep_alive_of(&self, consumer: ConsumerId) -> Option<&HashSet<(String, String)>> {
        self.consumers.get(&consumer).map(|state| &state.keep_alive)
    }
}

async fn tick(monitor: &mut Option<Interval>) {
    match monitor {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ConnectionEvent;

    #[tokio::test]
    async fn test_broker_requests_round_trip() {
        let handle = Broker::spawn(PoolConfig::new(vec!["ws://127.0.0.1:1".to_string()])).unwrap();
        let consumer = handle.connect().unwrap();

        let liveness = consumer.query_liveness().await.unwrap();
        assert_eq!(liveness.get("ws://127.0.0.1:1"), Some(&false));

        let stats = consumer.stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].max_sub, 10);

        assert!(matches!(
            consumer.add_relay("https://nope").await,
            Err(ClientError::InvalidUrl(_))
        ));

        handle.shutdown().await.unwrap();
        assert!(matches!(
            consumer.query_liveness().await,
            Err(ClientError::BrokerClosed)
        ));
    }

    #[tokio::test]
    async fn test_removed_notice_prunes_keep_alive_bookkeeping() {
        let mut broker = Broker::new(PoolConfig::new(vec!["ws://127.0.0.1:1".to_string()])).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.handle_inbox(Inbox::Connect {
            consumer: ConsumerId(4),
            notifications: tx,
        });
        broker
            .consumers
            .get_mut(&ConsumerId(4))
            .unwrap()
            .keep_alive
            .insert(("ws://127.0.0.1:1".to_string(), "4:feed".to_string()));

        broker.dispatch(vec![PoolNotice::Removed {
            relay_url: "ws://127.0.0.1:1".to_string(),
            id: "4:feed".to_string(),
        }]);
        assert!(broker.keep_alive_of(ConsumerId(4)).unwrap().is_empty());

        broker.handle_inbox(Inbox::Disconnect(ConsumerId(4)));
        assert!(broker.keep_alive_of(ConsumerId(4)).is_none());
        broker.stop();
    }

    #[tokio::test]
    async fn test_liveness_flip_is_pushed() {
        let mut broker = Broker::new(PoolConfig::new(vec!["ws://127.0.0.1:1".to_string()])).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.handle_inbox(Inbox::Connect {
            consumer: ConsumerId(1),
            notifications: tx,
        });

        let notices = broker.pool.handle_event(PoolEvent::Connection(ConnectionEvent::Opened {
            relay_url: "ws://127.0.0.1:1".to_string(),
        }));
        broker.dispatch(notices);

        match rx.try_recv() {
            Ok(Notification::Liveness(map)) => assert!(map.contains_key("ws://127.0.0.1:1")),
            other => panic!("expected liveness, got {:?}", other),
        }
        broker.stop();
    }
}
