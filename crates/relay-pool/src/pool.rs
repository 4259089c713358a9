//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns every [`RelayConnection`] together with its admission state
//! and the sinks of the streams reading from it. It is single-threaded state:
//! whoever owns it (normally the broker task) feeds it [`PoolEvent`]s from
//! [`RelayPool::take_events`] and calls its methods, and nothing else touches
//! it in between.

use crate::admission::{Admission, PoolAction, SubscriptionPools};
use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Event, Filter, RelayMessage};
use crate::relay::{ConnectionEvent, ConnectionState, RelayConfig, RelayConnection};
use crate::selection::RelaySelection;
use crate::stream::{
    self, Delivery, StreamEnd, StreamOptions, StreamRelease, StreamSink, SubscriptionStream,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the pool reacts to: socket activity and streams letting go.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// From a connection's socket task
    Connection(ConnectionEvent),
    /// From a stream that was unsubscribed, dropped, or timed out
    Release(StreamRelease),
}

/// What the pool's owner should know after handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolNotice {
    /// A relay flipped between connected and not
    Liveness { relay_url: String, connected: bool },
    /// Relay NOTICE frame
    Notice { relay_url: String, message: String },
    /// Relay AUTH challenge (NIP-42)
    AuthChallenge { relay_url: String, challenge: String },
    /// A subscription id left a relay's admission pools
    Removed { relay_url: String, id: String },
}

/// Per-relay answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Subscribe request as seen by the pool.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Relay-level id (already namespaced by the broker, if any)
    pub id: String,
    pub filter: Filter,
    pub keep_alive: bool,
    pub selection: RelaySelection,
    /// Overrides the configured inactivity timeout for these streams
    pub inactivity_timeout: Option<Duration>,
}

/// Streams created by one subscribe request, one per selected relay.
#[derive(Debug)]
pub struct PoolSubscription {
    pub id: String,
    pub streams: Vec<SubscriptionStream>,
    /// Admission outcome per connected relay
    pub admissions: Vec<(String, Admission)>,
}

/// Receiving end of a publish: one result per selected relay.
#[derive(Debug)]
pub struct PublishTicket {
    pub event_id: String,
    pub relays: Vec<String>,
    pub results: mpsc::UnboundedReceiver<PublishResult>,
}

/// Statistics for one relay of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Relay URL
    pub url: String,
    /// Connection state
    pub state: ConnectionState,
    /// Live keep-alive subscriptions
    pub keep_alive: usize,
    /// Live instant subscriptions
    pub instant: usize,
    /// Queued instant subscriptions
    pub pending: usize,
    /// Attached stream sinks
    pub sinks: usize,
    /// Configured `max_sub`
    pub max_sub: usize,
    /// Configured `max_keep_alive`
    pub max_keep_alive: usize,
    /// Reconnects scheduled so far
    pub reconnect_attempts: u32,
}

struct RelaySlot {
    connection: RelayConnection,
    pools: SubscriptionPools,
    sinks: HashMap<String, Vec<StreamSink>>,
    /// Deduplicated keep-alive ids: requested id -> (live id, sinks it owns there)
    aliases: HashMap<String, (String, Vec<u64>)>,
    /// Written only from [`PoolEvent`]s, so it agrees with the pushed notices
    live: bool,
}

impl RelaySlot {
    fn send(&self, url: &str, message: &ClientMessage) {
        if let Err(e) = self.connection.send(message) {
            warn!("Failed to send to {}: {}", url, e);
        }
    }

    fn end_sinks(&mut self, id: &str, reason: &StreamEnd) {
        if let Some(sinks) = self.sinks.remove(id) {
            for sink in sinks {
                sink.end(reason.clone());
            }
        }
    }

    fn apply(&mut self, url: &str, actions: Vec<PoolAction>, notices: &mut Vec<PoolNotice>) {
        for action in actions {
            match action {
                PoolAction::Activate { id, filter } => {
                    debug!("REQ {} on {}", id, url);
                    self.send(
                        url,
                        &ClientMessage::Req {
                            subscription_id: id.clone(),
                            filters: vec![filter],
                        },
                    );
                    if let Some(sinks) = self.sinks.get(&id) {
                        for sink in sinks {
                            sink.activate();
                        }
                    }
                }
                PoolAction::Close { id, reason } => {
                    debug!("CLOSE {} on {} ({:?})", id, url, reason);
                    // The relay already dropped it.
                    if !matches!(reason, StreamEnd::ClosedByRelay(_)) {
                        self.send(
                            url,
                            &ClientMessage::Close {
                                subscription_id: id.clone(),
                            },
                        );
                    }
                    self.end_sinks(&id, &reason);
                    self.forget_aliases_of(url, &id, notices);
                    notices.push(PoolNotice::Removed {
                        relay_url: url.to_string(),
                        id,
                    });
                }
            }
        }
    }

    /// Drop every alias that points at `target`.
    fn forget_aliases_of(&mut self, url: &str, target: &str, notices: &mut Vec<PoolNotice>) {
        self.aliases.retain(|alias, (live_id, _)| {
            if live_id.as_str() != target {
                return true;
            }
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id: alias.clone(),
            });
            false
        });
    }

    /// Forget all aliases; the ids they point at are gone.
    fn clear_aliases(&mut self, url: &str, notices: &mut Vec<PoolNotice>) {
        for (alias, _) in self.aliases.drain() {
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id: alias,
            });
        }
    }

    /// The id a stream's sink is filed under.
    fn live_id_of(&self, id: &str, sink_id: u64) -> String {
        match self.aliases.get(id) {
            Some((live_id, sink_ids)) if sink_ids.contains(&sink_id) => live_id.clone(),
            _ => id.to_string(),
        }
    }

    /// Detach one sink from live id `id`; when it was the last one, release the id.
    fn detach(
        &mut self,
        url: &str,
        id: &str,
        sink_id: u64,
        reason: StreamEnd,
        notices: &mut Vec<PoolNotice>,
    ) {
        let Some(sinks) = self.sinks.get_mut(id) else {
            return;
        };
        let Some(index) = sinks.iter().position(|s| s.id() == sink_id) else {
            return;
        };
        sinks.remove(index).end(reason.clone());
        let left = sinks.len();

        let mut emptied = Vec::new();
        for (alias, (live_id, sink_ids)) in self.aliases.iter_mut() {
            if live_id.as_str() == id && sink_ids.contains(&sink_id) {
                sink_ids.retain(|s| *s != sink_id);
                if sink_ids.is_empty() {
                    emptied.push(alias.clone());
                }
            }
        }
        for alias in emptied {
            self.aliases.remove(&alias);
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id: alias,
            });
        }

        if left > 0 {
            debug!("Detached sink {} from {} on {}, {} left", sink_id, id, url, left);
            return;
        }
        self.sinks.remove(id);
        let actions = self.pools.release(id, reason);
        self.apply(url, actions, notices);
    }

    /// End the streams a caller opened under `id`.
    ///
    /// Streams attached to `id` through deduplication belong to other ids and
    /// are left alone; the relay subscription stays open while any remain.
    fn unsubscribe(&mut self, url: &str, id: &str, reason: StreamEnd, notices: &mut Vec<PoolNotice>) {
        if let Some((live_id, sink_ids)) = self.aliases.remove(id) {
            debug!("Detaching {} from {} on {}", id, live_id, url);
            for sink_id in sink_ids {
                self.detach(url, &live_id, sink_id, reason.clone(), notices);
            }
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id: id.to_string(),
            });
        }

        let borrowed: Vec<u64> = self
            .aliases
            .values()
            .filter(|(live_id, _)| live_id.as_str() == id)
            .flat_map(|(_, sink_ids)| sink_ids.iter().copied())
            .collect();
        if borrowed.is_empty() {
            let actions = self.pools.release(id, reason.clone());
            self.apply(url, actions, notices);
            self.end_sinks(id, &reason);
            return;
        }

        let own: Vec<u64> = self
            .sinks
            .get(id)
            .map(|sinks| {
                sinks
                    .iter()
                    .map(StreamSink::id)
                    .filter(|sink_id| !borrowed.contains(sink_id))
                    .collect()
            })
            .unwrap_or_default();
        for sink_id in own {
            self.detach(url, id, sink_id, reason.clone(), notices);
        }
    }
}

/// A pool of Nostr relay connections.
pub struct RelayPool {
    config: PoolConfig,
    relays: IndexMap<String, RelaySlot>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PoolEvent>>,
    next_sink_id: u64,
    pending_publishes: HashMap<(String, String), Vec<mpsc::UnboundedSender<PublishResult>>>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.relays.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RelayPool {
    /// Create a pool and start connecting to the configured relays.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relays = config.relays.clone();
        let mut pool = Self {
            config,
            relays: IndexMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            next_sink_id: 1,
            pending_publishes: HashMap::new(),
        };
        for url in relays {
            pool.add_relay(&url)?;
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the event receiver. Every event it yields must be passed to
    /// [`RelayPool::handle_event`].
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PoolEvent>> {
        self.events_rx.take()
    }

    /// Get all relay URLs in the pool.
    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.keys().cloned().collect()
    }

    /// Check if a relay is connected.
    pub fn is_connected(&self, url: &str) -> bool {
        self.relays
            .get(url)
            .map(|slot| slot.live)
            .unwrap_or(false)
    }

    /// Connection liveness per relay, in pool order.
    pub fn liveness(&self) -> IndexMap<String, bool> {
        self.relays
            .iter()
            .map(|(url, slot)| (url.clone(), slot.live))
            .collect()
    }

    /// Add a relay to the pool and start connecting. Adding a known relay is a no-op.
    pub fn add_relay(&mut self, url: &str) -> Result<()> {
        if self.relays.contains_key(url) {
            return Ok(());
        }
        let relay_config = RelayConfig {
            connect_timeout: self.config.connect_timeout,
            reconnect_delay: self.config.reconnect_delay,
        };
        let connection = RelayConnection::with_config(url, relay_config)?;
        info!("Adding relay to pool: {}", url);
        connection.start(self.events_tx.clone());
        self.relays.insert(
            url.to_string(),
            RelaySlot {
                connection,
                pools: SubscriptionPools::new(url, self.config.subscription_limits()),
                sinks: HashMap::new(),
                aliases: HashMap::new(),
                live: false,
            },
        );
        Ok(())
    }

    /// Remove a relay, ending every stream on it.
    pub fn remove_relay(&mut self, url: &str) -> Result<Vec<PoolNotice>> {
        let Some(slot) = self.relays.shift_remove(url) else {
            return Err(ClientError::UnknownRelay(url.to_string()));
        };
        info!("Removing relay from pool: {}", url);
        let mut notices = Vec::new();
        self.retire(url, slot, "relay removed", &mut notices);
        Ok(notices)
    }

    /// Close every relay and install `urls` instead.
    pub fn switch_relays(&mut self, urls: &[String]) -> Result<Vec<PoolNotice>> {
        for url in urls {
            RelayConnection::new(url)?;
        }
        info!("Switching relays to {:?}", urls);
        let mut notices = Vec::new();
        for (url, slot) in std::mem::take(&mut self.relays) {
            self.retire(&url, slot, "relays switched", &mut notices);
        }
        for url in urls {
            self.add_relay(url)?;
        }
        Ok(notices)
    }

    fn retire(&mut self, url: &str, mut slot: RelaySlot, reason: &str, notices: &mut Vec<PoolNotice>) {
        slot.connection.shutdown();
        let end = StreamEnd::Transport(reason.to_string());
        for id in slot.pools.reset() {
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id,
            });
        }
        for (_, sinks) in slot.sinks.drain() {
            for sink in sinks {
                sink.end(end.clone());
            }
        }
        slot.clear_aliases(url, notices);
        if slot.live {
            notices.push(PoolNotice::Liveness {
                relay_url: url.to_string(),
                connected: false,
            });
        }
        self.reject_publishes(url, reason);
    }

    fn next_sink_id(&mut self) -> u64 {
        let id = self.next_sink_id;
        self.next_sink_id += 1;
        id
    }

    /// Fan a subscription out to the selected relays.
    ///
    /// Keep-alive requests are checked on every connected target before any
    /// is touched, so a rejected request changes nothing. A keep-alive filter
    /// already live under another id of the same owner is shared: the new
    /// stream reads from the existing id but still reports its own.
    pub fn subscribe(&mut self, request: SubscribeRequest) -> Result<(PoolSubscription, Vec<PoolNotice>)> {
        let targets = request
            .selection
            .resolve(self.relays.iter().map(|(url, slot)| (url.as_str(), slot.live)));

        if request.keep_alive {
            for url in &targets {
                if let Some(slot) = self.relays.get(url)
                    && slot.live
                {
                    slot.pools.check_keep_alive(&request.id, &request.filter)?;
                }
            }
        }

        let default_timeout = if request.keep_alive {
            self.config.keep_alive_inactivity_timeout
        } else {
            Some(self.config.inactivity_timeout)
        };
        let options = StreamOptions {
            capacity: self.config.stream_buffer,
            inactivity_timeout: request.inactivity_timeout.or(default_timeout),
        };

        let mut subscription = PoolSubscription {
            id: request.id.clone(),
            streams: Vec::with_capacity(targets.len()),
            admissions: Vec::new(),
        };
        let mut notices = Vec::new();

        for url in targets {
            let sink_id = self.next_sink_id();
            let release_tx = self.events_tx.clone();
            let Some(slot) = self.relays.get_mut(&url) else {
                continue;
            };
            if !slot.live {
                debug!("Relay {} not connected, skipping {}", url, request.id);
                subscription.streams.push(stream::ended(
                    &url,
                    &request.id,
                    StreamEnd::Transport("not connected".to_string()),
                ));
                continue;
            }

            // A re-used id replaces whatever it was attached to before.
            if let Some((live_id, sink_ids)) = slot.aliases.remove(&request.id) {
                for old in sink_ids {
                    slot.detach(&url, &live_id, old, StreamEnd::Replaced, &mut notices);
                }
            }
            let (admission, actions) =
                slot.pools
                    .admit(&request.id, request.filter.clone(), request.keep_alive)?;
            slot.apply(&url, actions, &mut notices);

            let (sink, stream) = stream::channel(&url, &request.id, sink_id, &options, release_tx);
            if admission != Admission::Queued {
                sink.activate();
            }
            match &admission {
                Admission::Duplicate { existing } if *existing != request.id => {
                    slot.aliases
                        .entry(request.id.clone())
                        .or_insert_with(|| (existing.clone(), Vec::new()))
                        .1
                        .push(sink_id);
                    slot.sinks.entry(existing.clone()).or_default().push(sink);
                }
                _ => slot.sinks.entry(request.id.clone()).or_default().push(sink),
            }
            subscription.streams.push(stream);
            subscription.admissions.push((url, admission));
        }

        Ok((subscription, notices))
    }

    /// Close `id` on every relay that knows it, ending all of its streams.
    pub fn unsubscribe(&mut self, id: &str) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        for (url, slot) in self.relays.iter_mut() {
            slot.unsubscribe(url, id, StreamEnd::Unsubscribed, &mut notices);
        }
        notices
    }

    /// Close `id` on one relay.
    pub fn unsubscribe_on(&mut self, url: &str, id: &str) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        if let Some(slot) = self.relays.get_mut(url) {
            slot.unsubscribe(url, id, StreamEnd::Unsubscribed, &mut notices);
        }
        notices
    }

    /// Send an event to the selected relays.
    ///
    /// Relays that are not connected answer immediately with a rejection.
    /// The ticket's channel closes once every relay has answered.
    pub fn publish(&mut self, event: Event, selection: &RelaySelection) -> PublishTicket {
        self.pending_publishes.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });

        let targets =
            selection.resolve(self.relays.iter().map(|(url, slot)| (url.as_str(), slot.live)));
        let (tx, results) = mpsc::unbounded_channel();
        let message = ClientMessage::Event(event.clone());

        for url in &targets {
            let sent = match self.relays.get(url) {
                Some(slot) => slot.connection.send(&message),
                None => Err(ClientError::UnknownRelay(url.clone())),
            };
            match sent {
                Ok(()) => {
                    debug!("Published {} to {}", event.id, url);
                    self.pending_publishes
                        .entry((url.clone(), event.id.clone()))
                        .or_default()
                        .push(tx.clone());
                }
                Err(e) => {
                    let _ = tx.send(PublishResult {
                        relay_url: url.clone(),
                        event_id: event.id.clone(),
                        accepted: false,
                        message: e.to_string(),
                    });
                }
            }
        }

        PublishTicket {
            event_id: event.id,
            relays: targets,
            results,
        }
    }

    fn reject_publishes(&mut self, url: &str, reason: &str) {
        let keys: Vec<(String, String)> = self
            .pending_publishes
            .keys()
            .filter(|(relay, _)| relay == url)
            .cloned()
            .collect();
        for key in keys {
            if let Some(senders) = self.pending_publishes.remove(&key) {
                for tx in senders {
                    let _ = tx.send(PublishResult {
                        relay_url: key.0.clone(),
                        event_id: key.1.clone(),
                        accepted: false,
                        message: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Apply one event from [`RelayPool::take_events`].
    pub fn handle_event(&mut self, event: PoolEvent) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        match event {
            PoolEvent::Release(release) => {
                if let Some(slot) = self.relays.get_mut(&release.relay_url) {
                    let live_id = slot.live_id_of(&release.subscription_id, release.sink_id);
                    slot.detach(
                        &release.relay_url,
                        &live_id,
                        release.sink_id,
                        release.reason,
                        &mut notices,
                    );
                }
            }
            PoolEvent::Connection(ConnectionEvent::Opened { relay_url }) => {
                if let Some(slot) = self.relays.get_mut(&relay_url)
                    && !slot.live
                {
                    slot.live = true;
                    notices.push(PoolNotice::Liveness {
                        relay_url,
                        connected: true,
                    });
                }
            }
            PoolEvent::Connection(ConnectionEvent::Closed { relay_url, reason }) => {
                self.handle_closed(&relay_url, &reason, &mut notices);
            }
            PoolEvent::Connection(ConnectionEvent::Message { relay_url, message }) => {
                self.handle_message(&relay_url, message, &mut notices);
            }
        }
        notices
    }

    fn handle_closed(&mut self, url: &str, reason: &str, notices: &mut Vec<PoolNotice>) {
        let Some(slot) = self.relays.get_mut(url) else {
            return;
        };
        let end = StreamEnd::Transport(reason.to_string());
        for id in slot.pools.reset() {
            slot.end_sinks(&id, &end);
            notices.push(PoolNotice::Removed {
                relay_url: url.to_string(),
                id,
            });
        }
        for (_, sinks) in slot.sinks.drain() {
            for sink in sinks {
                sink.end(end.clone());
            }
        }
        slot.clear_aliases(url, notices);
        if slot.live {
            info!("Relay {} disconnected: {}", url, reason);
            slot.live = false;
            notices.push(PoolNotice::Liveness {
                relay_url: url.to_string(),
                connected: false,
            });
        }
        self.reject_publishes(url, reason);
    }

    fn handle_message(&mut self, url: &str, message: RelayMessage, notices: &mut Vec<PoolNotice>) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let Some(slot) = self.relays.get_mut(url) else {
                    return;
                };
                let live = slot.pools.is_keep_alive(&subscription_id)
                    || slot.pools.is_instant(&subscription_id);
                let Some(sinks) = slot.sinks.get(&subscription_id).filter(|_| live) else {
                    debug!(
                        "Dropping event {} for unknown subscription {} on {}",
                        event.id, subscription_id, url
                    );
                    return;
                };
                let mut gone = Vec::new();
                for sink in sinks {
                    match sink.deliver(event.clone()) {
                        Delivery::Sent => {}
                        Delivery::Full => warn!(
                            "Stream buffer full for {} on {}, dropping event {}",
                            subscription_id, url, event.id
                        ),
                        Delivery::Closed => gone.push(sink.id()),
                    }
                }
                for sink_id in gone {
                    slot.detach(url, &subscription_id, sink_id, StreamEnd::Unsubscribed, notices);
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let Some(slot) = self.relays.get_mut(url) else {
                    return;
                };
                let actions = slot.pools.complete(&subscription_id);
                if actions.is_empty() {
                    if let Some(sinks) = slot.sinks.get(&subscription_id) {
                        for sink in sinks {
                            sink.eose();
                        }
                    }
                } else {
                    slot.apply(url, actions, notices);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let Some(slot) = self.relays.get_mut(url) else {
                    return;
                };
                warn!("Relay {} closed subscription {}: {}", url, subscription_id, message);
                let end = StreamEnd::ClosedByRelay(message);
                let actions = slot.pools.release(&subscription_id, end.clone());
                slot.apply(url, actions, notices);
                slot.end_sinks(&subscription_id, &end);
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                if let Some(senders) = self
                    .pending_publishes
                    .remove(&(url.to_string(), event_id.clone()))
                {
                    for tx in senders {
                        let _ = tx.send(PublishResult {
                            relay_url: url.to_string(),
                            event_id: event_id.clone(),
                            accepted: success,
                            message: message.clone(),
                        });
                    }
                } else {
                    debug!("OK for unknown event {} from {}", event_id, url);
                }
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", url, message);
                notices.push(PoolNotice::Notice {
                    relay_url: url.to_string(),
                    message,
                });
            }
            RelayMessage::Auth { challenge } => {
                notices.push(PoolNotice::AuthChallenge {
                    relay_url: url.to_string(),
                    challenge,
                });
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                debug!("COUNT {} for {} on {}", count, subscription_id, url);
            }
        }
    }

    /// Get statistics for every relay.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.relays
            .iter()
            .map(|(url, slot)| {
                let limits = slot.pools.limits();
                PoolStats {
                    url: url.clone(),
                    state: slot.connection.state(),
                    keep_alive: slot.pools.keep_alive_len(),
                    instant: slot.pools.instant_len(),
                    pending: slot.pools.pending_len(),
                    sinks: slot.sinks.values().map(Vec::len).sum(),
                    max_sub: limits.max_sub,
                    max_keep_alive: limits.max_keep_alive,
                    reconnect_attempts: slot.connection.reconnect_attempts(),
                }
            })
            .collect()
    }

    /// Log one line per relay at debug level.
    pub fn log_stats(&self) {
        for stats in self.stats() {
            debug!(
                "Relay {} {:?}: {} keep-alive, {} instant, {} pending, {} streams",
                stats.url, stats.state, stats.keep_alive, stats.instant, stats.pending, stats.sinks
            );
        }
    }

    /// Stop every connection and end every stream.
    pub fn shutdown(&mut self) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        for (url, slot) in std::mem::take(&mut self.relays) {
            self.retire(&url, slot, "pool shut down", &mut notices);
        }
        notices
    }
}
