//! Consumer-facing handles.
//!
//! A [`ConsumerHandle`] is one client of the broker. Subscribing returns a
//! [`SubscriptionHandle`] that merges the per-relay streams of one logical
//! subscription; publishing returns a [`PublishHandle`] that collects the
//! relays' OK answers.

use crate::broker::{Inbox, Notification, Request};
use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::message::{Event, Filter};
use crate::pool::{PoolStats, PublishResult};
use crate::selection::{CallRelay, RelaySelection};
use crate::stream::{ReceivedEvent, SubscriptionStream};
use crate::subscription::{ConsumerId, SubscriptionTracker, local_id};
use futures::Stream;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// How a subscription is admitted and delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Long-lived feed (true) or one-shot query ending on EOSE (false)
    pub keep_alive: bool,
    /// Caller-chosen id; generated when absent
    pub id: Option<String>,
    /// Relays to fan out to
    pub selection: RelaySelection,
    /// Overrides the configured inactivity timeout
    pub inactivity_timeout: Option<Duration>,
    /// Drop events already seen from another relay
    pub dedup: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            id: None,
            selection: RelaySelection::default(),
            inactivity_timeout: None,
            dedup: true,
        }
    }
}

impl SubscribeOptions {
    /// One-shot query.
    pub fn instant() -> Self {
        Self::default()
    }

    /// Long-lived feed.
    pub fn keep_alive() -> Self {
        Self {
            keep_alive: true,
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn selection(mut self, selection: RelaySelection) -> Self {
        self.selection = selection;
        self
    }

    /// Take the selection from its wire form, e.g. a worker message.
    ///
    /// Fails with [`ClientError::InvalidSelection`] when the url list does not
    /// fit the kind.
    pub fn call_relay(mut self, call: CallRelay) -> Result<Self> {
        self.selection = RelaySelection::try_from(call)?;
        Ok(self)
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }
}

/// One consumer attached to the broker.
///
/// Dropping the handle disconnects it, which closes every keep-alive
/// subscription it opened.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    inbox: mpsc::UnboundedSender<Inbox>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    config: Arc<PoolConfig>,
    disconnected: bool,
}

impl ConsumerHandle {
    pub(crate) fn new(
        id: ConsumerId,
        inbox: mpsc::UnboundedSender<Inbox>,
        notifications: mpsc::UnboundedReceiver<Notification>,
        config: Arc<PoolConfig>,
    ) -> Self {
        Self {
            id,
            inbox,
            notifications: Some(notifications),
            config,
            disconnected: false,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Inbox::Request {
                consumer: self.id,
                request: request(tx),
            })
            .map_err(|_| ClientError::BrokerClosed)?;
        rx.await.map_err(|_| ClientError::BrokerClosed)
    }

    /// Subscribe to `filter` on the relays named by `options.selection`.
    pub async fn subscribe(&self, filter: Filter, options: SubscribeOptions) -> Result<SubscriptionHandle> {
        let dedup = options.dedup;
        let local = options.id.clone();
        let subscription = self
            .call(|reply| Request::Subscribe {
                filter: filter.clone(),
                options,
                reply,
            })
            .await??;

        let id = local.unwrap_or_else(|| local_id(&subscription.id).to_string());
        Ok(SubscriptionHandle::new(id, filter, subscription.streams, dedup))
    }

    /// Close subscription `id` on every relay, ending all of its streams.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.call(|reply| Request::Unsubscribe {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Publish an event to the selected relays.
    pub async fn publish(&self, event: Event, selection: RelaySelection) -> Result<PublishHandle> {
        let ticket = self
            .call(|reply| Request::Publish {
                event,
                selection,
                reply,
            })
            .await?;
        Ok(PublishHandle {
            event_id: ticket.event_id,
            relays: ticket.relays,
            results: ticket.results,
            deadline: Instant::now() + self.config.publish_timeout,
        })
    }

    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.call(|reply| Request::AddRelay {
            url: url.to_string(),
            reply,
        })
        .await?
    }

    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        self.call(|reply| Request::RemoveRelay {
            url: url.to_string(),
            reply,
        })
        .await?
    }

    /// Replace the relay set. Other consumers are notified.
    pub async fn switch_relays(&self, urls: Vec<String>) -> Result<()> {
        self.call(|reply| Request::SwitchRelays { urls, reply }).await?
    }

    /// Connected flag per relay.
    pub async fn query_liveness(&self) -> Result<IndexMap<String, bool>> {
        self.call(|reply| Request::QueryLiveness { reply }).await
    }

    pub async fn stats(&self) -> Result<Vec<PoolStats>> {
        self.call(|reply| Request::Stats { reply }).await
    }

    /// Take the notification receiver. Returns `None` after the first call
    /// or after [`ConsumerHandle::on_liveness_change`].
    pub fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// Wait for the next notification.
    pub async fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.as_mut()?.recv().await
    }

    /// Call `callback` with the liveness map every time it changes.
    pub fn on_liveness_change<F>(&mut self, mut callback: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(IndexMap<String, bool>) + Send + 'static,
    {
        let mut notifications = self.notifications.take()?;
        Some(tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                if let Notification::Liveness(map) = notification {
                    callback(map);
                }
            }
        }))
    }

    /// Detach from the broker, closing this consumer's keep-alive subscriptions.
    pub fn disconnect(mut self) {
        self.send_disconnect();
    }

    fn send_disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            let _ = self.inbox.send(Inbox::Disconnect(self.id));
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.send_disconnect();
    }
}

/// One logical subscription: the merged streams of every selected relay.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: String,
    streams: Vec<SubscriptionStream>,
    tracker: SubscriptionTracker,
    seen: Option<HashSet<String>>,
    cursor: usize,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, filter: Filter, streams: Vec<SubscriptionStream>, dedup: bool) -> Self {
        let mut tracker = SubscriptionTracker::new(id.clone(), filter);
        for stream in &streams {
            tracker.add_relay(stream.relay_url());
        }
        Self {
            id,
            streams,
            tracker,
            seen: dedup.then(HashSet::new),
            cursor: 0,
        }
    }

    /// Subscription id as the consumer knows it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-relay streams.
    pub fn streams(&self) -> &[SubscriptionStream] {
        &self.streams
    }

    /// Which relays ended and how.
    pub fn summary(&self) -> &SubscriptionTracker {
        &self.tracker
    }

    /// Whether every relay's stream has completed.
    pub fn is_finished(&self) -> bool {
        self.streams.iter().all(SubscriptionStream::is_finished)
    }

    /// Next event from any relay, or `None` once every stream has completed.
    pub async fn next(&mut self) -> Option<ReceivedEvent> {
        futures::StreamExt::next(self).await
    }

    /// Unsubscribe every stream of this subscription. Idempotent.
    pub fn unsubscribe(&mut self) {
        for stream in &mut self.streams {
            stream.unsubscribe();
            if let Some(end) = stream.end_reason().cloned() {
                self.tracker.record_end(stream.relay_url(), &end);
            }
        }
    }

    /// Drive the subscription on a task, calling `callback` for each event.
    /// The task yields the summary once every stream has completed.
    pub fn on_event<F>(mut self, mut callback: F) -> JoinHandle<SubscriptionTracker>
    where
        F: FnMut(ReceivedEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.next().await {
                callback(event);
            }
            self.tracker.clone()
        })
    }

    /// Drain the subscription and return its events deduplicated and newest first.
    pub async fn collect_events(mut self, limit: Option<usize>) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        while let Some(received) = self.next().await {
            if seen.insert(received.event.id.clone()) {
                events.push(received.event);
            }
        }
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }
}

impl Stream for SubscriptionHandle {
    type Item = ReceivedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let count = this.streams.len();
        let mut open = 0;

        // Start where the last event came from so one chatty relay cannot starve the rest.
        for offset in 0..count {
            let index = (this.cursor + offset) % count;
            let stream = &mut this.streams[index];
            if stream.is_finished() {
                continue;
            }
            loop {
                match Pin::new(&mut *stream).poll_next(cx) {
                    Poll::Ready(Some(received)) => {
                        if stream.reached_eose() {
                            this.tracker.mark_eose(stream.relay_url());
                        }
                        if let Some(seen) = this.seen.as_mut()
                            && !seen.insert(received.event.id.clone())
                        {
                            debug!("Skipping duplicate event {} from {}", received.event.id, received.relay_url);
                            continue;
                        }
                        this.cursor = (index + 1) % count;
                        return Poll::Ready(Some(received));
                    }
                    Poll::Ready(None) => {
                        if let Some(end) = stream.end_reason().cloned() {
                            this.tracker.record_end(stream.relay_url(), &end);
                        }
                        break;
                    }
                    Poll::Pending => {
                        if stream.reached_eose() {
                            this.tracker.mark_eose(stream.relay_url());
                        }
                        open += 1;
                        break;
                    }
                }
            }
        }

        if open == 0 {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

/// Answers to one published event.
#[derive(Debug)]
pub struct PublishHandle {
    event_id: String,
    relays: Vec<String>,
    results: mpsc::UnboundedReceiver<PublishResult>,
    deadline: Instant,
}

impl PublishHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Relays the event was sent to (or rejected for).
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Next relay answer; `None` once all relays answered or the publish timeout passed.
    pub async fn next(&mut self) -> Option<PublishResult> {
        timeout_at(self.deadline, self.results.recv()).await.ok().flatten()
    }

    /// Wait for every answer that arrives before the publish timeout.
    pub async fn collect(mut self) -> Vec<PublishResult> {
        let mut results = Vec::with_capacity(self.relays.len());
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}
