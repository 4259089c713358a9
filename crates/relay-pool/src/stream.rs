//! Per-relay subscription streams.
//!
//! A [`SubscriptionStream`] is the consumer end of one subscription id on one
//! connection. The pool keeps the producing [`StreamSink`]; events flow through
//! a bounded channel, while the terminal reason travels through shared state so
//! it is never lost to a full buffer.

use crate::message::Event;
use crate::pool::PoolEvent;
use crate::subscription::local_id;
use futures::Stream;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep, sleep};
use tracing::{debug, trace};

/// Why a stream completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Relay sent EOSE for an instant subscription
    Eose,
    /// No event arrived within the inactivity timeout
    IdleTimeout,
    /// Closed by the consumer
    Unsubscribed,
    /// The id was re-used for a new filter
    Replaced,
    /// Oldest instant subscription pushed out by a newer one
    Evicted,
    /// Relay sent CLOSED
    ClosedByRelay(String),
    /// Connection failed or dropped
    Transport(String),
}

impl StreamEnd {
    /// Whether this end counts as an error rather than a normal completion.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEnd::ClosedByRelay(_) | StreamEnd::Transport(_))
    }
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// Waiting in the pending queue
    Pending,
    /// REQ sent, events flowing
    Open,
    /// Completed normally
    Done(StreamEnd),
    /// Completed because of a transport or relay error
    Errored(StreamEnd),
}

impl StreamStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, StreamStatus::Done(_) | StreamStatus::Errored(_))
    }
}

/// An event together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    /// Relay that delivered the event
    pub relay_url: String,
    /// Subscription id as the consumer chose it
    pub subscription_id: String,
    pub event: Event,
}

/// Sink-detach request sent from a stream to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRelease {
    pub relay_url: String,
    pub subscription_id: String,
    pub sink_id: u64,
    pub reason: StreamEnd,
}

#[derive(Debug)]
pub(crate) enum StreamMessage {
    Activated,
    Event(Event),
    Eose,
}

#[derive(Debug, Default)]
struct Shared {
    end: Mutex<Option<StreamEnd>>,
    closed: AtomicBool,
}

/// Result of handing an event to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Full,
    Closed,
}

/// Producer side of a stream, held by the pool.
#[derive(Debug)]
pub(crate) struct StreamSink {
    id: u64,
    tx: mpsc::Sender<StreamMessage>,
    shared: Arc<Shared>,
}

impl StreamSink {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Whether the consumer already gave up on this stream.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub(crate) fn activate(&self) {
        let _ = self.tx.try_send(StreamMessage::Activated);
    }

    pub(crate) fn deliver(&self, event: Event) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        match self.tx.try_send(StreamMessage::Event(event)) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub(crate) fn eose(&self) {
        let _ = self.tx.try_send(StreamMessage::Eose);
    }

    /// Complete the stream. Buffered events are still delivered first.
    pub(crate) fn end(self, reason: StreamEnd) {
        let mut end = self.shared.end.lock();
        if end.is_none() {
            *end = Some(reason);
        }
    }
}

/// Parameters shared by every stream a pool creates.
#[derive(Debug, Clone)]
pub(crate) struct StreamOptions {
    pub capacity: usize,
    pub inactivity_timeout: Option<Duration>,
}

pub(crate) fn channel(
    relay_url: &str,
    subscription_id: &str,
    sink_id: u64,
    options: &StreamOptions,
    release_tx: mpsc::UnboundedSender<PoolEvent>,
) -> (StreamSink, SubscriptionStream) {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let shared = Arc::new(Shared::default());
    let sink = StreamSink {
        id: sink_id,
        tx,
        shared: Arc::clone(&shared),
    };
    let stream = SubscriptionStream {
        relay_url: relay_url.to_string(),
        subscription_id: subscription_id.to_string(),
        sink_id,
        rx,
        shared,
        status: StreamStatus::Pending,
        inactivity_timeout: options.inactivity_timeout,
        timer: None,
        eose: false,
        release_tx: Some(release_tx),
    };
    (sink, stream)
}

/// A stream that is already over, e.g. for a relay that is not connected.
pub(crate) fn ended(relay_url: &str, subscription_id: &str, reason: StreamEnd) -> SubscriptionStream {
    let (_, rx) = mpsc::channel(1);
    let shared = Arc::new(Shared::default());
    *shared.end.lock() = Some(reason);
    SubscriptionStream {
        relay_url: relay_url.to_string(),
        subscription_id: subscription_id.to_string(),
        sink_id: 0,
        rx,
        shared,
        status: StreamStatus::Pending,
        inactivity_timeout: None,
        timer: None,
        eose: false,
        release_tx: None,
    }
}

/// Events of one subscription id on one relay.
///
/// Yields events in the relay's send order and then `None` exactly once the
/// subscription completes; [`SubscriptionStream::status`] tells why. Dropping
/// the stream unsubscribes it.
#[derive(Debug)]
pub struct SubscriptionStream {
    relay_url: String,
    subscription_id: String,
    sink_id: u64,
    rx: mpsc::Receiver<StreamMessage>,
    shared: Arc<Shared>,
    status: StreamStatus,
    inactivity_timeout: Option<Duration>,
    timer: Option<Pin<Box<Sleep>>>,
    eose: bool,
    release_tx: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl SubscriptionStream {
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Subscription id as the consumer chose it.
    pub fn subscription_id(&self) -> &str {
        local_id(&self.subscription_id)
    }

    /// Subscription id as sent to the relay.
    pub fn relay_subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn status(&self) -> &StreamStatus {
        &self.status
    }

    /// Why the stream ended, once it has.
    pub fn end_reason(&self) -> Option<&StreamEnd> {
        match &self.status {
            StreamStatus::Done(end) | StreamStatus::Errored(end) => Some(end),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Whether the relay has signalled end of stored events.
    pub fn reached_eose(&self) -> bool {
        self.eose
    }

    /// Receive the next event, or `None` once the stream has completed.
    pub async fn recv(&mut self) -> Option<ReceivedEvent> {
        futures::StreamExt::next(self).await
    }

    /// Stop receiving. Idempotent; a no-op on a completed stream.
    pub fn unsubscribe(&mut self) {
        if self.status.is_finished() {
            return;
        }
        self.finish(StreamEnd::Unsubscribed);
        self.send_release(StreamEnd::Unsubscribed);
    }

    fn arm_timer(&mut self) {
        let Some(timeout) = self.inactivity_timeout else {
            return;
        };
        match self.timer.as_mut() {
            Some(timer) => timer.as_mut().reset(Instant::now() + timeout),
            None => self.timer = Some(Box::pin(sleep(timeout))),
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        debug!(
            "Subscription {} on {} ended: {:?}",
            self.subscription_id, self.relay_url, end
        );
        self.shared.closed.store(true, Ordering::Release);
        self.rx.close();
        self.timer = None;
        self.status = if end.is_error() {
            StreamStatus::Errored(end)
        } else {
            StreamStatus::Done(end)
        };
    }

    fn send_release(&mut self, reason: StreamEnd) {
        // The pool ended this sink itself; there is nothing to detach.
        if self.shared.end.lock().is_some() {
            self.release_tx = None;
        }
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(PoolEvent::Release(StreamRelease {
                relay_url: self.relay_url.clone(),
                subscription_id: self.subscription_id.clone(),
                sink_id: self.sink_id,
                reason,
            }));
        }
    }
}

impl Stream for SubscriptionStream {
    type Item = ReceivedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.status.is_finished() {
            return Poll::Ready(None);
        }

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(StreamMessage::Activated)) => {
                    trace!("Subscription {} active on {}", this.subscription_id, this.relay_url);
                    this.status = StreamStatus::Open;
                    this.arm_timer();
                }
                Poll::Ready(Some(StreamMessage::Event(event))) => {
                    if this.status == StreamStatus::Pending {
                        this.status = StreamStatus::Open;
                    }
                    this.arm_timer();
                    return Poll::Ready(Some(ReceivedEvent {
                        relay_url: this.relay_url.clone(),
                        subscription_id: local_id(&this.subscription_id).to_string(),
                        event,
                    }));
                }
                Poll::Ready(Some(StreamMessage::Eose)) => {
                    this.eose = true;
                }
                Poll::Ready(None) => {
                    let end = this
                        .shared
                        .end
                        .lock()
                        .clone()
                        .unwrap_or_else(|| StreamEnd::Transport("connection pool closed".to_string()));
                    if end == StreamEnd::Eose {
                        this.eose = true;
                    }
                    this.release_tx = None;
                    this.finish(end);
                    return Poll::Ready(None);
                }
                Poll::Pending => break,
            }
        }

        if let Some(timer) = this.timer.as_mut()
            && timer.as_mut().poll(cx).is_ready()
        {
            this.finish(StreamEnd::IdleTimeout);
            this.send_release(StreamEnd::IdleTimeout);
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if !self.status.is_finished() {
            self.shared.closed.store(true, Ordering::Release);
            self.send_release(StreamEnd::Unsubscribed);
        }
    }
}
