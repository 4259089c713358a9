//! Subscription identifiers and per-subscription bookkeeping.
//!
//! Ids handed to relays by the broker are namespaced as `<consumer>:<id>` so
//! that two consumers can reuse the same local id on one connection.

use crate::message::Filter;
use crate::stream::StreamEnd;
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Separator between the owner prefix and the local id.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Identifier of one consumer attached to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix `id` with its owning consumer.
pub fn namespaced_id(owner: ConsumerId, id: &str) -> String {
    format!("{owner}{NAMESPACE_SEPARATOR}{id}")
}

/// Owner prefix of a relay-level id, or `""` when the id is not namespaced.
pub fn owner_prefix(id: &str) -> &str {
    id.split_once(NAMESPACE_SEPARATOR)
        .map(|(owner, _)| owner)
        .unwrap_or("")
}

/// Owning consumer of a namespaced id.
pub fn owner_of(id: &str) -> Option<ConsumerId> {
    owner_prefix(id).parse().ok().map(ConsumerId)
}

/// The consumer-local part of a relay-level id.
pub fn local_id(id: &str) -> &str {
    id.split_once(NAMESPACE_SEPARATOR)
        .map(|(_, local)| local)
        .unwrap_or(id)
}

/// Tracks how a logical subscription ended on each relay it fanned out to.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    /// Subscription ID (consumer-local)
    pub id: String,
    /// Filter for this subscription
    pub filter: Filter,
    /// Relays that carry this subscription
    pub relays: HashSet<String>,
    /// Relays that sent EOSE
    pub eose_relays: HashSet<String>,
    /// Relays whose stream hit the inactivity timeout
    pub idle_relays: HashSet<String>,
    /// Relays whose stream ended with an error
    pub errored_relays: HashMap<String, String>,
    /// Relays whose stream ended for any other reason
    pub closed_relays: HashSet<String>,
    ended: HashSet<String>,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(id: impl Into<String>, filter: Filter) -> Self {
        Self {
            id: id.into(),
            filter,
            ..Default::default()
        }
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
    }

    /// Mark EOSE received from a relay without ending its stream.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) {
        self.eose_relays.insert(relay_url.into());
    }

    /// Record why the stream on `relay_url` ended.
    pub fn record_end(&mut self, relay_url: &str, end: &StreamEnd) {
        let url = relay_url.to_string();
        self.ended.insert(url.clone());
        match end {
            StreamEnd::Eose => {
                self.eose_relays.insert(url);
            }
            StreamEnd::IdleTimeout => {
                self.idle_relays.insert(url);
            }
            StreamEnd::Transport(reason) | StreamEnd::ClosedByRelay(reason) => {
                self.errored_relays.insert(url, reason.clone());
            }
            StreamEnd::Unsubscribed | StreamEnd::Replaced | StreamEnd::Evicted => {
                self.closed_relays.insert(url);
            }
        }
    }

    /// Whether `relay_url` has ended.
    pub fn has_ended(&self, relay_url: &str) -> bool {
        self.ended.contains(relay_url)
    }

    /// Whether every relay has ended.
    pub fn all_ended(&self) -> bool {
        self.relays.iter().all(|r| self.ended.contains(r))
    }

    /// Whether EOSE has been received from all relays.
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.iter().all(|r| self.eose_relays.contains(r))
    }

    /// Get the number of relays with this subscription.
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();

        assert_eq!(id1.len(), 8);
        assert_ne!(id1, id2);
        assert!(!id1.contains(NAMESPACE_SEPARATOR));
    }

    #[test]
    fn test_namespacing_roundtrip() {
        let id = namespaced_id(ConsumerId(7), "feed");
        assert_eq!(id, "7:feed");
        assert_eq!(owner_of(&id), Some(ConsumerId(7)));
        assert_eq!(owner_prefix(&id), "7");
        assert_eq!(local_id(&id), "feed");
    }

    #[test]
    fn test_local_id_keeps_separators_after_owner() {
        let id = namespaced_id(ConsumerId(3), "thread:abc");
        assert_eq!(local_id(&id), "thread:abc");
        assert_eq!(owner_of(&id), Some(ConsumerId(3)));
    }

    #[test]
    fn test_plain_ids_have_no_owner() {
        assert_eq!(owner_prefix("plain"), "");
        assert_eq!(owner_of("plain"), None);
        assert_eq!(local_id("plain"), "plain");
    }

    #[test]
    fn test_tracker_summary() {
        let mut tracker = SubscriptionTracker::new("sub", Filter::new().kinds(vec![1]));
        tracker.add_relay("ws://a");
        tracker.add_relay("ws://b");
        tracker.add_relay("ws://c");

        tracker.mark_eose("ws://a");
        assert!(!tracker.has_ended("ws://a"));
        tracker.record_end("ws://a", &StreamEnd::Eose);
        assert!(tracker.has_ended("ws://a"));
        assert!(!tracker.all_eose());
        assert!(!tracker.all_ended());
        tracker.record_end("ws://b", &StreamEnd::IdleTimeout);
        tracker.record_end("ws://c", &StreamEnd::Transport("not connected".to_string()));

        assert!(tracker.all_ended());
        assert_eq!(tracker.relay_count(), 3);
        assert!(tracker.eose_relays.contains("ws://a"));
        assert!(tracker.idle_relays.contains("ws://b"));
        assert!(tracker.has_ended("ws://c"));
        assert_eq!(
            tracker.errored_relays.get("ws://c").map(String::as_str),
            Some("not connected")
        );
    }
}
