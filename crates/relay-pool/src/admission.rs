//! Per-connection subscription admission.
//!
//! Each relay connection carries a budget of `max_sub` live subscriptions,
//! split into a keep-alive share (`max_keep_alive`) for long-lived feeds and an
//! instant share for one-shot queries that end on EOSE. [`SubscriptionPools`] is
//! pure state: it decides, and returns the frames to send as [`PoolAction`]s,
//! leaving I/O to the caller.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::stream::StreamEnd;
use crate::subscription::owner_prefix;
use indexmap::IndexMap;
use std::collections::VecDeque;
use tracing::debug;

/// What to do with an instant request when the instant pool is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstantOverflow {
    /// Close the oldest instant subscription and take its slot
    #[default]
    Evict,
    /// Wait in FIFO order until a slot frees up
    Queue,
}

/// Per-connection budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionLimits {
    pub max_sub: usize,
    pub max_keep_alive: usize,
    pub overflow: InstantOverflow,
}

impl SubscriptionLimits {
    /// Slots left for instant subscriptions.
    pub fn max_instant(&self) -> usize {
        self.max_sub.saturating_sub(self.max_keep_alive)
    }
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            max_sub: 10,
            max_keep_alive: 2,
            overflow: InstantOverflow::Evict,
        }
    }
}

/// Outcome of a subscribe request on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The id is live on the relay (a REQ was issued)
    Activated,
    /// An equal keep-alive filter already exists; nothing was sent
    Duplicate { existing: String },
    /// Parked in the pending queue; nothing was sent
    Queued,
}

/// Frame-level effect of an admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAction {
    /// Send REQ for `id`
    Activate { id: String, filter: Filter },
    /// Send CLOSE for `id`; its streams end with `reason`
    Close { id: String, reason: StreamEnd },
}

/// Admission state of one connection.
#[derive(Debug)]
pub struct SubscriptionPools {
    relay_url: String,
    limits: SubscriptionLimits,
    keep_alive: IndexMap<String, Filter>,
    instant: IndexMap<String, Filter>,
    pending: VecDeque<(String, Filter)>,
}

impl SubscriptionPools {
    pub fn new(relay_url: impl Into<String>, limits: SubscriptionLimits) -> Self {
        Self {
            relay_url: relay_url.into(),
            limits,
            keep_alive: IndexMap::new(),
            instant: IndexMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn limits(&self) -> SubscriptionLimits {
        self.limits
    }

    pub fn keep_alive_len(&self) -> usize {
        self.keep_alive.len()
    }

    pub fn instant_len(&self) -> usize {
        self.instant.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Live subscriptions (keep-alive plus instant).
    pub fn active_len(&self) -> usize {
        self.keep_alive.len() + self.instant.len()
    }

    pub fn is_keep_alive(&self, id: &str) -> bool {
        self.keep_alive.contains_key(id)
    }

    pub fn is_instant(&self, id: &str) -> bool {
        self.instant.contains_key(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|(p, _)| p == id)
    }

    /// Whether `id` is known to this connection in any state.
    pub fn contains(&self, id: &str) -> bool {
        self.is_keep_alive(id) || self.is_instant(id) || self.is_pending(id)
    }

    /// Live ids in activation order, keep-alive first.
    pub fn active_ids(&self) -> Vec<String> {
        self.keep_alive
            .keys()
            .chain(self.instant.keys())
            .cloned()
            .collect()
    }

    /// Keep-alive id with a filter equal to `filter` and the same owner as `id`.
    fn find_duplicate(&self, id: &str, filter: &Filter) -> Option<&str> {
        let owner = owner_prefix(id);
        self.keep_alive
            .iter()
            .find(|(existing, f)| owner_prefix(existing) == owner && *f == filter)
            .map(|(existing, _)| existing.as_str())
    }

    /// Dry run of the keep-alive rules: would `admit(id, filter, true)` succeed?
    pub fn check_keep_alive(&self, id: &str, filter: &Filter) -> Result<()> {
        if self.find_duplicate(id, filter).is_some()
            || self.keep_alive.contains_key(id)
            || self.keep_alive.len() < self.limits.max_keep_alive
        {
            Ok(())
        } else {
            Err(ClientError::KeepAlivePoolFull {
                relay: self.relay_url.clone(),
            })
        }
    }

    /// Apply the admission rules to a subscribe request.
    pub fn admit(
        &mut self,
        id: &str,
        filter: Filter,
        keep_alive: bool,
    ) -> Result<(Admission, Vec<PoolAction>)> {
        if keep_alive {
            self.admit_keep_alive(id, filter)
        } else {
            Ok(self.admit_instant(id, filter))
        }
    }

    fn admit_keep_alive(
        &mut self,
        id: &str,
        filter: Filter,
    ) -> Result<(Admission, Vec<PoolAction>)> {
        if let Some(existing) = self.find_duplicate(id, &filter) {
            debug!(
                "Keep-alive filter for {} already live on {} as {}",
                id, self.relay_url, existing
            );
            return Ok((
                Admission::Duplicate {
                    existing: existing.to_string(),
                },
                Vec::new(),
            ));
        }

        let mut actions = Vec::new();
        if let Some(old) = self.keep_alive.get_mut(id) {
            *old = filter.clone();
            actions.push(PoolAction::Close {
                id: id.to_string(),
                reason: StreamEnd::Replaced,
            });
            actions.push(PoolAction::Activate {
                id: id.to_string(),
                filter,
            });
            return Ok((Admission::Activated, actions));
        }

        if self.keep_alive.len() >= self.limits.max_keep_alive {
            return Err(ClientError::KeepAlivePoolFull {
                relay: self.relay_url.clone(),
            });
        }

        // The id moves from the instant side, if it was there.
        actions.extend(self.take_instant(id, StreamEnd::Replaced));
        self.keep_alive.insert(id.to_string(), filter.clone());
        actions.push(PoolAction::Activate {
            id: id.to_string(),
            filter,
        });
        actions.extend(self.promote());
        Ok((Admission::Activated, actions))
    }

    fn admit_instant(&mut self, id: &str, filter: Filter) -> (Admission, Vec<PoolAction>) {
        let mut actions = Vec::new();

        if let Some(index) = self.instant.get_index_of(id) {
            self.instant.shift_remove_index(index);
            actions.push(PoolAction::Close {
                id: id.to_string(),
                reason: StreamEnd::Replaced,
            });
        } else if self.keep_alive.shift_remove(id).is_some() {
            actions.push(PoolAction::Close {
                id: id.to_string(),
                reason: StreamEnd::Replaced,
            });
        }
        self.pending.retain(|(p, _)| p != id);

        if self.instant.len() >= self.limits.max_instant() {
            match self.limits.overflow {
                InstantOverflow::Queue => {
                    debug!(
                        "Instant pool full on {}, queueing {} ({} pending)",
                        self.relay_url,
                        id,
                        self.pending.len() + 1
                    );
                    self.pending.push_back((id.to_string(), filter));
                    return (Admission::Queued, actions);
                }
                InstantOverflow::Evict => {
                    if let Some((oldest, _)) = self.instant.shift_remove_index(0) {
                        debug!("Instant pool full on {}, evicting {}", self.relay_url, oldest);
                        actions.push(PoolAction::Close {
                            id: oldest,
                            reason: StreamEnd::Evicted,
                        });
                    }
                }
            }
        }

        self.instant.insert(id.to_string(), filter.clone());
        actions.push(PoolAction::Activate {
            id: id.to_string(),
            filter,
        });
        (Admission::Activated, actions)
    }

    fn take_instant(&mut self, id: &str, reason: StreamEnd) -> Option<PoolAction> {
        self.pending.retain(|(p, _)| p != id);
        self.instant.shift_remove(id).map(|_| PoolAction::Close {
            id: id.to_string(),
            reason,
        })
    }

    /// Remove `id` wherever it lives, freeing its slot.
    ///
    /// A pending id is dropped without any frame. Unknown ids are a no-op.
    pub fn release(&mut self, id: &str, reason: StreamEnd) -> Vec<PoolAction> {
        if self.keep_alive.shift_remove(id).is_some() {
            let mut actions = vec![PoolAction::Close {
                id: id.to_string(),
                reason,
            }];
            actions.extend(self.promote());
            return actions;
        }
        if let Some(close) = self.take_instant(id, reason) {
            let mut actions = vec![close];
            actions.extend(self.promote());
            return actions;
        }
        self.pending.retain(|(p, _)| p != id);
        Vec::new()
    }

    /// EOSE arrived for `id`. Instant subscriptions are done; keep-alive ones stay.
    pub fn complete(&mut self, id: &str) -> Vec<PoolAction> {
        if self.instant.contains_key(id) {
            self.release(id, StreamEnd::Eose)
        } else {
            Vec::new()
        }
    }

    /// Activate queued requests while instant slots are free.
    fn promote(&mut self) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        while self.instant.len() < self.limits.max_instant() {
            let Some((id, filter)) = self.pending.pop_front() else {
                break;
            };
            debug!("Promoting queued subscription {} on {}", id, self.relay_url);
            self.instant.insert(id.clone(), filter.clone());
            actions.push(PoolAction::Activate { id, filter });
        }
        actions
    }

    /// Forget everything; used when the transport closes. Returns every id that was known.
    pub fn reset(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.keep_alive.drain(..).map(|(id, _)| id).collect();
        ids.extend(self.instant.drain(..).map(|(id, _)| id));
        ids.extend(self.pending.drain(..).map(|(id, _)| id));
        ids
    }
}
