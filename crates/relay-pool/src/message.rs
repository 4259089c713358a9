//! NIP-01 frames exchanged with relays.
//!
//! Client to relay: EVENT, REQ, CLOSE. Relay to client: EVENT, OK, EOSE,
//! CLOSED, NOTICE, AUTH, COUNT. Events travel as opaque payloads; nothing in
//! this crate signs or verifies them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed frame: {0}")]
    InvalidFormat(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    /// Unix seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Frames the pool sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let frame = match self {
            Self::Event(event) => json!(["EVENT", serde_json::to_value(event)?]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            Self::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(frame.to_string())
    }
}

/// Frames a relay sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },
    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice { message: String },
    /// `["AUTH", <challenge>]` (NIP-42)
    Auth { challenge: String },
    /// `["COUNT", <subscription_id>, {"count": <n>}]` (NIP-45)
    Count { subscription_id: String, count: u64 },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let Value::Array(fields) = serde_json::from_str(json)? else {
            return Err(MessageError::InvalidFormat("frame is not an array".to_string()));
        };
        let mut frame = Frame(fields);

        let kind = frame.string(0, "type")?;
        let message = match kind.as_str() {
            "EVENT" => Self::Event {
                subscription_id: frame.string(1, "subscription_id")?,
                event: frame.decode(2, "event")?,
            },
            "OK" => Self::Ok {
                event_id: frame.string(1, "event_id")?,
                success: frame.boolean(2, "accepted")?,
                message: frame.string_or_empty(3),
            },
            "EOSE" => Self::Eose {
                subscription_id: frame.string(1, "subscription_id")?,
            },
            "CLOSED" => Self::Closed {
                subscription_id: frame.string(1, "subscription_id")?,
                message: frame.string_or_empty(2),
            },
            "NOTICE" => Self::Notice {
                message: frame.string(1, "message")?,
            },
            "AUTH" => Self::Auth {
                challenge: frame.string(1, "challenge")?,
            },
            "COUNT" => Self::Count {
                subscription_id: frame.string(1, "subscription_id")?,
                count: frame.count(2)?,
            },
            _ => return Err(MessageError::UnknownType(kind)),
        };
        Ok(message)
    }
}

/// Positional access to the elements of one frame.
struct Frame(Vec<Value>);

impl Frame {
    fn string(&self, index: usize, name: &'static str) -> Result<String, MessageError> {
        match self.0.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(MessageError::InvalidFormat(format!("{name} is not a string"))),
            None => Err(MessageError::MissingField(name)),
        }
    }

    /// Optional trailing message; relays often omit it.
    fn string_or_empty(&self, index: usize) -> String {
        self.0
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn boolean(&self, index: usize, name: &'static str) -> Result<bool, MessageError> {
        match self.0.get(index) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(MessageError::InvalidFormat(format!("{name} is not a boolean"))),
            None => Err(MessageError::MissingField(name)),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &mut self,
        index: usize,
        name: &'static str,
    ) -> Result<T, MessageError> {
        let value = self
            .0
            .get_mut(index)
            .map(Value::take)
            .ok_or(MessageError::MissingField(name))?;
        Ok(serde_json::from_value(value)?)
    }

    fn count(&self, index: usize) -> Result<u64, MessageError> {
        self.0
            .get(index)
            .and_then(|v| v.get("count"))
            .and_then(Value::as_u64)
            .ok_or(MessageError::MissingField("count"))
    }
}

/// Subscription filter.
///
/// Equality is structural: two filters with the same fields are the same
/// filter, whatever order they were built in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed as on the wire (`#e`, `#p`, ...)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

fn strings(values: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    values.into_iter().map(Into::into).collect()
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(strings(ids));
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(strings(authors));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Match events carrying tag `letter` with one of `values`.
    pub fn tag(mut self, letter: char, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.insert(format!("#{letter}"), strings(values));
        self
    }

    /// `#e` references.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag('e', event_ids)
    }

    /// `#p` references.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag('p', pubkeys)
    }
}
