//! Relay selection for fan-out.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};

/// Which relays a subscription or publish is sent to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelaySelection {
    /// Every configured relay, connected or not
    All,
    /// Every relay that is currently connected
    #[default]
    Connected,
    /// The listed relays
    Batch(Vec<String>),
    /// Exactly one relay
    Single(String),
}

impl RelaySelection {
    /// Resolve against `(url, connected)` pairs in pool order.
    ///
    /// Urls that are not part of the pool select nothing.
    pub fn resolve<'a, I>(&self, relays: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        relays
            .into_iter()
            .filter(|(url, connected)| match self {
                RelaySelection::All => true,
                RelaySelection::Connected => *connected,
                RelaySelection::Batch(urls) => urls.iter().any(|u| u == url),
                RelaySelection::Single(u) => u == url,
            })
            .map(|(url, _)| url.to_string())
            .collect()
    }
}

/// Wire-style selection kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRelayKind {
    All,
    #[default]
    Connected,
    Batch,
    Single,
}

/// Selection as it arrives over a message boundary: a kind plus an optional url list.
///
/// Converted with `TryFrom`, or handed to [`crate::SubscribeOptions::call_relay`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRelay {
    #[serde(rename = "type")]
    pub kind: CallRelayKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl TryFrom<CallRelay> for RelaySelection {
    type Error = ClientError;

    fn try_from(call: CallRelay) -> Result<Self> {
        match call.kind {
            CallRelayKind::All => Ok(RelaySelection::All),
            CallRelayKind::Connected => Ok(RelaySelection::Connected),
            CallRelayKind::Batch => call.urls.map(RelaySelection::Batch).ok_or_else(|| {
                ClientError::InvalidSelection("batch selection needs a url list".to_string())
            }),
            CallRelayKind::Single => match call.urls {
                Some(mut urls) if urls.len() == 1 => Ok(RelaySelection::Single(urls.remove(0))),
                Some(urls) => Err(ClientError::InvalidSelection(format!(
                    "single selection needs exactly one url, got {}",
                    urls.len()
                ))),
                None => Err(ClientError::InvalidSelection(
                    "single selection needs exactly one url, got none".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RELAYS: [(&str, bool); 3] = [("ws://a", true), ("ws://b", false), ("ws://c", true)];

    #[test]
    fn test_resolve() {
        assert_eq!(
            RelaySelection::All.resolve(RELAYS),
            vec!["ws://a", "ws://b", "ws://c"]
        );
        assert_eq!(RelaySelection::Connected.resolve(RELAYS), vec!["ws://a", "ws://c"]);
        assert_eq!(
            RelaySelection::Batch(vec!["ws://c".to_string(), "ws://b".to_string()])
                .resolve(RELAYS),
            vec!["ws://b", "ws://c"]
        );
        assert_eq!(
            RelaySelection::Single("ws://b".to_string()).resolve(RELAYS),
            vec!["ws://b"]
        );
    }

    #[test]
    fn test_unknown_relays_select_nothing() {
        assert!(
            RelaySelection::Single("ws://elsewhere".to_string())
                .resolve(RELAYS)
                .is_empty()
        );
    }

    #[test]
    fn test_default_is_connected() {
        assert_eq!(RelaySelection::default(), RelaySelection::Connected);
        let call: CallRelay = serde_json::from_str(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(RelaySelection::try_from(call).unwrap(), RelaySelection::Connected);
    }

    #[test]
    fn test_single_requires_exactly_one_url() {
        let call = CallRelay {
            kind: CallRelayKind::Single,
            urls: Some(vec!["ws://a".to_string(), "ws://b".to_string()]),
        };
        assert!(matches!(
            RelaySelection::try_from(call),
            Err(ClientError::InvalidSelection(_))
        ));

        let call = CallRelay {
            kind: CallRelayKind::Single,
            urls: Some(vec![]),
        };
        assert!(RelaySelection::try_from(call).is_err());

        let call: CallRelay =
            serde_json::from_str(r#"{"type":"single","urls":["ws://a"]}"#).unwrap();
        assert_eq!(
            RelaySelection::try_from(call).unwrap(),
            RelaySelection::Single("ws://a".to_string())
        );
    }

    #[test]
    fn test_batch_requires_urls() {
        let call = CallRelay {
            kind: CallRelayKind::Batch,
            urls: None,
        };
        assert!(RelaySelection::try_from(call).is_err());
    }
}
