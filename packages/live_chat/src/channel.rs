//! Chat scopes and the transport/history addresses derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const GLOBAL_TOPIC: &str = "/sub/general-live-chat";
const GLOBAL_SEND: &str = "/pub/chat/general/live/message/send";
const GLOBAL_HISTORY: &str = "/chat/general/live/message/list";

const EVENT_TOPIC_PREFIX: &str = "/sub/fixture-live-chat/";
const EVENT_SEND: &str = "/pub/chat/fixture/live/message/send";
const EVENT_HISTORY: &str = "/chat/fixture/live/message/list";

/// Identifies a chat scope. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ChannelKey {
    /// The site-wide broadcast channel.
    Global,
    /// A channel bound to one live event (e.g. a single fixture).
    Event(String),
}

impl ChannelKey {
    pub fn event(id: impl Into<String>) -> Self {
        Self::Event(id.into())
    }

    /// Scope label, "global" or the event id.
    pub fn scope(&self) -> &str {
        match self {
            Self::Global => "global",
            Self::Event(id) => id,
        }
    }

    /// Topic the session subscribes to.
    pub fn topic(&self) -> String {
        match self {
            Self::Global => GLOBAL_TOPIC.to_string(),
            Self::Event(id) => format!("{EVENT_TOPIC_PREFIX}{id}"),
        }
    }

    /// Destination outbound messages are published to.
    pub fn publish_destination(&self) -> &'static str {
        match self {
            Self::Global => GLOBAL_SEND,
            Self::Event(_) => EVENT_SEND,
        }
    }

    pub fn history_path(&self) -> &'static str {
        match self {
            Self::Global => GLOBAL_HISTORY,
            Self::Event(_) => EVENT_HISTORY,
        }
    }

    /// Routing identifiers carried in history requests and outbound bodies.
    pub fn routing_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        if let Self::Event(id) = self {
            fields.insert("fixtureId".into(), serde_json::Value::String(id.clone()));
        }
        fields
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Event(id) => write!(f, "event:{id}"),
        }
    }
}

impl FromStr for ChannelKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("global") {
            return Ok(Self::Global);
        }
        match s.split_once(':') {
            Some(("event", id)) if !id.trim().is_empty() => Ok(Self::Event(id.trim().to_string())),
            _ => Err(format!(
                "invalid channel '{s}': expected 'global' or 'event:<id>'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_addresses() {
        let key = ChannelKey::Global;
        assert_eq!(key.topic(), "/sub/general-live-chat");
        assert_eq!(key.publish_destination(), "/pub/chat/general/live/message/send");
        assert_eq!(key.history_path(), "/chat/general/live/message/list");
        assert!(key.routing_fields().is_empty());
    }

    #[test]
    fn event_addresses_carry_the_id() {
        let key = ChannelKey::event("1035037");
        assert_eq!(key.topic(), "/sub/fixture-live-chat/1035037");
        assert_eq!(key.scope(), "1035037");
        assert_eq!(key.routing_fields()["fixtureId"], "1035037");
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("global".parse::<ChannelKey>().unwrap(), ChannelKey::Global);
        assert_eq!(
            "event:42".parse::<ChannelKey>().unwrap(),
            ChannelKey::event("42")
        );
        assert_eq!(ChannelKey::event("42").to_string(), "event:42");
        assert!("event:".parse::<ChannelKey>().is_err());
        assert!("lobby".parse::<ChannelKey>().is_err());
    }
}
