//! Chat message model and intake validation.
//!
//! `RawMessage` is what collaborators send (history records and live push
//! bodies). `Message::from_raw` is the only path from a raw record to a
//! `Message`, so every message held in a log has a usable timestamp.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelKey;
use crate::error::{ChatError, ChatResult};

/// Zone-less layouts the chat backend emits for local date-times.
const LOCAL_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Opaque message identifier, unique within a channel's log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic id for records the server sent without one, so the same
    /// record seen via history and via the live stream collapses to one entry.
    ///
    /// Two distinct id-less messages with the same sender, body and timestamp
    /// in one channel also share an id, so only the first of them is kept.
    fn synthesize(
        channel: &ChannelKey,
        timestamp: &DateTime<Utc>,
        sender: &str,
        body: &str,
    ) -> Self {
        let key = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            channel.scope(),
            timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            sender,
            body
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Message-shaped record as delivered by the history endpoint or the push
/// transport. Every field is optional here; validation happens in
/// [`Message::from_raw`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default, alias = "messageId", skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, alias = "senderDisplayName", alias = "sender")]
    pub nickname: Option<String>,
    #[serde(default, alias = "body", alias = "text")]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

impl RawMessage {
    /// Decode one record. A record of the wrong shape is rejected on its own
    /// and never takes its batch down with it.
    pub fn from_value(value: serde_json::Value) -> ChatResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| ChatError::MalformedMessage(format!("unexpected record shape: {e}")))
    }
}

/// A validated chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: ChannelKey,
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Validate a raw record. Missing sender/body or an unparseable timestamp
    /// rejects the record.
    pub fn from_raw(channel: &ChannelKey, raw: RawMessage) -> ChatResult<Self> {
        let timestamp = match raw.timestamp.as_ref() {
            Some(value) => parse_timestamp(value)?,
            None => return Err(ChatError::MalformedMessage("missing timestamp".into())),
        };
        let sender = raw
            .nickname
            .ok_or_else(|| ChatError::MalformedMessage("missing nickname".into()))?;
        let body = raw
            .message
            .ok_or_else(|| ChatError::MalformedMessage("missing message text".into()))?;

        let id = match raw.id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => MessageId(s),
            Some(serde_json::Value::Number(n)) => MessageId(n.to_string()),
            Some(serde_json::Value::Null | serde_json::Value::String(_)) | None => {
                MessageId::synthesize(channel, &timestamp, &sender, &body)
            }
            Some(other) => {
                return Err(ChatError::MalformedMessage(format!(
                    "unsupported id value: {other}"
                )));
            }
        };

        Ok(Self {
            id,
            channel: channel.clone(),
            sender,
            body,
            timestamp,
        })
    }

    /// Decode and validate one history record.
    pub fn from_value(channel: &ChannelKey, value: serde_json::Value) -> ChatResult<Self> {
        Self::from_raw(channel, RawMessage::from_value(value)?)
    }

    /// Decode and validate a live push body.
    pub fn from_json(channel: &ChannelKey, body: &str) -> ChatResult<Self> {
        let raw: RawMessage = serde_json::from_str(body)
            .map_err(|e| ChatError::MalformedMessage(format!("invalid json: {e}")))?;
        Self::from_raw(channel, raw)
    }
}

/// Parse RFC 3339, zone-less ISO local date-times (read as UTC), or epoch
/// milliseconds.
pub fn parse_timestamp(value: &serde_json::Value) -> ChatResult<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            LOCAL_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| ChatError::MalformedMessage(format!("unparseable timestamp '{s}'")))
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ChatError::MalformedMessage(format!("timestamp out of range: {n}"))),
        other => Err(ChatError::MalformedMessage(format!(
            "unsupported timestamp value: {other}"
        ))),
    }
}
