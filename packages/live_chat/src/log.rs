//! Ordered, deduplicated message log.
//!
//! Ordering law: concatenate, drop repeated ids (first occurrence wins), then
//! sort by `(timestamp, id)`. Any two merges over the same set of messages
//! produce the same sequence, regardless of which source arrived first.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::message::{Message, MessageId};

fn display_order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

/// Merge two batches into one ordered, duplicate-free sequence.
pub fn merge(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<&MessageId> = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged: Vec<Message> = existing
        .iter()
        .chain(incoming)
        .filter(|msg| seen.insert(&msg.id))
        .cloned()
        .collect();
    merged.sort_by(display_order);
    merged
}

/// `merge(log, [message])`.
pub fn append(log: &[Message], message: Message) -> Vec<Message> {
    merge(log, std::slice::from_ref(&message))
}

/// The in-memory log a session renders from.
///
/// Mutation is single-writer: only the owning session touches it, from its
/// event loop.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one message at its ordered position. Returns false if the id is
    /// already present.
    pub fn append(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| display_order(m, &message) == Ordering::Less);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Merge a batch (typically fetched history). Returns how many new
    /// messages were inserted.
    pub fn merge_batch(&mut self, incoming: Vec<Message>) -> usize {
        let before = self.messages.len();
        self.messages = merge(&self.messages, &incoming);
        self.ids = self.messages.iter().map(|m| m.id.clone()).collect();
        self.messages.len() - before
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
