//! Push transport: connection lifecycle, topic subscriptions, publishing.

pub mod stomp;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ChatResult;

pub use websocket::StompTransport;

/// Lifecycle of a transport connection.
///
/// `Disconnected -> Connecting -> Connected -> Subscribed -> Closed`, with an
/// error edge from any non-closed state to `Closed`. A `connect` issued after
/// `Closed` passes through `Reconnecting` instead of `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether publishing is allowed in this state.
    pub fn can_publish(&self) -> bool {
        matches!(self, Self::Connected | Self::Subscribed)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Invoked once per inbound message, in arrival order per topic. Runs on the
/// transport's reader; it must not call back into `subscribe`, `unsubscribe`
/// or `disconnect`.
pub type InboundHandler = Arc<dyn Fn(InboundFrame) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub topic: String,
}

/// The push-channel contract a chat session drives.
///
/// Implementations own their connection exclusively; nothing here is a
/// process-wide singleton.
pub trait Transport: Send + Sync + 'static {
    /// Establish the connection. No automatic retry: the caller decides.
    fn connect(&self, endpoint: &str) -> impl Future<Output = ChatResult<()>> + Send;

    /// Register `handler` for `topic`. Valid from `Connected` onwards.
    /// Subscribing to a topic that is already subscribed returns the existing
    /// handle.
    fn subscribe(&self, topic: &str, handler: InboundHandler) -> ChatResult<SubscriptionHandle>;

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> ChatResult<()>;

    /// Fire-and-forget send. Headers are attached verbatim.
    fn publish(&self, topic: &str, headers: &[(String, String)], body: &str) -> ChatResult<()>;

    /// Idempotent; always ends in `Closed` and releases all subscriptions.
    fn disconnect(&self);

    fn state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
}
