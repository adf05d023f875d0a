use tokio_tungstenite::tungstenite;

/// Errors surfaced by the chat client.
///
/// Transport and history failures leave the session usable in a degraded
/// mode; only `Unauthenticated` and `EmptyMessage` block a user action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The push endpoint could not be reached or the handshake failed.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The history request failed; the live stream keeps working.
    #[error("history unavailable: {0}")]
    HistoryUnavailable(String),

    /// Publish attempted while the connection is not `Connected`/`Subscribed`.
    #[error("not connected")]
    NotConnected,

    /// Publish attempted with no bearer credential available.
    #[error("not signed in: no credential available")]
    Unauthenticated,

    /// A collaborator record with a missing field or unparseable timestamp.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message text is empty")]
    EmptyMessage,

    /// The session or connection was torn down while the operation was in flight.
    #[error("session closed")]
    SessionClosed,

    /// A frame that does not decode as STOMP.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => Self::TransportUnavailable(io_err.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::SessionClosed
            }
            other => Self::TransportUnavailable(other.to_string()),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::HistoryUnavailable(format!("undecodable response: {err}"))
        } else if let Some(status) = err.status() {
            Self::HistoryUnavailable(format!("server returned {status}"))
        } else {
            Self::HistoryUnavailable(err.to_string())
        }
    }

    /// Whether the session can keep running after this error.
    pub fn is_degraded_mode(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::HistoryUnavailable(_) | Self::MalformedMessage(_)
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
