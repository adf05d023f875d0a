//! Live chat client: a STOMP push subscription merged with REST history into
//! one ordered, deduplicated message log per channel.

pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod follow;
pub mod history;
pub mod log;
pub mod message;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use channel::ChannelKey;
pub use credentials::{Credential, CredentialSource};
pub use error::{ChatError, ChatResult};
pub use follow::{FollowTracker, ScrollPosition};
pub use history::{HistoryFetcher, HttpHistoryFetcher};
pub use log::MessageLog;
pub use message::{Message, MessageId, RawMessage};
pub use session::{ChatSession, SessionUpdate};
pub use transport::{ConnectionState, StompTransport, Transport};
