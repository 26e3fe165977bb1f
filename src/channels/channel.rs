//! Channel trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

/// Stream of inbound messages produced by a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Fallback display name when the transport provides none.
const DEFAULT_DISPLAY_NAME: &str = "друг";

/// An inbound message from any channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Channel name ("telegram", "cli").
    pub channel: String,
    /// Stable user identity within the channel.
    pub user_id: String,
    /// Display name, if the transport provides one.
    pub user_name: Option<String>,
    /// Message text (voice messages arrive already transcribed).
    pub content: String,
    /// Channel-specific metadata (chat id, username, voice flag).
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Display name for the profile, with a friendly fallback.
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or(DEFAULT_DISPLAY_NAME)
    }
}

/// An outbound response to a channel.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub content: String,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Transient status shown while a turn is being processed.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    /// The agent is working on a reply.
    Thinking,
    /// Informational message worth surfacing.
    Status(String),
}

/// A message transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name for logging and routing.
    fn name(&self) -> &str;

    /// Start the channel and return its inbound message stream.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Send a response back to the message's origin.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    /// Send a transient status update. Channels without a suitable
    /// surface ignore these.
    async fn send_status(
        &self,
        _status: StatusUpdate,
        _metadata: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Graceful shutdown.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Out-of-band delivery to a user, independent of any inbound message.
/// Scheduled checkins go through this seam so the checkin body stays
/// transport-agnostic and testable with a recording fake.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_fallback() {
        let msg = IncomingMessage::new("cli", "1", "привет");
        assert_eq!(msg.display_name(), "друг");

        let named = msg.with_user_name("Аня");
        assert_eq!(named.display_name(), "Аня");
    }

    #[test]
    fn metadata_builder() {
        let msg = IncomingMessage::new("telegram", "1", "hi")
            .with_metadata(serde_json::json!({"chat_id": "1"}));
        assert_eq!(msg.metadata["chat_id"], "1");
    }
}
