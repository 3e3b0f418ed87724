//! Outbound transport interface.
//!
//! The concrete chat transport lives outside this workspace; the daemon and
//! the messaging tools only need these two operations.

use async_trait::async_trait;

use crate::error::Result;

/// Interface to the chat transport for outbound traffic.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Deliver text and/or file attachments to a contact.
    async fn send(&self, target: &str, text: &str, attachments: &[String]) -> Result<()>;

    /// React with an emoji to the message a contact sent at `message_ts`.
    async fn send_reaction(&self, target: &str, emoji: &str, message_ts: i64) -> Result<()>;
}
