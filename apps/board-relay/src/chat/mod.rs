//! Outbound chat transport.

mod irc;

use async_trait::async_trait;
use thiserror::Error;

pub use irc::{IrcClient, IrcConfig, Message};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat client stopped")]
    Closed,
}

/// Connection lifecycle reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEvent {
    /// Registered with the server; sends will go out.
    Ready,
    Disconnected,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn join(&self, channel: &str) -> Result<(), ChatError>;
    /// `text` is already encoded for the channel.
    async fn notice(&self, channel: &str, text: &[u8]) -> Result<(), ChatError>;
}
