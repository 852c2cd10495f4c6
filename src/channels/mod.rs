//! Channel abstraction for message I/O.

pub mod telegram;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::watch;

use crate::commands::{CommandHandler, Reply, Sender, parse_command};
use crate::error::ChannelError;

pub use telegram::TelegramChannel;

/// A text message received from a chat.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub channel: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn sender(&self) -> Sender {
        Sender {
            user_id: self.user_id,
            chat_id: self.chat_id,
        }
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat front end.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Answer `msg`.
    async fn respond(&self, msg: &IncomingMessage, reply: &Reply) -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;
}

const CHATTER_HINT: &str = "Send me a t.me post link, or /help for commands.";

/// Feed every message from `channel` through `handler` until shutdown.
/// Each message is handled on its own task so a slow command never blocks
/// the stream.
pub async fn serve(
    channel: Arc<dyn Channel>,
    handler: Arc<CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    let mut messages = channel.start().await?;
    tracing::info!(channel = channel.name(), "Channel started");

    loop {
        let msg = tokio::select! {
            next = messages.next() => match next {
                Some(msg) => msg,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let channel = Arc::clone(&channel);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let reply = match parse_command(&msg.text) {
                Some(command) => handler.handle(msg.sender(), command).await,
                None => Reply {
                    text: CHATTER_HINT.to_string(),
                    delete_request: false,
                },
            };
            if let Err(e) = channel.respond(&msg, &reply).await {
                tracing::warn!(
                    channel = channel.name(),
                    chat_id = msg.chat_id,
                    error = %e,
                    "Failed to send reply"
                );
            }
        });
    }

    tracing::info!(channel = channel.name(), "Channel stopped");
    Ok(())
}
