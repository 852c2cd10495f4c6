//! Save Restricted Bot: fetches posts from Telegram chats that forbid
//! forwarding and re-sends them to the requesting user, through a durable
//! download queue.

pub mod api;
pub mod backup;
pub mod channels;
pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod links;
pub mod platform;
pub mod progress;
pub mod queue;
pub mod settings;
pub mod store;
pub mod vault;
