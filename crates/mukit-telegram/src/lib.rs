//! Telegram Bot API adapter: a [`ChatTransport`](mukit_core::ChatTransport)
//! implementation plus the long-poll loop that feeds the engine.

pub mod client;
pub mod error;
pub mod runner;
pub mod types;

pub use client::TelegramClient;
pub use error::TelegramError;
pub use runner::{route, Command, Route, UpdateRunner};
