//! Long-poll update loop.
//!
//! Each chat gets its own worker fed by an ordered queue: messages for a chat
//! reach the engine in the order the chat produced them, while a chat stuck
//! in retries does not hold up the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mukit_core::{ChatId, ChatTransport, InboundMessage, MessageId};
use mukit_engine::{ClearOutcome, Engine};

use crate::client::TelegramClient;
use crate::error::TelegramError;
use crate::types::{Message, Update};

pub const START_REPLY: &str = "Hello! I'm alive. Use /help for commands.";
pub const HELP_REPLY: &str = "Available commands: /start, /help, /clear";
pub const CLEARED_REPLY: &str = "Cleared.";
pub const NOTHING_TO_CLEAR_REPLY: &str = "Nothing to clear.";

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Clear,
}

impl Command {
    /// Accepts `/clear` as well as the group form `/clear@some_bot`.
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = token.split('@').next().unwrap_or(token);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }
}

/// Where an incoming message goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Command(Command),
    /// "Message pinned" notice caused by the bot itself.
    OwnPinNotice,
    Text,
    Skip,
}

pub fn route(message: &Message, bot_id: i64) -> Route {
    if message.pinned_message.is_some() {
        let from_bot = message.from.as_ref().is_some_and(|u| u.id == bot_id);
        return if from_bot { Route::OwnPinNotice } else { Route::Skip };
    }
    let Some(text) = message.text.as_deref() else {
        return Route::Skip;
    };
    Command::parse(text).map_or(Route::Text, Route::Command)
}

fn poll_backoff(consecutive_failures: u32) -> Duration {
    Duration::from_secs(1u64 << consecutive_failures.min(5)).min(MAX_POLL_BACKOFF)
}

/// Per-chat update queues and the workers draining them.
struct ChatQueues {
    senders: HashMap<ChatId, mpsc::UnboundedSender<Update>>,
    workers: JoinSet<()>,
}

impl ChatQueues {
    fn new() -> Self {
        Self {
            senders: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Queue `update` behind earlier updates of the same chat, starting a
    /// worker for chats seen for the first time.
    fn dispatch(&mut self, runner: &Arc<UpdateRunner>, update: Update, cancel: &CancellationToken) {
        let Some(chat_id) = update.message.as_ref().map(|m| ChatId::new(m.chat.id)) else {
            return;
        };
        let update = match self.senders.get(&chat_id) {
            Some(tx) => match tx.send(update) {
                Ok(()) => return,
                Err(mpsc::error::SendError(update)) => update,
            },
            None => update,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(update);
        let _ = self.senders.insert(chat_id, tx);
        let _ = self
            .workers
            .spawn(UpdateRunner::chat_worker(Arc::clone(runner), rx, cancel.clone()));
        debug!(chat_id = chat_id.get(), chats = self.senders.len(), "chat worker started");
    }

    /// Close every queue and wait for the workers to finish their current update.
    async fn shutdown(mut self) {
        self.senders.clear();
        while self.workers.join_next().await.is_some() {}
    }
}

pub struct UpdateRunner {
    client: Arc<TelegramClient>,
    engine: Arc<Engine>,
    poll_timeout: Duration,
    bot_id: i64,
}

impl UpdateRunner {
    pub fn new(client: Arc<TelegramClient>, engine: Arc<Engine>, poll_timeout: Duration, bot_id: i64) -> Self {
        Self {
            client,
            engine,
            poll_timeout,
            bot_id,
        }
    }

    /// Resolve the bot's own identity, then build the runner.
    pub async fn connect(
        client: Arc<TelegramClient>,
        engine: Arc<Engine>,
        poll_timeout: Duration,
    ) -> Result<Self, TelegramError> {
        let me = client.get_me().await?;
        info!(bot_id = me.id, username = ?me.username, "connected to telegram");
        Ok(Self::new(client, engine, poll_timeout, me.id))
    }

    /// Poll until cancelled. Poll failures back off and never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let runner = Arc::new(self);
        let mut queues = ChatQueues::new();
        let mut offset: Option<i64> = None;
        let mut failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                () = cancel.cancelled() => break,
                polled = runner.client.get_updates(offset, runner.poll_timeout) => polled,
            };

            match polled {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        queues.dispatch(&runner, update, &cancel);
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = poll_backoff(failures);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    warn!(failures, delay_ms, error = %e, "getUpdates failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        queues.shutdown().await;
        info!("update runner stopped");
    }

    async fn chat_worker(runner: Arc<Self>, mut updates: mpsc::UnboundedReceiver<Update>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = updates.recv() => match next {
                    Some(update) => runner.handle_update(update).await,
                    None => break,
                },
            }
        }
    }

    pub async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let chat_id = ChatId::new(message.chat.id);
        let message_id = MessageId::new(message.message_id);

        match route(&message, self.bot_id) {
            Route::Command(command) => {
                debug!(chat_id = chat_id.get(), ?command, "command received");
                let reply = match command {
                    Command::Start => START_REPLY,
                    Command::Help => HELP_REPLY,
                    Command::Clear => match self.engine.clear(chat_id).await {
                        ClearOutcome::Cleared => CLEARED_REPLY,
                        ClearOutcome::NothingToClear => NOTHING_TO_CLEAR_REPLY,
                    },
                };
                self.reply(chat_id, reply).await;
            }
            Route::OwnPinNotice => {
                if let Err(e) = self.client.delete_message(chat_id, message_id).await {
                    debug!(chat_id = chat_id.get(), error = %e, "could not delete pin notice");
                }
            }
            Route::Text => {
                let inbound = InboundMessage {
                    chat_id,
                    message_id,
                    text: message.text.unwrap_or_default(),
                    received_at: DateTime::from_timestamp(message.date, 0).unwrap_or_else(Utc::now),
                };
                let outcome = self.engine.handle_message(&inbound).await;
                debug!(chat_id = chat_id.get(), ?outcome, "message handled");
            }
            Route::Skip => {}
        }
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.client.send_text(chat_id, text).await {
            warn!(chat_id = chat_id.get(), kind = e.error_kind(), error = %e, "failed to send reply");
        }
    }
}
