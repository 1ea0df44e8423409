//! Per-chat orchestration: parse, classify, merge, render, publish, reconcile.
//!
//! Every chat has its own async mutex. An operation on a chat holds it for
//! its whole duration, transport awaits included, so mutations and ticks for
//! one chat are serialized while different chats proceed independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mukit_core::{
    ChatId, ChatStatus, ChatTransport, EngineStatus, Entry, InboundMessage, ReconcileResult, StatusSource,
    TimeOfDay, TransportError,
};
use mukit_settings::MukitSettings;

use crate::classifier::CategoryClassifier;
use crate::error::EngineError;
use crate::parser::{self, ParsedEntry, ParsedMessage, Rejection};
use crate::reconciler::{Observation, PinReconciler};
use crate::reliable::{ReliableTransport, RetryConfig};
use crate::renderer::SummaryRenderer;
use crate::store::{Snapshot, SummaryStore};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Zone used to stamp directives that carry no explicit time.
    pub tz: Tz,
    pub delete_directives: bool,
    pub empty_placeholder: String,
    pub tick_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            delete_directives: true,
            empty_placeholder: "(summary is empty)".to_string(),
            tick_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &MukitSettings) -> Result<Self, EngineError> {
        let engine = &settings.engine;
        Ok(Self {
            tz: engine.tz()?,
            delete_directives: engine.delete_directives,
            empty_placeholder: engine.empty_placeholder.clone(),
            tick_interval: Duration::from_millis(engine.tick_interval_ms),
            retry: RetryConfig::from_settings(&settings.retry, engine.transport_timeout_ms),
        })
    }
}

/// What the engine did with one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Not a directive; left for other handlers.
    PassThrough,
    /// A directive with nothing to record.
    Ignored,
    Merged {
        category: String,
        rendered: String,
        /// Whether the pinned summary was updated.
        published: bool,
    },
    /// `category` is `None` when the summary was already empty.
    RemovedLast { category: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    NothingToClear,
}

#[derive(Debug, Default)]
struct ChatSlot {
    store: SummaryStore,
    pin: PinReconciler,
}

/// Owns every chat's summary and pin state.
pub struct Engine {
    transport: ReliableTransport<Arc<dyn ChatTransport>>,
    classifier: CategoryClassifier,
    renderer: SummaryRenderer,
    config: EngineConfig,
    chats: DashMap<ChatId, Arc<Mutex<ChatSlot>>>,
    status: DashMap<ChatId, ChatStatus>,
    started_at: DateTime<Utc>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

impl Engine {
    pub fn new(transport: Arc<dyn ChatTransport>, classifier: CategoryClassifier, config: EngineConfig) -> Self {
        Self {
            transport: ReliableTransport::new(transport, config.retry.clone()),
            classifier,
            renderer: SummaryRenderer::new(config.empty_placeholder.clone()),
            config,
            chats: DashMap::new(),
            status: DashMap::new(),
            started_at: Utc::now(),
            last_tick_at: RwLock::new(None),
        }
    }

    pub fn from_settings(transport: Arc<dyn ChatTransport>, settings: &MukitSettings) -> Result<Self, EngineError> {
        let classifier = CategoryClassifier::from_settings(&settings.categories)?;
        let config = EngineConfig::from_settings(settings)?;
        Ok(Self::new(transport, classifier, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Retries performed by the transport wrapper since startup.
    pub fn transport_retries(&self) -> u64 {
        self.transport.total_retries()
    }

    fn slot(&self, chat_id: ChatId) -> Arc<Mutex<ChatSlot>> {
        Arc::clone(self.chats.entry(chat_id).or_default().value())
    }

    fn existing_slot(&self, chat_id: ChatId) -> Option<Arc<Mutex<ChatSlot>>> {
        self.chats.get(&chat_id).map(|slot| Arc::clone(slot.value()))
    }

    fn record_status(&self, chat_id: ChatId, update: impl FnOnce(&mut ChatStatus)) {
        let mut status = self.status.entry(chat_id).or_insert_with(|| ChatStatus::new(chat_id));
        update(&mut status);
    }

    /// Process one inbound message. Never fails; transport problems are
    /// logged and recorded in the chat's status.
    #[instrument(skip_all, fields(chat_id = msg.chat_id.get(), message_id = msg.message_id.get()))]
    pub async fn handle_message(&self, msg: &InboundMessage) -> MessageOutcome {
        let now = TimeOfDay::from(msg.received_at.with_timezone(&self.config.tz).time());
        match parser::parse(&msg.text, now) {
            ParsedMessage::Rejected(Rejection::NotDirective) => MessageOutcome::PassThrough,
            ParsedMessage::Rejected(Rejection::EmptyBody) => {
                debug!("directive without body ignored");
                MessageOutcome::Ignored
            }
            ParsedMessage::Entry(parsed) => self.merge(msg, parsed).await,
            ParsedMessage::RemoveLast => self.remove_last(msg).await,
        }
    }

    async fn merge(&self, msg: &InboundMessage, parsed: ParsedEntry) -> MessageOutcome {
        let category = self.classifier.classify(&parsed.body).to_string();
        let slot = self.slot(msg.chat_id);
        let mut chat = slot.lock().await;
        self.confirm_pin(msg.chat_id, &mut chat).await;

        let upsert = chat.store.upsert(Entry {
            category: category.clone(),
            time: parsed.time,
            body: parsed.body,
            source_ref: Some(msg.message_id),
        });
        info!(category = %category, explicit_time = parsed.explicit_time, ?upsert, "entry merged");

        let rendered = self.renderer.render(&chat.store.snapshot());
        let published = self.publish(msg.chat_id, &mut chat, &rendered).await;
        self.cleanup_directive(msg).await;

        MessageOutcome::Merged {
            category,
            rendered,
            published,
        }
    }

    async fn remove_last(&self, msg: &InboundMessage) -> MessageOutcome {
        let slot = self.slot(msg.chat_id);
        let mut chat = slot.lock().await;
        self.confirm_pin(msg.chat_id, &mut chat).await;

        let removed = chat.store.remove_last();
        if let Some(entry) = &removed {
            info!(category = %entry.category, "last entry removed");
            if chat.store.is_empty() {
                self.unpin(msg.chat_id, &mut chat).await;
            } else {
                let rendered = self.renderer.render(&chat.store.snapshot());
                let _ = self.publish(msg.chat_id, &mut chat, &rendered).await;
            }
        } else {
            debug!("nothing to remove");
        }
        self.cleanup_directive(msg).await;

        MessageOutcome::RemovedLast {
            category: removed.map(|e| e.category),
        }
    }

    /// Reconcile before mutating, so entries never land in a summary that is
    /// no longer pinned. After drift the store starts over and the next
    /// publish pins a fresh message. A failed check keeps the expectation.
    async fn confirm_pin(&self, chat_id: ChatId, chat: &mut ChatSlot) {
        if let Err(e) = self.reconcile_locked(chat_id, chat).await {
            debug!(kind = e.error_kind(), "pin check before merge failed, keeping expectation");
        }
    }

    /// Push `text` to the chat's pinned summary and record the new expectation.
    async fn publish(&self, chat_id: ChatId, chat: &mut ChatSlot, text: &str) -> bool {
        let previous = chat.pin.expected();
        let entries = chat.store.len();
        match self.transport.send_or_edit_pinned(chat_id, previous, text).await {
            Ok(message_id) => {
                chat.pin.record_pinned(message_id);
                debug!(message_id = message_id.get(), "summary published");
                self.record_status(chat_id, |s| {
                    s.entries = entries;
                    s.pinned = true;
                    s.last_render_at = Some(Utc::now());
                    s.last_error = None;
                });
                true
            }
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "failed to publish summary");
                self.record_status(chat_id, |s| {
                    s.entries = entries;
                    s.last_error = Some(e.to_string());
                });
                false
            }
        }
    }

    /// Remove the pinned summary, if any, and forget it.
    async fn unpin(&self, chat_id: ChatId, chat: &mut ChatSlot) {
        if let Some(message_id) = chat.pin.expected() {
            if let Err(e) = self.transport.remove_pinned(chat_id, message_id).await {
                warn!(message_id = message_id.get(), kind = e.error_kind(), error = %e, "failed to remove pinned summary");
                self.record_status(chat_id, |s| s.last_error = Some(e.to_string()));
            }
        }
        chat.pin.reset();
        let entries = chat.store.len();
        self.record_status(chat_id, |s| {
            s.entries = entries;
            s.pinned = false;
        });
    }

    async fn cleanup_directive(&self, msg: &InboundMessage) {
        if !self.config.delete_directives {
            return;
        }
        if let Err(e) = self.transport.delete_message(msg.chat_id, msg.message_id).await {
            debug!(kind = e.error_kind(), error = %e, "could not delete directive message");
        }
    }

    /// Empty the chat's summary and remove its pinned message.
    #[instrument(skip_all, fields(chat_id = chat_id.get()))]
    pub async fn clear(&self, chat_id: ChatId) -> ClearOutcome {
        let Some(slot) = self.existing_slot(chat_id) else {
            return ClearOutcome::NothingToClear;
        };
        let mut chat = slot.lock().await;
        if chat.store.is_empty() && chat.pin.expected().is_none() {
            return ClearOutcome::NothingToClear;
        }
        chat.store.clear();
        self.unpin(chat_id, &mut chat).await;
        info!("summary cleared");
        ClearOutcome::Cleared
    }

    /// Check one chat's pin against the transport.
    #[instrument(skip_all, fields(chat_id = chat_id.get()))]
    pub async fn reconcile(&self, chat_id: ChatId) -> Result<Observation, TransportError> {
        let Some(slot) = self.existing_slot(chat_id) else {
            return Ok(Observation::Idle);
        };
        let mut chat = slot.lock().await;
        self.reconcile_locked(chat_id, &mut chat).await
    }

    async fn reconcile_locked(&self, chat_id: ChatId, chat: &mut ChatSlot) -> Result<Observation, TransportError> {
        if chat.pin.expected().is_none() {
            return Ok(Observation::Idle);
        }

        let actual = match self.transport.current_pin(chat_id).await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(chat_id = chat_id.get(), op = "current_pin", kind = e.error_kind(), error = %e, "pin check failed");
                self.record_status(chat_id, |s| {
                    s.last_reconcile = ReconcileResult::Error;
                    s.last_reconcile_at = Some(Utc::now());
                    s.last_error = Some(e.to_string());
                });
                return Err(e);
            }
        };

        let ChatSlot { store, pin } = chat;
        let observation = pin.check(actual, store);
        let result = match observation {
            Observation::Idle => return Ok(observation),
            Observation::InSync => ReconcileResult::Ok,
            Observation::Drifted { expected, observed } => {
                info!(
                    chat_id = chat_id.get(),
                    expected = expected.get(),
                    observed = observed.map(|id| id.get()),
                    "pinned summary changed outside the bot, summary cleared"
                );
                ReconcileResult::Drifted
            }
        };
        let entries = store.len();
        let pinned = pin.expected().is_some();
        self.record_status(chat_id, |s| {
            s.last_reconcile = result;
            s.last_reconcile_at = Some(Utc::now());
            s.entries = entries;
            s.pinned = pinned;
        });
        Ok(observation)
    }

    /// Reconcile every known chat concurrently.
    ///
    /// Chats busy with a message are left for the next tick, so one slow
    /// chat never holds up the others or the tick itself.
    pub async fn tick(&self) -> Vec<(ChatId, Result<Observation, TransportError>)> {
        let mut idle = Vec::new();
        for entry in &self.chats {
            match Arc::clone(entry.value()).try_lock_owned() {
                Ok(guard) => idle.push((*entry.key(), guard)),
                Err(_) => debug!(chat_id = entry.key().get(), "chat busy, check postponed"),
            }
        }

        let results = join_all(idle.into_iter().map(|(chat_id, mut chat)| async move {
            (chat_id, self.reconcile_locked(chat_id, &mut chat).await)
        }))
        .await;

        *self.last_tick_at.write() = Some(Utc::now());
        results
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until cancelled.
    pub fn spawn_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = engine.config.tick_interval.as_millis() as u64, "reconciliation ticker started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let results = engine.tick().await;
                        let drifted = results
                            .iter()
                            .filter(|(_, r)| matches!(r, Ok(Observation::Drifted { .. })))
                            .count();
                        debug!(chats = results.len(), drifted, "tick complete");
                    }
                    () = cancel.cancelled() => {
                        info!("reconciliation ticker stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Copy of the chat's current entries. Unknown chats are empty.
    pub async fn snapshot(&self, chat_id: ChatId) -> Snapshot {
        match self.existing_slot(chat_id) {
            Some(slot) => slot.lock().await.store.snapshot(),
            None => Snapshot::default(),
        }
    }

    /// The text the pinned summary should currently hold.
    pub async fn rendered(&self, chat_id: ChatId) -> String {
        self.renderer.render(&self.snapshot(chat_id).await)
    }
}

impl StatusSource for Engine {
    fn status(&self) -> EngineStatus {
        let mut chats: Vec<ChatStatus> = self.status.iter().map(|s| s.value().clone()).collect();
        chats.sort_by_key(|s| s.chat_id);
        EngineStatus {
            started_at: self.started_at,
            last_tick_at: *self.last_tick_at.read(),
            tick_interval_ms: u64::try_from(self.config.tick_interval.as_millis()).unwrap_or(u64::MAX),
            chats,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mukit_core::MessageId;
    use mukit_settings::CategorySettings;

    use super::*;
    use crate::mock::{MockOp, MockTransport};

    const CHAT: ChatId = ChatId::new(100);

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                jitter_factor: 0.0,
                call_timeout: Duration::from_secs(1),
            },
            tick_interval: Duration::from_secs(1),
            ..EngineConfig::default()
        }
    }

    fn engine_with(config: EngineConfig) -> (Arc<Engine>, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let classifier = CategoryClassifier::from_settings(&CategorySettings::default()).unwrap();
        let transport: Arc<dyn ChatTransport> = mock.clone();
        (Arc::new(Engine::new(transport, classifier, config)), mock)
    }

    fn engine() -> (Arc<Engine>, Arc<MockTransport>) {
        engine_with(config())
    }

    fn msg(chat: ChatId, id: i64, text: &str, hour: u32, minute: u32) -> InboundMessage {
        InboundMessage {
            chat_id: chat,
            message_id: MessageId::new(id),
            text: text.to_string(),
            received_at: Utc.with_ymd_and_hms(2026, 10, 18, hour, minute, 0).unwrap(),
        }
    }

    fn chat_status(engine: &Engine, chat: ChatId) -> ChatStatus {
        engine
            .status()
            .chats
            .into_iter()
            .find(|s| s.chat_id == chat)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn gym_directive_lands_in_fitness() {
        let (engine, mock) = engine();
        let outcome = engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        assert_eq!(
            outcome,
            MessageOutcome::Merged {
                category: "fitness".into(),
                rendered: "=fitness=\n09:00 gym".into(),
                published: true,
            }
        );
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=fitness=\n09:00 gym"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_category_replaces_slot_and_edits_pin() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        let first_pin = mock.pinned(CHAT);
        engine.handle_message(&msg(CHAT, 2, ".Gym evening", 18, 30)).await;

        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
        assert_eq!(mock.pinned(CHAT), first_pin);
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=fitness=\n18:30 gym evening"));
    }

    #[tokio::test(start_paused = true)]
    async fn categories_render_in_first_seen_order() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".08.00 breakfast", 9, 0)).await;
        engine.handle_message(&msg(CHAT, 2, ".gym", 9, 5)).await;
        engine.handle_message(&msg(CHAT, 3, ".12.30 lunch with team", 12, 31)).await;
        assert_eq!(
            mock.pinned_text(CHAT).as_deref(),
            Some("=food=\n12:30 lunch with team\n\n=fitness=\n09:05 gym")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn directives_are_deleted_after_merge() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 11, ".gym", 9, 0)).await;
        engine.handle_message(&msg(CHAT, 12, ".nap", 14, 0)).await;
        assert_eq!(mock.deleted(CHAT), vec![MessageId::new(11), MessageId::new(12)]);
    }

    #[tokio::test(start_paused = true)]
    async fn directive_cleanup_can_be_disabled() {
        let (engine, mock) = engine_with(EngineConfig {
            delete_directives: false,
            ..config()
        });
        engine.handle_message(&msg(CHAT, 11, ".gym", 9, 0)).await;
        assert_eq!(mock.call_count(MockOp::DeleteMessage), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_directives_pass_through_untouched() {
        let (engine, mock) = engine();
        assert_eq!(
            engine.handle_message(&msg(CHAT, 1, "hello there", 9, 0)).await,
            MessageOutcome::PassThrough
        );
        assert_eq!(engine.handle_message(&msg(CHAT, 2, ".  ", 9, 0)).await, MessageOutcome::Ignored);
        assert!(mock.calls().is_empty());
        assert!(engine.status().chats.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn default_time_uses_configured_zone() {
        let (engine, mock) = engine_with(EngineConfig {
            tz: chrono_tz::Asia::Tokyo,
            ..config()
        });
        engine.handle_message(&msg(CHAT, 1, ".coffee", 0, 30)).await;
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=food=\n09:30 coffee"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_unpin_clears_summary() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        mock.set_pin(CHAT, None);

        let observation = engine.reconcile(CHAT).await.unwrap();
        assert!(matches!(observation, Observation::Drifted { observed: None, .. }));
        assert!(engine.snapshot(CHAT).await.is_empty());
        assert_eq!(engine.rendered(CHAT).await, "(summary is empty)");

        let status = chat_status(&engine, CHAT);
        assert_eq!(status.last_reconcile, ReconcileResult::Drifted);
        assert_eq!(status.entries, 0);
        assert!(!status.pinned);
    }

    #[tokio::test(start_paused = true)]
    async fn different_pin_is_drift() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        mock.set_pin(CHAT, Some(MessageId::new(9_999)));
        assert!(matches!(
            engine.reconcile(CHAT).await.unwrap(),
            Observation::Drifted { .. }
        ));
        assert!(engine.snapshot(CHAT).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn next_directive_after_drift_pins_fresh_message() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        let old = mock.pinned(CHAT);
        mock.set_pin(CHAT, None);
        engine.reconcile(CHAT).await.unwrap();

        engine.handle_message(&msg(CHAT, 2, ".lunch", 13, 0)).await;
        assert_ne!(mock.pinned(CHAT), old);
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=food=\n13:00 lunch"));
    }

    #[tokio::test(start_paused = true)]
    async fn directive_after_manual_unpin_is_kept() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 101, ".gym", 9, 0)).await;
        let old = mock.pinned(CHAT).unwrap();
        mock.set_pin(CHAT, None);

        let outcome = engine.handle_message(&msg(CHAT, 102, ".lunch", 13, 0)).await;
        assert_eq!(
            outcome,
            MessageOutcome::Merged {
                category: "food".into(),
                rendered: "=food=\n13:00 lunch".into(),
                published: true,
            }
        );
        let pinned = mock.pinned(CHAT).unwrap();
        assert_ne!(pinned, old);
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=food=\n13:00 lunch"));

        assert_eq!(engine.reconcile(CHAT).await.unwrap(), Observation::InSync);
        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pin_check_before_merge_still_edits() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        let pinned = mock.pinned(CHAT);
        mock.fail_next(MockOp::CurrentPin, TransportError::Rejected("forbidden".into()));

        engine.handle_message(&msg(CHAT, 2, ".lunch", 13, 0)).await;
        assert_eq!(mock.pinned(CHAT), pinned);
        assert_eq!(engine.snapshot(CHAT).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_in_sync_is_ok() {
        let (engine, _mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        assert_eq!(engine.reconcile(CHAT).await.unwrap(), Observation::InSync);
        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
        assert_eq!(chat_status(&engine, CHAT).last_reconcile, ReconcileResult::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_unknown_chat_is_idle() {
        let (engine, mock) = engine();
        assert_eq!(engine.reconcile(ChatId::new(5)).await.unwrap(), Observation::Idle);
        assert_eq!(mock.call_count(MockOp::CurrentPin), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_failure_recorded_and_store_kept() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        mock.fail_next(MockOp::CurrentPin, TransportError::Rejected("chat not found".into()));

        assert!(engine.reconcile(CHAT).await.is_err());
        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
        let status = chat_status(&engine, CHAT);
        assert_eq!(status.last_reconcile, ReconcileResult::Error);
        assert!(status.last_error.unwrap().contains("chat not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_keeps_entry() {
        let (engine, mock) = engine();
        mock.fail_next(MockOp::SendText, TransportError::Unauthorized("revoked".into()));

        let outcome = engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        assert!(matches!(outcome, MessageOutcome::Merged { published: false, .. }));
        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
        assert!(chat_status(&engine, CHAT).last_error.is_some());

        engine.handle_message(&msg(CHAT, 2, ".lunch", 13, 0)).await;
        assert_eq!(
            mock.pinned_text(CHAT).as_deref(),
            Some("=fitness=\n09:00 gym\n\n=food=\n13:00 lunch")
        );
        assert!(chat_status(&engine, CHAT).last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_publish_failure_is_retried() {
        let (engine, mock) = engine();
        mock.fail_next(MockOp::SendText, TransportError::Network("reset".into()));
        let outcome = engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        assert!(matches!(outcome, MessageOutcome::Merged { published: true, .. }));
        assert_eq!(engine.transport_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_pin_and_entries() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        let pinned = mock.pinned(CHAT).unwrap();

        assert_eq!(engine.clear(CHAT).await, ClearOutcome::Cleared);
        assert_eq!(mock.pinned(CHAT), None);
        assert_eq!(mock.message_text(CHAT, pinned), None);
        assert!(engine.snapshot(CHAT).await.is_empty());

        assert_eq!(engine.clear(CHAT).await, ClearOutcome::NothingToClear);
        assert_eq!(engine.clear(ChatId::new(1)).await, ClearOutcome::NothingToClear);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_last_rerenders_then_unpins() {
        let (engine, mock) = engine();
        engine.handle_message(&msg(CHAT, 1, ".breakfast", 8, 0)).await;
        engine.handle_message(&msg(CHAT, 2, ".gym", 9, 0)).await;

        let outcome = engine.handle_message(&msg(CHAT, 3, ".-", 9, 1)).await;
        assert_eq!(
            outcome,
            MessageOutcome::RemovedLast {
                category: Some("fitness".into())
            }
        );
        assert_eq!(mock.pinned_text(CHAT).as_deref(), Some("=food=\n08:00 breakfast"));

        engine.handle_message(&msg(CHAT, 4, ".-", 9, 2)).await;
        assert_eq!(mock.pinned(CHAT), None);
        assert_eq!(mock.call_count(MockOp::RemovePinned), 1);

        let outcome = engine.handle_message(&msg(CHAT, 5, ".-", 9, 3)).await;
        assert_eq!(outcome, MessageOutcome::RemovedLast { category: None });
        assert_eq!(mock.deleted(CHAT).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_checks_every_chat() {
        let (engine, mock) = engine();
        let other = ChatId::new(200);
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        engine.handle_message(&msg(other, 1, ".nap", 14, 0)).await;
        mock.set_pin(other, None);

        let mut results = engine.tick().await;
        results.sort_by_key(|(id, _)| *id);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], (id, Ok(Observation::InSync)) if id == CHAT));
        assert!(matches!(results[1], (id, Ok(Observation::Drifted { .. }))  if id == other));
        assert!(engine.status().last_tick_at.is_some());
        assert_eq!(engine.snapshot(CHAT).await.len(), 1);
        assert!(engine.snapshot(other).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_skips_busy_chat() {
        let (engine, mock) = engine();
        let other = ChatId::new(200);
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        engine.handle_message(&msg(other, 1, ".nap", 14, 0)).await;

        let slot = engine.slot(other);
        let busy = slot.lock().await;
        let results = engine.tick().await;
        drop(busy);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, CHAT);
        assert!(engine.status().last_tick_at.is_some());
        assert_eq!(mock.call_count(MockOp::CurrentPin), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_render_does_not_stall_tick() {
        let (engine, mock) = engine();
        let other = ChatId::new(200);
        engine.handle_message(&msg(CHAT, 1, ".gym", 9, 0)).await;
        mock.fail_next(
            MockOp::SendText,
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(600)),
            },
        );

        let render = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle_message(&msg(other, 1, ".nap", 14, 0)).await })
        };
        // Wait until the spawned render holds the chat.
        loop {
            let held = match engine.existing_slot(other) {
                Some(slot) => slot.try_lock().is_err(),
                None => false,
            };
            if held {
                break;
            }
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        let results = engine.tick().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(results.iter().all(|(id, _)| *id == CHAT));

        let outcome = render.await.unwrap();
        assert!(matches!(outcome, MessageOutcome::Merged { published: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_directives_for_one_chat_pin_once() {
        let (engine, mock) = engine();
        mock.set_latency(Some(Duration::from_millis(50)));

        let texts = [".breakfast", ".gym", ".nap", ".meeting"];
        let handles: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let engine = Arc::clone(&engine);
                let m = msg(CHAT, i as i64 + 1, text, 9, 0);
                tokio::spawn(async move { engine.handle_message(&m).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(mock.call_count(MockOp::SendText), 1);
        assert_eq!(mock.call_count(MockOp::PinMessage), 1);
        assert_eq!(mock.call_count(MockOp::EditText), 3);
        assert_eq!(engine.snapshot(CHAT).await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_runs_until_cancelled() {
        let (engine, _mock) = engine();
        let cancel = CancellationToken::new();
        let handle = engine.spawn_ticker(cancel.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(engine.status().last_tick_at.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn config_from_settings() {
        let mut settings = MukitSettings::default();
        settings.engine.timezone = "Europe/Moscow".into();
        settings.engine.tick_interval_ms = 2_000;
        let config = EngineConfig::from_settings(&settings).unwrap();
        assert_eq!(config.tz, chrono_tz::Europe::Moscow);
        assert_eq!(config.tick_interval, Duration::from_secs(2));
        assert_eq!(config.retry.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn bad_timezone_rejected() {
        let mut settings = MukitSettings::default();
        settings.engine.timezone = "Mars/Olympus".into();
        let mock: Arc<dyn ChatTransport> = Arc::new(MockTransport::new());
        assert!(matches!(
            Engine::from_settings(mock, &settings),
            Err(EngineError::Settings(_))
        ));
    }
}
