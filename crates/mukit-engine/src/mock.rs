use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mukit_core::{ChatId, ChatTransport, MessageId, TransportError};

/// Transport operations, used to script failures and count calls.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum MockOp {
    SendText,
    EditText,
    PinMessage,
    CurrentPin,
    RemovePinned,
    DeleteMessage,
}

/// A recorded transport call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    SendText { chat_id: ChatId, text: String },
    EditText {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
    },
    PinMessage { chat_id: ChatId, message_id: MessageId },
    CurrentPin { chat_id: ChatId },
    RemovePinned { chat_id: ChatId, message_id: MessageId },
    DeleteMessage { chat_id: ChatId, message_id: MessageId },
}

impl MockCall {
    pub fn op(&self) -> MockOp {
        match self {
            Self::SendText { .. } => MockOp::SendText,
            Self::EditText { .. } => MockOp::EditText,
            Self::PinMessage { .. } => MockOp::PinMessage,
            Self::CurrentPin { .. } => MockOp::CurrentPin,
            Self::RemovePinned { .. } => MockOp::RemovePinned,
            Self::DeleteMessage { .. } => MockOp::DeleteMessage,
        }
    }
}

/// Ids handed out by the mock start here, far above the small ids tests use
/// for inbound messages.
pub const FIRST_MOCK_MESSAGE_ID: i64 = 1_000_000;

#[derive(Default)]
struct MockState {
    sent: i64,
    messages: HashMap<(ChatId, MessageId), String>,
    pins: HashMap<ChatId, MessageId>,
    calls: Vec<MockCall>,
    failures: HashMap<MockOp, VecDeque<TransportError>>,
    latency: Option<Duration>,
}

impl MockState {
    fn next_message_id(&mut self) -> MessageId {
        self.sent += 1;
        MessageId::new(FIRST_MOCK_MESSAGE_ID + self.sent)
    }
}

/// In-memory chat for deterministic tests without network access.
///
/// Behaves like the Telegram transport: edits and pins need an existing
/// message, a manual unpin leaves the message in place. Failures are scripted
/// per operation with [`fail_next`](Self::fail_next).
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call of `op`. Queued errors are consumed in order.
    pub fn fail_next(&self, op: MockOp, error: TransportError) {
        self.state.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Change the chat's pin out of band, as a user would.
    pub fn set_pin(&self, chat_id: ChatId, message_id: Option<MessageId>) {
        let mut state = self.state.lock();
        match message_id {
            Some(id) => {
                let _ = state.pins.insert(chat_id, id);
            }
            None => {
                let _ = state.pins.remove(&chat_id);
            }
        }
    }

    pub fn pinned(&self, chat_id: ChatId) -> Option<MessageId> {
        self.state.lock().pins.get(&chat_id).copied()
    }

    pub fn pinned_text(&self, chat_id: ChatId) -> Option<String> {
        let state = self.state.lock();
        let id = state.pins.get(&chat_id)?;
        state.messages.get(&(chat_id, *id)).cloned()
    }

    pub fn message_text(&self, chat_id: ChatId, message_id: MessageId) -> Option<String> {
        self.state.lock().messages.get(&(chat_id, message_id)).cloned()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    /// Messages deleted in `chat_id`, in call order.
    pub fn deleted(&self, chat_id: ChatId) -> Vec<MessageId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::DeleteMessage { chat_id: cid, message_id } if *cid == chat_id => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    /// Record the call, then return its scripted failure if one is queued.
    async fn enter(&self, call: MockCall) -> Result<(), TransportError> {
        let op = call.op();
        let (latency, failure) = {
            let mut state = self.state.lock();
            state.calls.push(call);
            let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (state.latency, failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        failure.map_or(Ok(()), Err)
    }
}

fn missing(message_id: MessageId) -> TransportError {
    TransportError::NotFound(format!("message {message_id} not found"))
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, TransportError> {
        self.enter(MockCall::SendText {
            chat_id,
            text: text.to_string(),
        })
        .await?;
        let mut state = self.state.lock();
        let id = state.next_message_id();
        let _ = state.messages.insert((chat_id, id), text.to_string());
        Ok(id)
    }

    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TransportError> {
        self.enter(MockCall::EditText {
            chat_id,
            message_id,
            text: text.to_string(),
        })
        .await?;
        let mut state = self.state.lock();
        let existing = state.messages.get_mut(&(chat_id, message_id)).ok_or_else(|| missing(message_id))?;
        text.clone_into(existing);
        Ok(())
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.enter(MockCall::PinMessage { chat_id, message_id }).await?;
        let mut state = self.state.lock();
        if !state.messages.contains_key(&(chat_id, message_id)) {
            return Err(missing(message_id));
        }
        let _ = state.pins.insert(chat_id, message_id);
        Ok(())
    }

    async fn current_pin(&self, chat_id: ChatId) -> Result<Option<MessageId>, TransportError> {
        self.enter(MockCall::CurrentPin { chat_id }).await?;
        Ok(self.pinned(chat_id))
    }

    async fn remove_pinned(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.enter(MockCall::RemovePinned { chat_id, message_id }).await?;
        let mut state = self.state.lock();
        if state.pins.get(&chat_id) == Some(&message_id) {
            let _ = state.pins.remove(&chat_id);
        }
        let _ = state.messages.remove(&(chat_id, message_id));
        Ok(())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.enter(MockCall::DeleteMessage { chat_id, message_id }).await?;
        let mut state = self.state.lock();
        if state.pins.get(&chat_id) == Some(&message_id) {
            let _ = state.pins.remove(&chat_id);
        }
        let _ = state.messages.remove(&(chat_id, message_id));
        Ok(())
    }
}
