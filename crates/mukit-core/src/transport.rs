use async_trait::async_trait;

use crate::errors::TransportError;
use crate::ids::{ChatId, MessageId};

/// Outbound side of the chat platform, as seen by the engine.
///
/// Implementations must be cheap to call concurrently for different chats.
/// The engine never issues two calls for the same chat at once.
///
/// The required methods are single platform calls, each safe to repeat on
/// its own. [`send_or_edit_pinned`](Self::send_or_edit_pinned) composes them,
/// so a wrapper that retries the primitives never re-runs a step that
/// already succeeded.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, TransportError>;

    /// Replace the text of an existing message. Unchanged text is success.
    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TransportError>;

    /// Pin `message_id` silently.
    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError>;

    /// The message currently pinned in the chat, if any.
    async fn current_pin(&self, chat_id: ChatId) -> Result<Option<MessageId>, TransportError>;

    /// Unpin and delete the summary message.
    async fn remove_pinned(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError>;

    /// Create or update the chat's summary message.
    ///
    /// `previous` is the pinned message the engine expects to hold the
    /// summary; it is edited in place. When it cannot be edited (or there is
    /// none) a fresh message is sent and pinned. A sent message whose pin
    /// fails is deleted again. Returns the id now holding the summary.
    async fn send_or_edit_pinned(
        &self,
        chat_id: ChatId,
        previous: Option<MessageId>,
        text: &str,
    ) -> Result<MessageId, TransportError> {
        if let Some(message_id) = previous {
            match self.edit_text(chat_id, message_id, text).await {
                Ok(()) => return Ok(message_id),
                Err(e) if e.is_retryable() => return Err(e),
                Err(_) => {}
            }
        }

        let message_id = self.send_text(chat_id, text).await?;
        if let Err(e) = self.pin_message(chat_id, message_id).await {
            let _ = self.delete_message(chat_id, message_id).await;
            return Err(e);
        }
        Ok(message_id)
    }
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for std::sync::Arc<T> {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, TransportError> {
        (**self).send_text(chat_id, text).await
    }

    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TransportError> {
        (**self).edit_text(chat_id, message_id, text).await
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        (**self).pin_message(chat_id, message_id).await
    }

    async fn current_pin(&self, chat_id: ChatId) -> Result<Option<MessageId>, TransportError> {
        (**self).current_pin(chat_id).await
    }

    async fn remove_pinned(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        (**self).remove_pinned(chat_id, message_id).await
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        (**self).delete_message(chat_id, message_id).await
    }

    async fn send_or_edit_pinned(
        &self,
        chat_id: ChatId,
        previous: Option<MessageId>,
        text: &str,
    ) -> Result<MessageId, TransportError> {
        (**self).send_or_edit_pinned(chat_id, previous, text).await
    }
}
