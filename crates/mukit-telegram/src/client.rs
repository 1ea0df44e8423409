//! Telegram Bot API client.
//!
//! Every method is a JSON `POST` to `{api_base}/bot{token}/{method}`. Replies
//! are unwrapped from the `{ok, result}` envelope; error envelopes become
//! [`TelegramError::Api`] so the status code and `retry_after` survive.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use mukit_core::{ChatId, ChatTransport, MessageId, TransportError};
use mukit_settings::TelegramSettings;

use crate::error::TelegramError;
use crate::types::{ApiResponse, Chat, Message, Update, User};

/// Timeout for ordinary calls. Long polls add their own poll window on top.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: SecretString,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(token: SecretString, api_base: impl Into<String>) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TelegramError::Client(e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_settings(settings: &TelegramSettings) -> Result<Self, TelegramError> {
        let token = settings
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(TelegramError::MissingToken)?;
        let client = Self::new(SecretString::from(token.to_string()), settings.api_base.clone())?;
        info!(api_base = %client.api_base, "telegram client initialized");
        Ok(client)
    }

    async fn call<T, B>(&self, method: &str, body: &B, timeout: Duration) -> Result<T, TelegramError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        let url = format!("{}/bot{}/{}", self.api_base, self.token.expose_secret(), method);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(TelegramError::http)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(TelegramError::http)?;
        let envelope: ApiResponse<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(TelegramError::Api {
                    code: status.as_u16(),
                    description: String::from_utf8_lossy(&bytes).into_owned(),
                    retry_after: None,
                });
            }
            Err(e) => return Err(TelegramError::Decode(format!("{method}: {e}"))),
        };

        if envelope.ok {
            envelope
                .result
                .ok_or_else(|| TelegramError::Decode(format!("{method}: missing result")))
        } else {
            Err(TelegramError::Api {
                code: envelope.error_code.unwrap_or_else(|| status.as_u16()),
                description: envelope.description.unwrap_or_default(),
                retry_after: envelope.parameters.and_then(|p| p.retry_after),
            })
        }
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), REQUEST_TIMEOUT).await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: Option<i64>, poll_timeout: Duration) -> Result<Vec<Update>, TelegramError> {
        let mut body = json!({
            "timeout": poll_timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", &body, poll_timeout + REQUEST_TIMEOUT).await
    }

    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<Message, TelegramError> {
        let body = json!({ "chat_id": chat_id.get(), "text": text });
        self.call("sendMessage", &body, REQUEST_TIMEOUT).await
    }

    pub async fn edit_message_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TelegramError> {
        let body = json!({ "chat_id": chat_id.get(), "message_id": message_id.get(), "text": text });
        // The result is the edited message; only success matters.
        let _: serde_json::Value = self.call("editMessageText", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn pin_chat_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TelegramError> {
        let body = json!({
            "chat_id": chat_id.get(),
            "message_id": message_id.get(),
            "disable_notification": true,
        });
        let _: bool = self.call("pinChatMessage", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn unpin_chat_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TelegramError> {
        let body = json!({ "chat_id": chat_id.get(), "message_id": message_id.get() });
        let _: bool = self.call("unpinChatMessage", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TelegramError> {
        let body = json!({ "chat_id": chat_id.get(), "message_id": message_id.get() });
        let _: bool = self.call("deleteMessage", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn get_chat(&self, chat_id: ChatId) -> Result<Chat, TelegramError> {
        self.call("getChat", &json!({ "chat_id": chat_id.get() }), REQUEST_TIMEOUT)
            .await
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, TransportError> {
        let sent = self.send_message(chat_id, text).await?;
        Ok(MessageId::new(sent.message_id))
    }

    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TransportError> {
        match self.edit_message_text(chat_id, message_id, text).await {
            Err(e) if e.is_not_modified() => {
                debug!(chat_id = chat_id.get(), message_id = message_id.get(), "summary unchanged");
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(()) => Ok(()),
        }
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.pin_chat_message(chat_id, message_id).await?;
        Ok(())
    }

    async fn current_pin(&self, chat_id: ChatId) -> Result<Option<MessageId>, TransportError> {
        let chat = self.get_chat(chat_id).await?;
        Ok(chat.pinned_message.map(|m| MessageId::new(m.message_id)))
    }

    async fn remove_pinned(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        if let Err(e) = self.unpin_chat_message(chat_id, message_id).await {
            if e.is_retryable() {
                return Err(e.into());
            }
            debug!(chat_id = chat_id.get(), error = %e, "unpin failed, deleting anyway");
        }
        self.delete_message(chat_id, message_id).await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        TelegramClient::delete_message(self, chat_id, message_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use mukit_engine::{ReliableTransport, RetryConfig};

    use super::*;

    const TOKEN: &str = "123:abc";
    const CHAT: ChatId = ChatId::new(-1001);

    fn client(server: &MockServer) -> TelegramClient {
        TelegramClient::new(SecretString::from(TOKEN.to_string()), server.uri()).unwrap()
    }

    fn api_path(method: &str) -> String {
        format!("/bot{TOKEN}/{method}")
    }

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": result }))
    }

    fn message(id: i64) -> Value {
        json!({ "message_id": id, "chat": { "id": CHAT.get() }, "date": 0 })
    }

    async fn mount(server: &MockServer, api_method: &str, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(api_path(api_method)))
            .respond_with(response)
            .mount(server)
            .await;
    }

    async fn called(server: &MockServer, api_method: &str) -> usize {
        let wanted = api_path(api_method);
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == wanted)
            .count()
    }

    #[tokio::test]
    async fn fresh_summary_is_sent_and_pinned() {
        let server = MockServer::start().await;
        mount(&server, "sendMessage", ok(message(77))).await;
        mount(&server, "pinChatMessage", ok(json!(true))).await;

        let id = client(&server).send_or_edit_pinned(CHAT, None, "=food=\n08:00 toast").await.unwrap();
        assert_eq!(id, MessageId::new(77));
        assert_eq!(called(&server, "pinChatMessage").await, 1);
    }

    #[tokio::test]
    async fn existing_summary_is_edited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api_path("editMessageText")))
            .and(body_partial_json(json!({ "message_id": 5, "text": "new" })))
            .respond_with(ok(message(5)))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server)
            .send_or_edit_pinned(CHAT, Some(MessageId::new(5)), "new")
            .await
            .unwrap();
        assert_eq!(id, MessageId::new(5));
        assert_eq!(called(&server, "sendMessage").await, 0);
    }

    #[tokio::test]
    async fn unchanged_edit_counts_as_success() {
        let server = MockServer::start().await;
        mount(
            &server,
            "editMessageText",
            ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: message is not modified"
            })),
        )
        .await;

        let id = client(&server)
            .send_or_edit_pinned(CHAT, Some(MessageId::new(5)), "same")
            .await
            .unwrap();
        assert_eq!(id, MessageId::new(5));
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_new_message() {
        let server = MockServer::start().await;
        mount(
            &server,
            "editMessageText",
            ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: message to edit not found"
            })),
        )
        .await;
        mount(&server, "sendMessage", ok(message(9))).await;
        mount(&server, "pinChatMessage", ok(json!(true))).await;

        let id = client(&server)
            .send_or_edit_pinned(CHAT, Some(MessageId::new(5)), "text")
            .await
            .unwrap();
        assert_eq!(id, MessageId::new(9));
    }

    #[tokio::test]
    async fn pin_failure_retries_pin_only() {
        let server = MockServer::start().await;
        mount(&server, "sendMessage", ok(message(77))).await;
        Mock::given(method("POST"))
            .and(path(api_path("pinChatMessage")))
            .respond_with(ResponseTemplate::new(502).set_body_json(json!({
                "ok": false,
                "error_code": 502,
                "description": "Bad Gateway"
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api_path("pinChatMessage")))
            .and(body_partial_json(json!({ "message_id": 77 })))
            .respond_with(ok(json!(true)))
            .mount(&server)
            .await;

        let config = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
            call_timeout: Duration::from_secs(5),
        };
        let reliable = ReliableTransport::new(client(&server), config);
        let id = reliable.send_or_edit_pinned(CHAT, None, "=food=\n08:00 toast").await.unwrap();

        assert_eq!(id, MessageId::new(77));
        assert_eq!(called(&server, "sendMessage").await, 1);
        assert_eq!(called(&server, "pinChatMessage").await, 2);
        assert_eq!(called(&server, "deleteMessage").await, 0);
    }

    #[tokio::test]
    async fn current_pin_reads_get_chat() {
        let server = MockServer::start().await;
        mount(
            &server,
            "getChat",
            ok(json!({ "id": CHAT.get(), "pinned_message": message(41) })),
        )
        .await;
        assert_eq!(client(&server).current_pin(CHAT).await.unwrap(), Some(MessageId::new(41)));
    }

    #[tokio::test]
    async fn no_pin_reported_as_none() {
        let server = MockServer::start().await;
        mount(&server, "getChat", ok(json!({ "id": CHAT.get() }))).await;
        assert_eq!(client(&server).current_pin(CHAT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_retryable() {
        let server = MockServer::start().await;
        mount(
            &server,
            "getChat",
            ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 2",
                "parameters": { "retry_after": 2 }
            })),
        )
        .await;

        let err = client(&server).current_pin(CHAT).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn non_json_error_uses_http_status() {
        let server = MockServer::start().await;
        mount(&server, "getChat", ResponseTemplate::new(502).set_body_string("Bad Gateway")).await;
        let err = client(&server).current_pin(CHAT).await.unwrap_err();
        assert!(matches!(err, TransportError::ServerError { status: 502, .. }));
    }

    #[tokio::test]
    async fn remove_pinned_unpins_then_deletes() {
        let server = MockServer::start().await;
        mount(&server, "unpinChatMessage", ok(json!(true))).await;
        mount(&server, "deleteMessage", ok(json!(true))).await;

        client(&server).remove_pinned(CHAT, MessageId::new(3)).await.unwrap();
        assert_eq!(called(&server, "unpinChatMessage").await, 1);
        assert_eq!(called(&server, "deleteMessage").await, 1);
    }

    #[tokio::test]
    async fn error_text_does_not_leak_token() {
        let client = TelegramClient::new(SecretString::from(TOKEN.to_string()), "http://127.0.0.1:1").unwrap();
        let err = client.get_me().await.unwrap_err();
        assert!(!err.to_string().contains(TOKEN));
        assert!(!format!("{client:?}").contains(TOKEN));
    }

    #[test]
    fn missing_token_rejected() {
        let settings = TelegramSettings::default();
        assert!(matches!(
            TelegramClient::from_settings(&settings),
            Err(TelegramError::MissingToken)
        ));
    }
}
