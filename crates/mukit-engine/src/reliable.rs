use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use mukit_core::{ChatId, ChatTransport, MessageId, TransportError};
use mukit_settings::RetrySettings;

/// Retry and timeout policy for transport calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Applied to every individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn from_settings(retry: &RetrySettings, call_timeout_ms: u64) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter_factor: retry.jitter_factor.clamp(0.0, 1.0),
            call_timeout: Duration::from_millis(call_timeout_ms),
        }
    }
}

/// Wraps a [`ChatTransport`] with per-call timeouts and retries.
///
/// - Each attempt is bounded by `call_timeout`; elapsing is a retryable error
/// - Retryable errors back off exponentially with jitter
/// - `retry_after` hints from rate limiting replace the computed delay, up to `max_delay`
/// - Fatal errors are returned immediately
///
/// Only the primitive calls are wrapped. `send_or_edit_pinned` keeps its
/// provided implementation and so retries each step separately.
pub struct ReliableTransport<T: ChatTransport> {
    inner: T,
    config: RetryConfig,
    total_retries: Arc<AtomicU64>,
}

impl<T: ChatTransport> ReliableTransport<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Delay before retry number `attempt + 1`.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        #[allow(clippy::cast_precision_loss)]
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    async fn call<R, F, Fut>(&self, op: &'static str, chat_id: ChatId, mut attempt_fn: F) -> Result<R, TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<R, TransportError>> + Send,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.call_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.call_timeout)),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_fatal() || attempt >= self.config.max_retries {
                return Err(err);
            }

            let delay = self.retry_delay(attempt, err.suggested_delay());
            let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);

            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = delay.as_millis() as u64;
            warn!(
                op,
                chat_id = chat_id.get(),
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms,
                kind = err.error_kind(),
                error = %err,
                "retrying transport call"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<T: ChatTransport> ChatTransport for ReliableTransport<T> {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, TransportError> {
        self.call("send_text", chat_id, || self.inner.send_text(chat_id, text)).await
    }

    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), TransportError> {
        self.call("edit_text", chat_id, || self.inner.edit_text(chat_id, message_id, text))
            .await
    }

    async fn pin_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.call("pin_message", chat_id, || self.inner.pin_message(chat_id, message_id))
            .await
    }

    async fn current_pin(&self, chat_id: ChatId) -> Result<Option<MessageId>, TransportError> {
        self.call("current_pin", chat_id, || self.inner.current_pin(chat_id)).await
    }

    async fn remove_pinned(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.call("remove_pinned", chat_id, || self.inner.remove_pinned(chat_id, message_id))
            .await
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        self.call("delete_message", chat_id, || self.inner.delete_message(chat_id, message_id))
            .await
    }
}
