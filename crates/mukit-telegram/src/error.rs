use std::time::Duration;

use mukit_core::TransportError;

/// Bot API client errors.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("bot token is not configured")]
    MissingToken,
    #[error("failed to build http client: {0}")]
    Client(String),
    /// Always constructed without the request URL, which embeds the token.
    #[error("request failed: {0}")]
    Http(reqwest::Error),
    #[error("telegram api error {code}: {description}")]
    Api {
        code: u16,
        description: String,
        retry_after: Option<u64>,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl TelegramError {
    pub(crate) fn http(err: reqwest::Error) -> Self {
        Self::Http(err.without_url())
    }

    /// Editing a message to its current text. Harmless.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::Api { description, .. } if description.contains("message is not modified"))
    }

    pub fn is_retryable(&self) -> bool {
        TransportError::from(self).is_retryable()
    }
}

impl From<&TelegramError> for TransportError {
    fn from(err: &TelegramError) -> Self {
        match err {
            TelegramError::MissingToken => Self::Unauthorized(err.to_string()),
            TelegramError::Client(msg) | TelegramError::Decode(msg) => Self::Rejected(msg.clone()),
            TelegramError::Http(e) => match e.status() {
                Some(status) => Self::from_status(status.as_u16(), e.to_string()),
                None => Self::Network(e.to_string()),
            },
            TelegramError::Api {
                code: 429, retry_after, ..
            } => Self::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            },
            TelegramError::Api { code, description, .. } => Self::from_status(*code, description.clone()),
        }
    }
}

impl From<TelegramError> for TransportError {
    fn from(err: TelegramError) -> Self {
        Self::from(&err)
    }
}
