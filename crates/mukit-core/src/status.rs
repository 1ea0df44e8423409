use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ChatId;

/// Outcome of the most recent pin reconciliation for a chat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileResult {
    /// No reconciliation has run yet.
    #[default]
    Pending,
    Ok,
    Drifted,
    Error,
}

/// Read-only view of one chat, without exposing store contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatStatus {
    pub chat_id: ChatId,
    pub entries: usize,
    pub pinned: bool,
    pub last_render_at: Option<DateTime<Utc>>,
    pub last_reconcile: ReconcileResult,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ChatStatus {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            entries: 0,
            pinned: false,
            last_render_at: None,
            last_reconcile: ReconcileResult::Pending,
            last_reconcile_at: None,
            last_error: None,
        }
    }
}

/// Engine-wide status report consumed by the health surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineStatus {
    pub started_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Configured reconciliation interval, used to judge staleness.
    pub tick_interval_ms: u64,
    pub chats: Vec<ChatStatus>,
}

/// Anything that can report engine status. Implemented by the engine and by
/// test doubles in the server crate.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> EngineStatus;
}
