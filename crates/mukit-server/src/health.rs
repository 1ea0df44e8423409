//! `/healthz` evaluation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use mukit_core::EngineStatus;

/// Missed intervals tolerated before the ticker counts as stalled.
const STALE_AFTER_INTERVALS: i64 = 3;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when the reconciliation ticker has stalled.
    pub status: String,
    /// Seconds since the engine started.
    pub uptime_secs: u64,
    pub engine_responsive: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub chats: usize,
}

/// The ticker is responsive when it ticked within the last few intervals, or
/// when it has not had that long to tick since startup.
pub fn engine_responsive(status: &EngineStatus, now: DateTime<Utc>) -> bool {
    let interval_ms = i64::try_from(status.tick_interval_ms).unwrap_or(i64::MAX);
    let window = chrono::Duration::milliseconds(interval_ms.saturating_mul(STALE_AFTER_INTERVALS));
    let reference = status.last_tick_at.unwrap_or(status.started_at);
    now.signed_duration_since(reference) <= window
}

pub fn health_check(status: &EngineStatus, now: DateTime<Utc>) -> HealthResponse {
    let responsive = engine_responsive(status, now);
    HealthResponse {
        status: if responsive { "ok" } else { "degraded" }.into(),
        uptime_secs: u64::try_from(now.signed_duration_since(status.started_at).num_seconds()).unwrap_or(0),
        engine_responsive: responsive,
        last_tick_at: status.last_tick_at,
        chats: status.chats.len(),
    }
}
