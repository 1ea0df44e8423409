//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format and `#[serde(default)]` so partial files are accepted.

mod categories;
mod server;

pub use categories::*;
pub use server::*;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "telegram": { "botToken": "123:abc" },
///   "engine": { "timezone": "Europe/Moscow" },
///   "categories": { "fallback": "other", "rules": [] }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MukitSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    pub telegram: TelegramSettings,
    pub engine: EngineSettings,
    pub retry: RetrySettings,
    pub categories: CategorySettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Default for MukitSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "mukit".to_string(),
            telegram: TelegramSettings::default(),
            engine: EngineSettings::default(),
            retry: RetrySettings::default(),
            categories: CategorySettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl MukitSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let _ = self.engine.tz()?;
        self.categories.validate()?;
        if self.engine.empty_placeholder.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "engine.emptyPlaceholder must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Summary engine behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Interval between pin reconciliation sweeps.
    pub tick_interval_ms: u64,
    /// Per-call timeout for transport requests.
    pub transport_timeout_ms: u64,
    /// IANA timezone used when a directive carries no explicit time.
    pub timezone: String,
    /// Delete directive messages once they are merged into the summary.
    pub delete_directives: bool,
    /// Text of the pinned message when the summary has no entries.
    pub empty_placeholder: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            transport_timeout_ms: 10_000,
            timezone: "UTC".to_string(),
            delete_directives: true,
            empty_placeholder: "(summary is empty)".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| SettingsError::InvalidValue(format!("unknown timezone {}", self.timezone)))
    }
}

/// Retry configuration for transport calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0–1.0) applied to retry delays.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`). `RUST_LOG` wins.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    /// Log database path, relative to `~/.mukit` unless absolute.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
        }
    }
}
