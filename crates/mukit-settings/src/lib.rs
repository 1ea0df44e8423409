//! # mukit-settings
//!
//! Layered configuration for the Mukit bot.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MukitSettings::default()`]
//! 2. **User file**: `~/.mukit/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `MUKIT_*` and `BOT_TOKEN` overrides (highest priority)
//!
//! The category rule table lives here so it can be replaced without touching
//! engine code. Arrays are replaced wholesale by the merge, so a user file that
//! sets `categories.rules` defines the complete taxonomy.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, mukit_home, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = MukitSettings::default();
        assert_eq!(settings.name, "mukit");
        assert_eq!(settings.engine.tick_interval_ms, 5_000);
        assert_eq!(settings.engine.transport_timeout_ms, 10_000);
        assert_eq!(settings.engine.timezone, "UTC");
        assert!(settings.engine.delete_directives);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.categories.fallback, "misc");
        assert!(!settings.categories.rules.is_empty());
        assert_eq!(settings.server.port, 8080);
        assert!(settings.telegram.bot_token.is_none());
    }

    #[test]
    fn deep_merge_re_exported() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"y": 2});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
