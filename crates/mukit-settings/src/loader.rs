//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MukitSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MukitSettings;

/// Directory holding the settings file and the log database (`~/.mukit`).
pub fn mukit_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".mukit")
}

/// Resolve the path to the settings file (`~/.mukit/settings.json`).
pub fn settings_path() -> PathBuf {
    mukit_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MukitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a settings value that
/// fails validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<MukitSettings> {
    let defaults = serde_json::to_value(MukitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MukitSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut MukitSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are ignored with a warning.
pub fn apply_overrides(settings: &mut MukitSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Telegram ────────────────────────────────────────────────────
    if let Some(v) = env.string("MUKIT_BOT_TOKEN").or_else(|| env.string("BOT_TOKEN")) {
        settings.telegram.bot_token = Some(v);
    }
    if let Some(v) = env.string("MUKIT_TELEGRAM_API") {
        settings.telegram.api_base = v;
    }

    // ── Engine ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("MUKIT_TICK_INTERVAL_MS", 100, 3_600_000) {
        settings.engine.tick_interval_ms = v;
    }
    if let Some(v) = env.u64("MUKIT_TRANSPORT_TIMEOUT_MS", 100, 600_000) {
        settings.engine.transport_timeout_ms = v;
    }
    if let Some(v) = env.string("MUKIT_TIMEZONE") {
        settings.engine.timezone = v;
    }
    if let Some(v) = env.bool("MUKIT_DELETE_DIRECTIVES") {
        settings.engine.delete_directives = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("MUKIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("MUKIT_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("MUKIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::errors::SettingsError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"rules": [1, 2, 3]});
        let source = serde_json::json!({"rules": [4]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["rules"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.categories.fallback, "misc");
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "engine": {{"timezone": "Asia/Tokyo"}},
                "categories": {{"rules": [{{"label": "pets", "patterns": ["dog"]}}]}}
            }}"#
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.engine.timezone, "Asia/Tokyo");
        assert_eq!(settings.engine.tick_interval_ms, 5_000);
        assert_eq!(settings.categories.rules.len(), 1);
        assert_eq!(settings.categories.rules[0].label, "pets");
        assert_eq!(settings.categories.fallback, "misc");
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_rule_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"categories": {"rules": [{"label": "", "patterns": ["x"]}]}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn bot_token_from_legacy_name() {
        let mut settings = MukitSettings::default();
        apply_overrides(&mut settings, lookup(&[("BOT_TOKEN", "1:a")]));
        assert_eq!(settings.telegram.bot_token.as_deref(), Some("1:a"));
    }

    #[test]
    fn prefixed_token_wins() {
        let mut settings = MukitSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[("BOT_TOKEN", "1:a"), ("MUKIT_BOT_TOKEN", "2:b")]),
        );
        assert_eq!(settings.telegram.bot_token.as_deref(), Some("2:b"));
    }

    #[test]
    fn numeric_overrides_respect_range() {
        let mut settings = MukitSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[("MUKIT_PORT", "0"), ("MUKIT_TICK_INTERVAL_MS", "2500")]),
        );
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.engine.tick_interval_ms, 2500);
    }

    #[test]
    fn bool_override() {
        let mut settings = MukitSettings::default();
        apply_overrides(&mut settings, lookup(&[("MUKIT_DELETE_DIRECTIVES", "off")]));
        assert!(!settings.engine.delete_directives);
    }

    #[test]
    fn empty_string_ignored() {
        let mut settings = MukitSettings::default();
        apply_overrides(&mut settings, lookup(&[("MUKIT_TIMEZONE", "")]));
        assert_eq!(settings.engine.timezone, "UTC");
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("99", 100, 200), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
    }
}
