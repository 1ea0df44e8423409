use mukit_settings::SettingsError;

use crate::classifier::ClassifierError;

/// Errors raised while building an [`Engine`](crate::Engine).
///
/// Runtime failures never surface here: transport errors are logged and
/// recorded in chat status instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid category rules: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
}
