mod incidents;

pub use incidents::{Incident, IncidentFilter, IncidentJournal, IncidentLayer};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "mukit_telegram" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout instead of the human formatter.
    pub json: bool,
    /// Whether to keep warn+ events in the SQLite incident journal.
    pub log_to_sqlite: bool,
    /// Path to the incident journal.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: false,
            log_db_path: std::env::temp_dir().join("mukit-incidents.db"),
        }
    }
}

impl TelemetryConfig {
    fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.filter_directives()))
    }
}

/// Parse a level name as used in settings files. Unknown names fall back to INFO.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}

/// Keeps the incident journal reachable for the lifetime of the process.
pub struct TelemetryGuard {
    journal: Option<Arc<IncidentJournal>>,
}

impl TelemetryGuard {
    pub fn incidents(&self) -> Option<Arc<IncidentJournal>> {
        self.journal.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(config.env_filter())
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.env_filter())
    });

    let journal = if config.log_to_sqlite {
        match IncidentJournal::open(&config.log_db_path) {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                eprintln!("mukit-telemetry: failed to open incident journal: {e}");
                None
            }
        }
    } else {
        None
    };
    let incident_layer = journal.as_ref().map(|j| IncidentLayer::new(Arc::clone(j)));

    if let Err(e) = tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(incident_layer)
        .try_init()
    {
        eprintln!("mukit-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { journal }
}
