//! Incident journal: WARN and ERROR events kept in SQLite with the chat,
//! message, transport operation and error kind they concern, so failed
//! renders and pin checks can be looked up per chat after the fact.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS incidents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        at TEXT NOT NULL,
        level TEXT NOT NULL,
        chat_id INTEGER,
        message_id INTEGER,
        op TEXT,
        kind TEXT,
        category TEXT,
        summary TEXT NOT NULL,
        details TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_chat ON incidents(chat_id, id);
    CREATE INDEX IF NOT EXISTS idx_incidents_kind ON incidents(kind);
";

const COLUMNS: &str = "id, at, level, chat_id, message_id, op, kind, category, summary, details";

/// One persisted WARN or ERROR event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub level: String,
    pub chat_id: Option<i64>,
    /// Inbound message being handled when the event fired.
    pub message_id: Option<i64>,
    /// Transport operation, e.g. `send_text` or `current_pin`.
    pub op: Option<String>,
    /// Error classification, e.g. `rate_limited`.
    pub kind: Option<String>,
    pub category: Option<String>,
    pub summary: String,
    /// Remaining event fields as a JSON object.
    pub details: Option<String>,
}

impl Incident {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            at: row.get(1)?,
            level: row.get(2)?,
            chat_id: row.get(3)?,
            message_id: row.get(4)?,
            op: row.get(5)?,
            kind: row.get(6)?,
            category: row.get(7)?,
            summary: row.get(8)?,
            details: row.get(9)?,
        })
    }
}

/// Narrows [`IncidentJournal::recent`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct IncidentFilter {
    pub chat_id: Option<i64>,
    pub kind: Option<String>,
    pub op: Option<String>,
    pub errors_only: bool,
    /// Defaults to 50.
    pub limit: Option<u32>,
}

impl IncidentFilter {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id: Some(chat_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A row to be written; ids and the timestamp are filled in on insert.
#[derive(Debug, Default)]
struct NewIncident {
    level: String,
    chat_id: Option<i64>,
    message_id: Option<i64>,
    op: Option<String>,
    kind: Option<String>,
    category: Option<String>,
    summary: String,
    details: Option<String>,
}

pub struct IncidentJournal {
    conn: Mutex<Connection>,
}

impl IncidentJournal {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, at: DateTime<Utc>, incident: &NewIncident) -> rusqlite::Result<()> {
        let _ = self.conn.lock().execute(
            "INSERT INTO incidents (at, level, chat_id, message_id, op, kind, category, summary, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                at,
                incident.level,
                incident.chat_id,
                incident.message_id,
                incident.op,
                incident.kind,
                incident.category,
                incident.summary,
                incident.details,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, filter: &IncidentFilter) -> rusqlite::Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM incidents
             WHERE (?1 IS NULL OR chat_id = ?1)
               AND (?2 IS NULL OR kind = ?2)
               AND (?3 IS NULL OR op = ?3)
               AND (?4 = 0 OR level = 'ERROR')
             ORDER BY id DESC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.chat_id,
                filter.kind,
                filter.op,
                filter.errors_only,
                filter.limit.unwrap_or(50),
            ],
            Incident::from_row,
        )?;
        rows.collect()
    }

    /// Most recent incident for `chat_id`.
    pub fn last_for_chat(&self, chat_id: i64) -> rusqlite::Result<Option<Incident>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM incidents WHERE chat_id = ?1 ORDER BY id DESC LIMIT 1"),
            params![chat_id],
            Incident::from_row,
        )
        .optional()
    }

    /// Incident counts per error kind since `since`, most frequent first.
    /// Events without a kind are not counted.
    pub fn kinds_since(&self, since: DateTime<Utc>) -> rusqlite::Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) AS n FROM incidents
             WHERE kind IS NOT NULL AND at >= ?1
             GROUP BY kind ORDER BY n DESC, kind",
        )?;
        let rows = stmt.query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Delete incidents older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> rusqlite::Result<usize> {
        self.conn
            .lock()
            .execute("DELETE FROM incidents WHERE at < ?1", params![cutoff])
    }

    pub fn len(&self) -> rusqlite::Result<u64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))
    }

    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Chat and message ids recorded on a span, inherited by events inside it.
#[derive(Clone, Copy, Debug, Default)]
struct ChatScope {
    chat_id: Option<i64>,
    message_id: Option<i64>,
}

impl ChatScope {
    fn is_empty(self) -> bool {
        self.chat_id.is_none() && self.message_id.is_none()
    }
}

/// Sorts event fields into the journal's columns.
#[derive(Default)]
struct IncidentVisitor {
    scope: ChatScope,
    summary: Option<String>,
    op: Option<String>,
    kind: Option<String>,
    category: Option<String>,
    details: Map<String, Value>,
}

impl IncidentVisitor {
    fn put(&mut self, name: &str, value: Value) {
        let text = || match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match name {
            "message" => self.summary = Some(text()),
            "op" => self.op = Some(text()),
            "kind" => self.kind = Some(text()),
            "category" => self.category = Some(text()),
            "chat_id" => self.scope.chat_id = as_id(&value),
            "message_id" => self.scope.message_id = as_id(&value),
            _ => {
                let _ = self.details.insert(name.to_string(), value);
            }
        }
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim_matches('"').parse().ok(),
        _ => None,
    }
}

impl Visit for IncidentVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field.name(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), Value::Bool(value));
    }
}

/// `tracing` layer feeding WARN and ERROR events into an [`IncidentJournal`].
pub struct IncidentLayer {
    journal: Arc<IncidentJournal>,
}

impl IncidentLayer {
    pub fn new(journal: Arc<IncidentJournal>) -> Self {
        Self { journal }
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = IncidentVisitor::default();
        attrs.record(&mut visitor);
        if visitor.scope.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.scope);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = IncidentVisitor::default();
        event.record(&mut visitor);

        if let Some(spans) = ctx.event_scope(event) {
            for span in spans {
                let extensions = span.extensions();
                if let Some(outer) = extensions.get::<ChatScope>() {
                    visitor.scope.chat_id = visitor.scope.chat_id.or(outer.chat_id);
                    visitor.scope.message_id = visitor.scope.message_id.or(outer.message_id);
                }
            }
        }

        let incident = NewIncident {
            level: level.as_str().to_string(),
            chat_id: visitor.scope.chat_id,
            message_id: visitor.scope.message_id,
            op: visitor.op,
            kind: visitor.kind,
            category: visitor.category,
            summary: visitor.summary.unwrap_or_default(),
            details: (!visitor.details.is_empty()).then(|| Value::Object(visitor.details).to_string()),
        };
        if let Err(e) = self.journal.record(Utc::now(), &incident) {
            eprintln!("mukit-telemetry: failed to record incident: {e}");
        }
    }
}
