use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS run_incidents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        severity INTEGER NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        request_id TEXT,
        conversation_id TEXT,
        call_index INTEGER,
        tool TEXT,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_request ON run_incidents(request_id, id);
    CREATE INDEX IF NOT EXISTS idx_incidents_conversation ON run_incidents(conversation_id, id);
    CREATE INDEX IF NOT EXISTS idx_incidents_logged_at ON run_incidents(logged_at);
";

const COLUMNS: &str =
    "id, logged_at, severity, target, message, request_id, conversation_id, call_index, tool, fields";

/// Severity of a persisted record. Only warnings and errors are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn = 1,
    Error = 2,
}

impl Severity {
    pub fn from_level(level: Level) -> Option<Self> {
        match level {
            Level::ERROR => Some(Self::Error),
            Level::WARN => Some(Self::Warn),
            _ => None,
        }
    }

    fn from_column(value: i64) -> Self {
        if value >= Self::Error as i64 {
            Self::Error
        } else {
            Self::Warn
        }
    }
}

/// A warning or error raised while serving a prompt, with the run it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub logged_at: DateTime<Utc>,
    pub severity: Severity,
    pub target: String,
    pub message: String,
    pub request_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Model call the event happened under, when inside one.
    pub call_index: Option<u32>,
    pub tool: Option<String>,
    pub fields: Option<Value>,
}

/// Filter for [`SqliteLogSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Defaults to warnings and above.
    pub min_severity: Option<Severity>,
    pub request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub tool: Option<String>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}

/// SQLite store of run incidents.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            // A missing directory surfaces as the open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert(&self, record: &NewRecord) -> Result<(), rusqlite::Error> {
        let fields = (!record.extra.is_empty())
            .then(|| serde_json::to_string(&record.extra).ok())
            .flatten();
        self.conn.lock().execute(
            "INSERT INTO run_incidents
                 (logged_at, severity, target, message, request_id, conversation_id, call_index, tool, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Utc::now().to_rfc3339(),
                record.severity as i64,
                record.target,
                record.message,
                record.run.request_id,
                record.run.conversation_id,
                record.run.call_index,
                record.run.tool,
                fields,
            ],
        )?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM run_incidents
             WHERE severity >= ?1
               AND (?2 IS NULL OR request_id = ?2)
               AND (?3 IS NULL OR conversation_id = ?3)
               AND (?4 IS NULL OR tool = ?4)
             ORDER BY id DESC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                q.min_severity.unwrap_or(Severity::Warn) as i64,
                q.request_id,
                q.conversation_id,
                q.tool,
                q.limit.unwrap_or(100),
            ],
            record_from_row,
        )?;
        rows.collect()
    }

    /// Everything one request logged, in the order it happened.
    pub fn request_log(&self, request_id: &str) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM run_incidents WHERE request_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([request_id], record_from_row)?;
        rows.collect()
    }

    /// Delete records older than `retention`. Returns how many were removed.
    pub fn prune_older_than(&self, retention: Duration) -> Result<usize, rusqlite::Error> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        self.conn
            .lock()
            .execute("DELETE FROM run_incidents WHERE logged_at < ?1", [cutoff.to_rfc3339()])
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM run_incidents", [], |row| row.get(0))
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let logged_at: String = row.get(1)?;
    let logged_at = DateTime::parse_from_rfc3339(&logged_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?;
    let fields: Option<String> = row.get(9)?;
    Ok(LogRecord {
        id: row.get(0)?,
        logged_at,
        severity: Severity::from_column(row.get(2)?),
        target: row.get(3)?,
        message: row.get(4)?,
        request_id: row.get(5)?,
        conversation_id: row.get(6)?,
        call_index: row.get(7)?,
        tool: row.get(8)?,
        fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
    })
}

struct NewRecord {
    severity: Severity,
    target: String,
    message: String,
    run: RunFields,
    extra: Map<String, Value>,
}

/// Correlation fields of a run, gathered from events and the spans around them.
#[derive(Clone, Debug, Default)]
struct RunFields {
    request_id: Option<String>,
    conversation_id: Option<String>,
    call_index: Option<u32>,
    tool: Option<String>,
}

impl RunFields {
    fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.conversation_id.is_none() && self.call_index.is_none() && self.tool.is_none()
    }

    /// Returns false when `name` is not a run field.
    fn set_text(&mut self, name: &str, value: &str) -> bool {
        let value = value.trim_matches('"');
        let slot = match name {
            "request_id" => &mut self.request_id,
            "conversation_id" => &mut self.conversation_id,
            "tool" => &mut self.tool,
            "call_index" => {
                self.call_index = value.parse().ok();
                return true;
            }
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }

    fn set_number(&mut self, name: &str, value: u64) -> bool {
        if name != "call_index" {
            return false;
        }
        self.call_index = u32::try_from(value).ok();
        true
    }

    /// Values recorded later on the same span replace earlier ones.
    fn merge(&mut self, later: RunFields) {
        self.request_id = later.request_id.or(self.request_id.take());
        self.conversation_id = later.conversation_id.or(self.conversation_id.take());
        self.call_index = later.call_index.or(self.call_index);
        self.tool = later.tool.or(self.tool.take());
    }

    /// Fill gaps from an enclosing span.
    fn inherit(&mut self, outer: &RunFields) {
        if self.request_id.is_none() {
            self.request_id.clone_from(&outer.request_id);
        }
        if self.conversation_id.is_none() {
            self.conversation_id.clone_from(&outer.conversation_id);
        }
        if self.call_index.is_none() {
            self.call_index = outer.call_index;
        }
        if self.tool.is_none() {
            self.tool.clone_from(&outer.tool);
        }
    }
}

impl Visit for RunFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set_text(field.name(), &format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set_text(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set_number(field.name(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if let Ok(value) = u64::try_from(value) {
            self.set_number(field.name(), value);
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    run: RunFields,
    extra: Map<String, Value>,
}

impl EventVisitor {
    fn text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            name => {
                if !self.run.set_text(name, &value) {
                    self.extra.insert(name.to_string(), Value::String(value));
                }
            }
        }
    }
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if !self.run.set_number(field.name(), value) {
            self.extra.insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.extra.insert(field.name().to_string(), Value::Number(n));
        }
    }
}

/// Layer that persists warnings and errors together with the request,
/// conversation, model call and tool they happened under.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = RunFields::default();
        attrs.record(&mut fields);
        if fields.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields);
        }
    }

    // conversation_id is recorded on the prompt span once the request is validated.
    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut update = RunFields::default();
        values.record(&mut update);
        if update.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<RunFields>() {
            Some(existing) => existing.merge(update),
            None => extensions.insert(update),
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(severity) = Severity::from_level(*event.metadata().level()) else {
            return;
        };
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<RunFields>() {
                    visitor.run.inherit(outer);
                }
            }
        }

        let record = NewRecord {
            severity,
            target: event.metadata().target().to_string(),
            message: visitor.message,
            run: visitor.run,
            extra: visitor.extra,
        };
        if let Err(e) = self.sink.insert(&record) {
            eprintln!("recall-telemetry: failed to persist log record: {e}");
        }
    }
}
