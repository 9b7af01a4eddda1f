//! Ledger: the append-only, crash-tolerant store of steps and variable
//! snapshots that makes "time-travel" history queries possible after the
//! fact (spec.md §4.4).
//!
//! The teacher has no persistence layer of its own — a single-session DAP
//! adapter has nothing to remember between messages — so this module is
//! grounded in the pack's general practice of backing a local durable store
//! with `rusqlite` (see DESIGN.md) rather than in any one teacher file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{BridgeError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_steps INTEGER NOT NULL DEFAULT 0,
    breakpoints_hit INTEGER NOT NULL DEFAULT 0,
    exceptions_thrown INTEGER NOT NULL DEFAULT 0,
    summary_md TEXT
);

CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    function TEXT,
    reason TEXT NOT NULL,
    UNIQUE(session_id, step_number)
);

CREATE TABLE IF NOT EXISTS variables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    name TEXT NOT NULL,
    value_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_variables_history
    ON variables(session_id, name, step_number DESC);
";

#[derive(Debug, Clone, PartialEq)]
pub struct StepLocation {
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_steps: u32,
    pub breakpoints_hit: u32,
    pub exceptions_thrown: u32,
    pub summary_md: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub step: u32,
    pub value: Value,
    pub location: StepLocation,
    pub timestamp: DateTime<Utc>,
}

pub struct Ledger {
    conn: Mutex<Connection>,
    data_dir: PathBuf,
}

impl Ledger {
    /// Open (creating if absent) `<data_dir>/sessions.db` with a durable
    /// journal mode, per spec.md §9.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("sessions.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn init_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, started_at, total_steps, breakpoints_hit, exceptions_thrown)
             VALUES (?1, ?2, 0, 0, 0)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record_step(&self, session_id: &str, step_number: u32, location: &StepLocation, function: Option<&str>, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        {
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO steps (session_id, step_number, timestamp, file, line, function, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            stmt.execute(params![session_id, step_number, now, location.file, location.line, function, reason])?;
        }

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM steps WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        let hit_column = if reason == "exception" { "exceptions_thrown" } else { "breakpoints_hit" };
        conn.execute(
            &format!("UPDATE sessions SET total_steps = ?2, {hit_column} = {hit_column} + 1 WHERE id = ?1"),
            params![session_id, total],
        )?;
        Ok(())
    }

    pub fn record_variable(&self, session_id: &str, step_number: u32, location: &StepLocation, name: &str, value: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO variables (session_id, step_number, timestamp, file, line, name, value_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
            session_id,
            step_number,
            Utc::now().to_rfc3339(),
            location.file,
            location.line,
            name,
            safe_stringify(value),
        ])?;
        Ok(())
    }

    pub fn get_variable_history(&self, session_id: &str, name: &str, from_step: u32, limit: u32) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT step_number, timestamp, file, line, value_json FROM variables
             WHERE session_id = ?1 AND name = ?2 AND step_number <= ?3
             ORDER BY step_number DESC LIMIT ?4",
        )?;

        let rows = stmt.query_map(params![session_id, name, from_step, limit], |row| {
            let step: i64 = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let file: String = row.get(2)?;
            let line: i64 = row.get(3)?;
            let raw: String = row.get(4)?;
            Ok((step, timestamp, file, line, raw))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (step, timestamp, file, line, raw) = row?;
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            entries.push(HistoryEntry {
                step: step as u32,
                value,
                location: StepLocation { file, line: line as u32 },
                timestamp,
            });
        }
        Ok(entries)
    }

    pub fn finalize_session(&self, session_id: &str) -> Result<String> {
        let header = self.session_header(session_id)?.ok_or_else(|| {
            BridgeError::Unknown(format!("no ledger session header for {session_id}"))
        })?;
        let steps = self.all_steps(session_id)?;
        let distinct_variables = self.distinct_variable_names(session_id)?;

        let summary = render_summary(&header, &steps, &distinct_variables);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET ended_at = ?2, summary_md = ?3 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339(), summary],
        )?;
        drop(conn);

        let file_name = format!("session_{}_summary.md", &session_id[..session_id.len().min(8)]);
        std::fs::write(self.data_dir.join(file_name), &summary)?;

        Ok(summary)
    }

    pub fn session_header(&self, session_id: &str) -> Result<Option<SessionHeader>> {
        let conn = self.conn.lock().unwrap();
        let header = conn
            .query_row(
                "SELECT id, started_at, ended_at, total_steps, breakpoints_hit, exceptions_thrown, summary_md
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    let started_at: String = row.get(1)?;
                    let ended_at: Option<String> = row.get(2)?;
                    Ok(SessionHeader {
                        id: row.get(0)?,
                        started_at: parse_rfc3339(&started_at),
                        ended_at: ended_at.map(|s| parse_rfc3339(&s)),
                        total_steps: row.get::<_, i64>(3)? as u32,
                        breakpoints_hit: row.get::<_, i64>(4)? as u32,
                        exceptions_thrown: row.get::<_, i64>(5)? as u32,
                        summary_md: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(header)
    }

    fn all_steps(&self, session_id: &str) -> Result<Vec<(u32, String, u32, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT step_number, file, line, reason FROM steps WHERE session_id = ?1 ORDER BY step_number ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? as u32,
                row.get::<_, String>(3)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(BridgeError::from)
    }

    fn distinct_variable_names(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT name FROM variables WHERE session_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(BridgeError::from)
    }

    /// Idempotent; closing an already-closed ledger is a no-op.
    pub fn close(&self) {
        // rusqlite::Connection closes on drop; nothing else to flush given
        // WAL mode and prepared-statement reuse above.
    }
}

fn parse_rfc3339(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Serialize a structured value for storage. Must never fail: large
/// integers are kept as decimal strings by the codec before they ever reach
/// here, error-shaped objects (an object with both a `message` and a `name`
/// or `classname` key) are flattened to `{name, message}`, and any
/// unexpected serialization failure falls back to a fixed error payload.
pub fn safe_stringify(value: &Value) -> String {
    let flattened = flatten_error_shaped(value);
    serde_json::to_string(&flattened).unwrap_or_else(|_| r#"{"error":"Failed to serialize value"}"#.to_string())
}

fn flatten_error_shaped(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let message = map.get("message").and_then(Value::as_str);
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| map.get("classname").and_then(Value::as_str));

    match (name, message) {
        (Some(name), Some(message)) => serde_json::json!({ "name": name, "message": message }),
        _ => value.clone(),
    }
}

fn render_summary(header: &SessionHeader, steps: &[(u32, String, u32, String)], variables: &[String]) -> String {
    use std::fmt::Write;

    let duration = header
        .ended_at
        .map(|end| end.signed_duration_since(header.started_at))
        .unwrap_or_else(|| Utc::now().signed_duration_since(header.started_at));

    let mut out = String::new();
    let _ = writeln!(out, "# Debug session {}", header.id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Started: {}", header.started_at.to_rfc3339());
    let _ = writeln!(out, "- Duration: {}s", duration.num_seconds());
    let _ = writeln!(out);
    let _ = writeln!(out, "| Metric | Count |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Total steps | {} |", header.total_steps);
    let _ = writeln!(out, "| Breakpoints hit | {} |", header.breakpoints_hit);
    let _ = writeln!(out, "| Exceptions thrown | {} |", header.exceptions_thrown);
    let _ = writeln!(out, "| Distinct variables inspected | {} |", variables.len());
    let _ = writeln!(out);
    let _ = writeln!(out, "## Execution path");
    let _ = writeln!(out, "```");
    for (step, file, line, reason) in steps.iter().take(50) {
        let _ = writeln!(out, "{step}. {file}:{line} ({reason})");
    }
    if steps.len() > 50 {
        let _ = writeln!(out, "... and {} more steps", steps.len() - 50);
    }
    let _ = writeln!(out, "```");
    let _ = writeln!(out);
    let _ = writeln!(out, "## Inspected variables");
    for name in variables {
        let _ = writeln!(out, "- {name}");
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_and_record_roundtrip() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger.init_session("s1").unwrap();

        let loc = StepLocation { file: "app/x.php".to_string(), line: 42 };
        ledger.record_step("s1", 1, &loc, Some("main"), "breakpoint_hit").unwrap();
        ledger.record_variable("s1", 1, &loc, "$i", &serde_json::json!(1)).unwrap();

        let header = ledger.session_header("s1").unwrap().unwrap();
        assert_eq!(header.total_steps, 1);
        assert_eq!(header.breakpoints_hit, 1);
        assert_eq!(header.exceptions_thrown, 0);
    }

    #[test]
    fn total_steps_equals_breakpoints_plus_exceptions() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger.init_session("s1").unwrap();
        let loc = StepLocation { file: "a.php".to_string(), line: 1 };
        ledger.record_step("s1", 1, &loc, None, "breakpoint_hit").unwrap();
        ledger.record_step("s1", 2, &loc, None, "exception").unwrap();
        ledger.record_step("s1", 3, &loc, None, "step_complete").unwrap();

        let header = ledger.session_header("s1").unwrap().unwrap();
        assert_eq!(header.total_steps, 3);
        assert_eq!(header.breakpoints_hit + header.exceptions_thrown, header.total_steps);
    }

    #[test]
    fn history_returns_entries_descending_up_to_from_step() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger.init_session("s1").unwrap();
        let loc = StepLocation { file: "a.php".to_string(), line: 1 };
        for step in 1..=3u32 {
            ledger.record_variable("s1", step, &loc, "$state", &serde_json::json!({"step": step})).unwrap();
        }

        let history = ledger.get_variable_history("s1", "$state", 3, 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].step, 3);
        assert_eq!(history[1].step, 2);
        assert_eq!(history[2].step, 1);
        assert_eq!(history[0].value, serde_json::json!({"step": 3}));

        let history = ledger.get_variable_history("s1", "$state", 1, 5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step, 1);
    }

    #[test]
    fn malformed_json_falls_back_to_raw_string() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger.init_session("s1").unwrap();
        let loc = StepLocation { file: "a.php".to_string(), line: 1 };
        {
            let conn = ledger.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO variables (session_id, step_number, timestamp, file, line, name, value_json) VALUES (?1, 1, ?2, ?3, 1, '$x', 'not json')",
                params!["s1", Utc::now().to_rfc3339(), loc.file],
            ).unwrap();
        }
        let history = ledger.get_variable_history("s1", "$x", 1, 1).unwrap();
        assert_eq!(history[0].value, Value::String("not json".to_string()));
    }

    #[test]
    fn safe_stringify_flattens_error_shaped_object() {
        let value = serde_json::json!({"classname": "RuntimeException", "message": "boom", "trace": "..."});
        assert_eq!(safe_stringify(&value), r#"{"message":"boom","name":"RuntimeException"}"#);
    }

    #[test]
    fn finalize_writes_summary_file_and_caps_steps() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger.init_session("s1").unwrap();
        let loc = StepLocation { file: "a.php".to_string(), line: 1 };
        for step in 1..=55u32 {
            ledger.record_step("s1", step, &loc, None, "breakpoint_hit").unwrap();
        }

        let summary = ledger.finalize_session("s1").unwrap();
        assert!(summary.contains("... and 5 more steps"));

        let header = ledger.session_header("s1").unwrap().unwrap();
        assert!(header.ended_at.is_some());
        assert!(header.summary_md.is_some());

        let path = dir.path().join("session_s1_summary.md");
        assert!(path.exists());
    }
}
