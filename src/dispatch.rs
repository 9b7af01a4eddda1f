//! Tool Dispatch: thin contract translation between the agent-facing tool
//! calls of spec.md §6 and the Session Runtime (spec.md §4's "Tool Dispatch"
//! component). The agent-facing transport itself (how a request physically
//! reaches this crate) is out of scope — this module only shapes JSON in and
//! JSON out.
//!
//! Grounded in the teacher's `GenericRequest::into_specialized` /
//! `TryFrom<serde_json::Value>` pattern: a generic envelope is deserialized
//! into a typed argument struct per tool, and a typed outcome is serialized
//! back into the envelope shape the agent expects.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::BridgeError;
use crate::link::PauseReasonKind;
use crate::runtime::{
    Breakpoint, ControlAction, Inspection, Location, PauseReason, Session, SessionRuntime,
    SessionStatus,
};

/// Dispatches the six agent-facing tools onto a `SessionRuntime`.
pub struct Dispatcher {
    runtime: Arc<SessionRuntime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<SessionRuntime>) -> Self {
        Dispatcher { runtime }
    }

    /// Route a tool call by name. Unknown tool names return a
    /// `VALIDATION_ERROR` envelope rather than panicking.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Value {
        match tool {
            "set_breakpoint" => self.set_breakpoint(args).await,
            "start_debug_session" => self.start_debug_session(args).await,
            "control_execution" => self.control_execution(args).await,
            "inspect_variable" => self.inspect_variable(args).await,
            "get_session_status" => self.get_session_status().await,
            "query_history" => self.query_history(args).await,
            other => error_envelope(&BridgeError::ValidationError(format!("unknown tool {other:?}"))),
        }
    }

    async fn set_breakpoint(&self, args: Value) -> Value {
        let args: SetBreakpointArgs = match parse_args(args) {
            Ok(a) => a,
            Err(e) => return e,
        };

        match self.runtime.set_breakpoint(&args.file, args.line, args.condition).await {
            Ok(bp) => json!({
                "success": true,
                "breakpoint": breakpoint_json(&bp),
                "message": format!("breakpoint set at {}:{}", bp.local_file, bp.line),
                "hint": if bp.id.is_some() {
                    "breakpoint registered with the running debuggee"
                } else {
                    "breakpoint will be registered when the session starts"
                },
            }),
            Err(e) => error_envelope(&e),
        }
    }

    async fn start_debug_session(&self, args: Value) -> Value {
        let args: StartDebugSessionArgs = match parse_args(args) {
            Ok(a) => a,
            Err(e) => return e,
        };

        let working_directory = args.working_directory.map(PathBuf::from);
        let outcome = self
            .runtime
            .start_session(
                &args.command,
                args.stop_on_entry.unwrap_or(false),
                args.stop_on_exception.unwrap_or(false),
                working_directory,
            )
            .await;

        match outcome {
            Ok(outcome) => {
                let mut body = json!({
                    "status": outcome.status.as_str(),
                    "session_id": outcome.session_id,
                    "message": start_message(outcome.status),
                    "hint": hint_for_status(outcome.status),
                });
                merge_location(&mut body, outcome.location.as_ref(), outcome.code_snippet.as_deref(), outcome.pause_reason.as_ref());
                body
            }
            Err(e) => error_envelope(&e),
        }
    }

    async fn control_execution(&self, args: Value) -> Value {
        let args: ControlExecutionArgs = match parse_args(args) {
            Ok(a) => a,
            Err(e) => return e,
        };

        let action = match ControlAction::parse(&args.action) {
            Ok(a) => a,
            Err(e) => return error_envelope(&e),
        };

        match self.runtime.control_execution(action).await {
            Ok(outcome) => {
                let mut body = json!({
                    "status": outcome.status.as_str(),
                    "action": outcome.action.as_str(),
                    "message": control_message(outcome.action, outcome.status),
                    "hint": hint_for_status(outcome.status),
                });
                merge_location(&mut body, outcome.location.as_ref(), outcome.code_snippet.as_deref(), outcome.pause_reason.as_ref());
                body
            }
            Err(e) => error_envelope(&e),
        }
    }

    async fn inspect_variable(&self, args: Value) -> Value {
        let args: InspectVariableArgs = match parse_args(args) {
            Ok(a) => a,
            Err(e) => return e,
        };

        if let Some(depth) = args.depth {
            if !(1..=3).contains(&depth) {
                return error_envelope(&BridgeError::ValidationError(format!(
                    "depth must be between 1 and 3, got {depth}"
                )));
            }
        }

        match self.runtime.inspect_variable(&args.name, args.filter.as_deref(), args.depth).await {
            Ok(Inspection::NotFound { variable }) => json!({
                "variable": variable,
                "found": false,
                "message": format!("{variable} is not defined in the current scope"),
                "hint": "check the variable name and that the session is paused at the expected frame",
            }),
            Ok(Inspection::Scalar { variable, r#type, value }) => json!({
                "variable": variable,
                "type": r#type,
                "value": value,
                "hint": "scalar variables return their literal value directly",
            }),
            Ok(Inspection::Summary { variable, r#type, classname, structure }) => json!({
                "variable": variable,
                "type": r#type,
                "classname": classname,
                "structure": {
                    "type": structure.r#type,
                    "classname": structure.classname,
                    "keys": structure.keys,
                    "children_count": structure.children_count,
                    "preview": structure.preview.into_iter().map(|(k, v)| (k, Value::String(v))).collect::<serde_json::Map<String, Value>>(),
                },
                "hint": "pass a filter expression (e.g. \"$.items[*].sku\") to retrieve specific values",
            }),
            Ok(Inspection::Filtered { variable, filter, r#type, value }) => json!({
                "variable": variable,
                "filter": filter,
                "type": r#type,
                "value": value,
                "truncated": false,
            }),
            Ok(Inspection::FilterFailed { variable, filter, diagnostic }) => json!({
                "error": diagnostic.error,
                "variable": variable,
                "filter": filter,
                "type": diagnostic.r#type,
                "available_keys": diagnostic.available_keys,
                "hint": diagnostic.hint,
            }),
            Err(e) => error_envelope(&e),
        }
    }

    async fn get_session_status(&self) -> Value {
        match self.runtime.get_session_status().await {
            None => json!({
                "active": false,
                "available_actions": Vec::<&str>::new(),
            }),
            Some((session_id, status, session)) => {
                let active = matches!(
                    status,
                    SessionStatus::Initializing
                        | SessionStatus::Listening
                        | SessionStatus::Connected
                        | SessionStatus::Running
                        | SessionStatus::Paused
                );
                let mut body = json!({
                    "active": active,
                    "session_id": session_id,
                    "status": status.as_str(),
                    "started_at": session.started_at.to_rfc3339(),
                    "last_activity": session.last_activity_at.to_rfc3339(),
                    "breakpoints": breakpoints_json(&session),
                    "available_actions": status.available_actions(),
                });
                merge_location(&mut body, session.location.as_ref(), session.code_snippet.as_deref(), session.pause_reason.as_ref());
                body
            }
        }
    }

    async fn query_history(&self, args: Value) -> Value {
        let args: QueryHistoryArgs = match parse_args(args) {
            Ok(a) => a,
            Err(e) => return e,
        };
        let steps_ago = args.steps_ago.unwrap_or(1);
        let limit = args.limit.unwrap_or(5).clamp(1, 20);

        match self.runtime.get_history(&args.variable_name, steps_ago, limit).await {
            Ok(entries) => {
                let history: Vec<Value> = entries
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "step": entry.step,
                            "value": entry.value,
                            "location": { "file": entry.location.file, "line": entry.location.line },
                            "timestamp": entry.timestamp.to_rfc3339(),
                        })
                    })
                    .collect();
                let message = if history.is_empty() {
                    format!("no recorded history for {}", args.variable_name)
                } else {
                    format!("found {} historical value(s) for {}", history.len(), args.variable_name)
                };
                json!({
                    "variable": args.variable_name,
                    "steps_ago": steps_ago,
                    "history": history,
                    "message": message,
                })
            }
            Err(e) => error_envelope(&e),
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, Value> {
    serde_json::from_value(args).map_err(|e| {
        error_envelope_with_issues(
            &BridgeError::ValidationError("request arguments failed validation".to_string()),
            vec![e.to_string()],
        )
    })
}

fn error_envelope(e: &BridgeError) -> Value {
    json!({
        "error": e.to_string(),
        "code": e.code(),
        "recoverable": e.recoverable(),
        "hint": e.hint(),
    })
}

fn error_envelope_with_issues(e: &BridgeError, issues: Vec<String>) -> Value {
    let mut v = error_envelope(e);
    if let Value::Object(map) = &mut v {
        map.insert("issues".to_string(), json!(issues));
    }
    v
}

fn breakpoint_json(bp: &Breakpoint) -> Value {
    json!({
        "file": bp.local_file,
        "line": bp.line,
        "condition": bp.condition,
    })
}

fn breakpoints_json(session: &Session) -> Value {
    let mut list: Vec<&Breakpoint> = session.breakpoints.values().collect();
    list.sort_by(|a, b| (a.local_file.as_str(), a.line).cmp(&(b.local_file.as_str(), b.line)));
    json!({
        "count": list.len(),
        "list": list.into_iter().map(breakpoint_json).collect::<Vec<_>>(),
    })
}

fn pause_reason_kind_str(kind: PauseReasonKind) -> &'static str {
    match kind {
        PauseReasonKind::BreakpointHit => "breakpoint_hit",
        PauseReasonKind::StepComplete => "step_complete",
        PauseReasonKind::Exception => "exception",
    }
}

/// Fold location/snippet/pause-reason into an in-progress envelope. Surfaces
/// the raw debuggee reason alongside the mapped enum per spec.md §9's open
/// question resolution.
fn merge_location(body: &mut Value, location: Option<&Location>, code_snippet: Option<&str>, pause_reason: Option<&PauseReason>) {
    let Value::Object(map) = body else { return };
    if let Some(location) = location {
        map.insert(
            "location".to_string(),
            json!({ "file": location.file, "line": location.line, "function": location.function }),
        );
    }
    if let Some(snippet) = code_snippet {
        map.insert("code_snippet".to_string(), json!(snippet));
    }
    if let Some(reason) = pause_reason {
        map.insert("pause_reason".to_string(), json!(pause_reason_kind_str(reason.mapped)));
        map.insert("pause_reason_raw".to_string(), json!(reason.raw));
    }
}

fn start_message(status: SessionStatus) -> String {
    match status {
        SessionStatus::Paused => "session started and paused".to_string(),
        SessionStatus::Running => "session started and is running".to_string(),
        SessionStatus::Stopped => "session ended before pausing".to_string(),
        other => format!("session is {}", other.as_str()),
    }
}

fn control_message(action: ControlAction, status: SessionStatus) -> String {
    match status {
        SessionStatus::Paused => format!("{} complete, paused", action.as_str()),
        SessionStatus::Stopped => format!("{} complete, session stopped", action.as_str()),
        other => format!("{} issued, session is {}", action.as_str(), other.as_str()),
    }
}

fn hint_for_status(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Paused => "use inspect_variable or control_execution to continue",
        SessionStatus::Running | SessionStatus::Listening | SessionStatus::Connected => "call stop to end the session early",
        SessionStatus::Stopped | SessionStatus::Error => "call start_debug_session to begin a new session",
        SessionStatus::Initializing => "waiting for the debuggee to connect",
    }
}

#[derive(Debug, Deserialize)]
struct SetBreakpointArgs {
    file: String,
    line: u32,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartDebugSessionArgs {
    command: String,
    stop_on_entry: Option<bool>,
    stop_on_exception: Option<bool>,
    working_directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlExecutionArgs {
    action: String,
}

#[derive(Debug, Deserialize)]
struct InspectVariableArgs {
    name: String,
    filter: Option<String>,
    depth: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct QueryHistoryArgs {
    variable_name: String,
    steps_ago: Option<u32>,
    limit: Option<u32>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        config.project_root = dir.to_path_buf();
        let runtime = SessionRuntime::new(config).unwrap();
        Dispatcher::new(runtime)
    }

    #[tokio::test]
    async fn set_breakpoint_before_start_succeeds_and_defers() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d
            .dispatch("set_breakpoint", json!({ "file": "app/x.php", "line": 42 }))
            .await;
        assert_eq!(resp["success"], json!(true));
        assert_eq!(resp["breakpoint"]["line"], json!(42));
    }

    #[tokio::test]
    async fn set_breakpoint_rejects_missing_required_field() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("set_breakpoint", json!({ "line": 42 })).await;
        assert_eq!(resp["code"], json!("VALIDATION_ERROR"));
        assert!(resp["issues"].as_array().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn inspect_variable_without_session_is_no_active_session_error() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("inspect_variable", json!({ "name": "$x" })).await;
        assert_eq!(resp["code"], json!("NO_ACTIVE_SESSION"));
        assert_eq!(resp["recoverable"], json!(true));
    }

    #[tokio::test]
    async fn inspect_variable_rejects_depth_above_three_before_dispatch() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("inspect_variable", json!({ "name": "$x", "depth": 4 })).await;
        assert_eq!(resp["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn get_session_status_with_no_session_is_inactive() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("get_session_status", json!({})).await;
        assert_eq!(resp["active"], json!(false));
        assert_eq!(resp["available_actions"], json!(Vec::<String>::new()));
    }

    #[tokio::test]
    async fn get_session_status_after_pending_breakpoint_lists_it() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        d.dispatch("set_breakpoint", json!({ "file": "app/y.php", "line": 10 })).await;
        let resp = d.dispatch("get_session_status", json!({})).await;
        assert_eq!(resp["session_id"], json!("pending"));
        assert_eq!(resp["breakpoints"]["count"], json!(1));
    }

    #[tokio::test]
    async fn unknown_tool_is_validation_error() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("nonexistent_tool", json!({})).await;
        assert_eq!(resp["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn control_execution_rejects_unknown_action() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("control_execution", json!({ "action": "jump" })).await;
        assert_eq!(resp["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn query_history_without_session_surfaces_error() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let resp = d.dispatch("query_history", json!({ "variable_name": "$x" })).await;
        assert_eq!(resp["code"], json!("NO_ACTIVE_SESSION"));
    }
}
