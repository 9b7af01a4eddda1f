//! Session Runtime: the central coordinator — state machine, breakpoint
//! registry, start/stop sequences, break handling, and the watchdog
//! (spec.md §4.5).
//!
//! Grounded in the teacher's `lib.rs` dispatch shape (match over a discrete
//! set of message kinds, each producing a typed follow-up), scaled up to the
//! full state machine described in the component design.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{Config, ABSOLUTE_MAX_DEPTH};
use crate::error::{BridgeError, Result};
use crate::inspection::{self, FilterDiagnostic, StructuralSummary};
use crate::ledger::{HistoryEntry, Ledger, StepLocation};
use crate::link::{map_reason, BreakInfo, BreakpointSpec, ExceptionInfo, Link, LinkEvent, PauseReasonKind};
use crate::path_mapper::PathMapper;

pub const PENDING_SESSION_ID: &str = "pending";
const BREAK_AFTER_START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Listening,
    Connected,
    Running,
    Paused,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Listening => "listening",
            SessionStatus::Connected => "connected",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// The tool names the agent may call in this status (spec.md §6).
    pub fn available_actions(&self) -> &'static [&'static str] {
        match self {
            SessionStatus::Paused => &["step_over", "step_into", "step_out", "continue", "stop", "inspect_variable"],
            SessionStatus::Running | SessionStatus::Listening | SessionStatus::Connected => &["stop"],
            SessionStatus::Stopped | SessionStatus::Error => &["start_debug_session"],
            SessionStatus::Initializing => &[],
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PauseReason {
    pub mapped: PauseReasonKind,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub local_file: String,
    pub line: u32,
    pub condition: Option<String>,
    pub remote_file: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    StepOver,
    StepInto,
    StepOut,
    Continue,
    Stop,
}

impl ControlAction {
    pub fn parse(action: &str) -> Result<Self> {
        match action {
            "step_over" => Ok(ControlAction::StepOver),
            "step_into" => Ok(ControlAction::StepInto),
            "step_out" => Ok(ControlAction::StepOut),
            "continue" => Ok(ControlAction::Continue),
            "stop" => Ok(ControlAction::Stop),
            other => Err(BridgeError::ValidationError(format!("unknown control action {other:?}"))),
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ControlAction::StepOver => "step_over",
            ControlAction::StepInto => "step_into",
            ControlAction::StepOut => "step_out",
            ControlAction::Continue => "run",
            ControlAction::Stop => unreachable!("stop is handled separately"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::StepOver => "step_over",
            ControlAction::StepInto => "step_into",
            ControlAction::StepOut => "step_out",
            ControlAction::Continue => "continue",
            ControlAction::Stop => "stop",
        }
    }
}

#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub breakpoints: HashMap<(String, u32), Breakpoint>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub location: Option<Location>,
    pub code_snippet: Option<String>,
    pub pause_reason: Option<PauseReason>,
    pub error_message: Option<String>,
    pub exception: Option<ExceptionInfo>,
    step_counter: u32,
}

impl Session {
    fn pending() -> Self {
        Session {
            id: PENDING_SESSION_ID.to_string(),
            status: SessionStatus::Initializing,
            breakpoints: HashMap::new(),
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
            location: None,
            code_snippet: None,
            pause_reason: None,
            error_message: None,
            exception: None,
            step_counter: 0,
        }
    }
}

/// What `inspect_variable` ultimately renders; `dispatch` maps each variant
/// onto the JSON shapes of spec.md §6.
pub enum Inspection {
    NotFound { variable: String },
    Scalar { variable: String, r#type: String, value: Value },
    Summary { variable: String, r#type: String, classname: Option<String>, structure: StructuralSummary },
    Filtered { variable: String, filter: String, r#type: String, value: Value },
    FilterFailed { variable: String, filter: String, diagnostic: FilterDiagnostic },
}

pub struct StartOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub location: Option<Location>,
    pub code_snippet: Option<String>,
    pub pause_reason: Option<PauseReason>,
}

pub struct ControlOutcome {
    pub action: ControlAction,
    pub status: SessionStatus,
    pub location: Option<Location>,
    pub code_snippet: Option<String>,
    pub pause_reason: Option<PauseReason>,
}

struct RuntimeState {
    session: Option<Session>,
    link: Option<Arc<Link>>,
    last_activity: Instant,
}

pub struct SessionRuntime {
    config: Config,
    ledger: Ledger,
    path_mapper: Mutex<PathMapper>,
    op_lock: Mutex<()>,
    state: Mutex<RuntimeState>,
}

impl SessionRuntime {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let ledger = Ledger::open(&config.data_dir)?;
        let path_mapper = PathMapper::load(None, None, None, &config.project_root);

        Ok(Arc::new(SessionRuntime {
            config,
            ledger,
            path_mapper: Mutex::new(path_mapper),
            op_lock: Mutex::new(()),
            state: Mutex::new(RuntimeState {
                session: None,
                link: None,
                last_activity: Instant::now(),
            }),
        }))
    }

    async fn touch_activity(&self) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
        if let Some(session) = state.session.as_mut() {
            session.last_activity_at = Utc::now();
        }
    }

    /// Drain any `break`/`close` events the link queued since the last
    /// check, so an event that raced an agent request is reflected in
    /// session state before the request proceeds (spec.md §5).
    async fn drain_pending_events(&self) {
        let link = {
            let state = self.state.lock().await;
            state.link.clone()
        };
        let Some(link) = link else { return };
        while let Some(event) = link.try_recv_event().await {
            match event {
                LinkEvent::Break(info) => {
                    if let Err(e) = self.handle_break(info).await {
                        log::warn!("failed to record drained break event: {e}");
                    }
                }
                LinkEvent::Close => self.transition_to_stopped(None).await,
            }
        }
    }

    pub async fn set_breakpoint(self: &Arc<Self>, file: &str, line: u32, condition: Option<String>) -> Result<Breakpoint> {
        if line < 1 {
            return Err(BridgeError::ValidationError("line must be >= 1".to_string()));
        }
        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;
        self.touch_activity().await;

        let remote_file = self.path_mapper.lock().await.to_remote(file);
        let key = (file.to_string(), line);
        let mut breakpoint = Breakpoint {
            local_file: file.to_string(),
            line,
            condition,
            remote_file,
            id: None,
        };

        let (link, connected) = {
            let mut state = self.state.lock().await;
            if state.session.is_none() {
                state.session = Some(Session::pending());
            }
            let session = state.session.as_ref().unwrap();
            let connected = matches!(
                session.status,
                SessionStatus::Connected | SessionStatus::Running | SessionStatus::Paused
            );
            (state.link.clone(), connected)
        };

        if connected {
            if let Some(link) = link {
                let id = link.set_breakpoint(&breakpoint_spec(&breakpoint)).await?;
                breakpoint.id = Some(id);
            }
        }

        let mut state = self.state.lock().await;
        state.session.as_mut().unwrap().breakpoints.insert(key, breakpoint.clone());
        Ok(breakpoint)
    }

    pub async fn start_session(
        self: &Arc<Self>,
        command: &str,
        stop_on_entry: bool,
        stop_on_exception: bool,
        working_directory: Option<PathBuf>,
    ) -> Result<StartOutcome> {
        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;

        {
            let state = self.state.lock().await;
            if let Some(session) = &state.session {
                if session.id != PENDING_SESSION_ID {
                    return Err(BridgeError::SessionAlreadyActive);
                }
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let carried_breakpoints = {
            let mut state = self.state.lock().await;
            state.session.take().map(|s| s.breakpoints).unwrap_or_default()
        };

        self.ledger.init_session(&session_id)?;

        let link = Arc::new(Link::new(self.config.connection_timeout));
        let port = link.listen(self.config.port, self.config.port_range_end).await?;
        log::info!("session {session_id}: listening on port {port}");

        {
            let mut state = self.state.lock().await;
            state.link = Some(Arc::clone(&link));
            state.session = Some(Session {
                id: session_id.clone(),
                status: SessionStatus::Listening,
                breakpoints: carried_breakpoints,
                started_at: Utc::now(),
                last_activity_at: Utc::now(),
                location: None,
                code_snippet: None,
                pause_reason: None,
                error_message: None,
                exception: None,
                step_counter: 0,
            });
        }

        link.execute_trigger(command, working_directory.as_deref()).await?;

        link.wait_for_connection(self.config.connection_timeout).await?;
        self.set_status(SessionStatus::Connected).await;

        let breakpoints: Vec<Breakpoint> = {
            let state = self.state.lock().await;
            state.session.as_ref().unwrap().breakpoints.values().cloned().collect()
        };
        for breakpoint in breakpoints {
            match link.set_breakpoint(&breakpoint_spec(&breakpoint)).await {
                Ok(id) => {
                    let mut state = self.state.lock().await;
                    if let Some(session) = state.session.as_mut() {
                        if let Some(b) = session.breakpoints.get_mut(&(breakpoint.local_file.clone(), breakpoint.line)) {
                            b.id = Some(id);
                        }
                    }
                }
                Err(e) => log::warn!(
                    "session {session_id}: failed to register breakpoint {}:{}: {e}",
                    breakpoint.local_file,
                    breakpoint.line
                ),
            }
        }

        if stop_on_exception {
            if let Err(e) = link.break_on_exception("*").await {
                log::warn!("session {session_id}: failed to set break-on-exception: {e}");
            }
        }

        // Fire-and-forget: the reply to a continuation command only arrives
        // once the debuggee next breaks or stops, so awaiting it here would
        // block until that happens (or `connection_timeout` errors us out).
        // `wait_for_break` below owns the grace-then-remain-running decision.
        if stop_on_entry {
            link.send_command_no_reply("step_into", &[], None).await?;
        } else {
            link.send_command_no_reply("run", &[], None).await?;
        }
        self.set_status(SessionStatus::Running).await;

        match link.wait_for_break(BREAK_AFTER_START_TIMEOUT).await {
            Ok(break_info) => self.handle_break(break_info).await?,
            Err(BridgeError::ConnectionTimeout) => {
                log::debug!("session {session_id}: no break within grace period, remaining in running state");
            }
            Err(BridgeError::NotConnected) => {
                self.transition_to_stopped(None).await;
            }
            Err(e) => return Err(e),
        }

        self.spawn_watchdog(Arc::clone(self));

        let state = self.state.lock().await;
        let session = state.session.as_ref().unwrap();
        Ok(StartOutcome {
            session_id,
            status: session.status,
            location: session.location.clone(),
            code_snippet: session.code_snippet.clone(),
            pause_reason: session.pause_reason.clone(),
        })
    }

    async fn set_status(&self, status: SessionStatus) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.as_mut() {
            session.status = status;
        }
    }

    async fn handle_break(&self, break_info: BreakInfo) -> Result<()> {
        let local_file = self.path_mapper.lock().await.to_local(&break_info.remote_filename);

        let link = {
            let state = self.state.lock().await;
            state.link.clone()
        };
        let function = match &link {
            Some(link) => link
                .get_stack_frames()
                .await
                .ok()
                .and_then(|frames| frames.into_iter().next())
                .and_then(|frame| frame.r#where),
            None => None,
        };

        let snippet = read_snippet(Path::new(&local_file), break_info.lineno);

        let mut state = self.state.lock().await;
        let session = state.session.as_mut().ok_or(BridgeError::NoActiveSession)?;
        session.step_counter += 1;
        let step = session.step_counter;
        session.status = SessionStatus::Paused;
        session.location = Some(Location { file: local_file.clone(), line: break_info.lineno, function: function.clone() });
        session.code_snippet = snippet.clone();
        session.pause_reason = Some(PauseReason { mapped: map_reason(&break_info.reason), raw: break_info.reason.clone() });
        session.exception = break_info.exception.clone();
        session.last_activity_at = Utc::now();
        let session_id = session.id.clone();
        drop(state);

        self.ledger.record_step(
            &session_id,
            step,
            &StepLocation { file: local_file, line: break_info.lineno },
            function.as_deref(),
            reason_label(&break_info),
        )?;

        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
        Ok(())
    }

    async fn transition_to_stopped(&self, error_message: Option<String>) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.as_mut() {
            session.status = if error_message.is_some() { SessionStatus::Error } else { SessionStatus::Stopped };
            session.error_message = error_message;
        }
    }

    pub async fn control_execution(self: &Arc<Self>, action: ControlAction) -> Result<ControlOutcome> {
        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;
        self.touch_activity().await;

        if action == ControlAction::Stop {
            self.stop_sequence_locked().await?;
            let state = self.state.lock().await;
            let session = state.session.as_ref();
            return Ok(ControlOutcome {
                action,
                status: session.map(|s| s.status).unwrap_or(SessionStatus::Stopped),
                location: session.and_then(|s| s.location.clone()),
                code_snippet: session.and_then(|s| s.code_snippet.clone()),
                pause_reason: session.and_then(|s| s.pause_reason.clone()),
            });
        }

        let (link, status) = {
            let state = self.state.lock().await;
            let session = state.session.as_ref().ok_or(BridgeError::NoActiveSession)?;
            if session.status.is_terminal() {
                return Err(BridgeError::SessionStopped);
            }
            (state.link.clone().ok_or(BridgeError::NotConnected)?, session.status)
        };
        let _ = status;

        // Same reasoning as `start_session`: don't block on a continuation's
        // reply, let `wait_for_break` own the timeout.
        link.send_command_no_reply(action.verb(), &[], None).await?;
        self.set_status(SessionStatus::Running).await;

        match link.wait_for_break(self.config.connection_timeout).await {
            Ok(break_info) => self.handle_break(break_info).await?,
            Err(BridgeError::ConnectionTimeout) => {}
            Err(BridgeError::NotConnected) => self.transition_to_stopped(None).await,
            Err(e) => return Err(e),
        }

        let state = self.state.lock().await;
        let session = state.session.as_ref().unwrap();
        Ok(ControlOutcome {
            action,
            status: session.status,
            location: session.location.clone(),
            code_snippet: session.code_snippet.clone(),
            pause_reason: session.pause_reason.clone(),
        })
    }

    pub async fn inspect_variable(self: &Arc<Self>, name: &str, filter: Option<&str>, depth: Option<u32>) -> Result<Inspection> {
        if let Some(d) = depth {
            if d > 3 || d < 1 {
                return Err(BridgeError::ValidationError(format!("depth must be in [1, 3], got {d}")));
            }
        }

        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;
        self.touch_activity().await;

        let (link, step, location) = {
            let state = self.state.lock().await;
            let session = state.session.as_ref().ok_or(BridgeError::NoActiveSession)?;
            if session.status != SessionStatus::Paused {
                return Err(BridgeError::SessionNotPaused);
            }
            (
                state.link.clone().ok_or(BridgeError::NotConnected)?,
                session.step_counter,
                session.location.clone(),
            )
        };

        let clamp = depth.unwrap_or(1).min(self.config.max_depth).min(ABSOLUTE_MAX_DEPTH);
        let info = link.get_property(name, clamp, self.config.default_max_children).await?;

        let Some(info) = info else {
            return Ok(Inspection::NotFound { variable: name.to_string() });
        };

        let structured = inspection::to_structured_value(&info);

        if let Some(location) = location {
            let session_id = {
                let state = self.state.lock().await;
                state.session.as_ref().map(|s| s.id.clone())
            };
            if let Some(session_id) = session_id {
                self.ledger.record_variable(
                    &session_id,
                    step,
                    &StepLocation { file: location.file, line: location.line },
                    name,
                    &structured,
                )?;
            }
        }

        if let Some(filter) = filter {
            return Ok(match inspection::apply_filter(name, &info, &structured, filter) {
                Ok(value) => Inspection::Filtered { variable: name.to_string(), filter: filter.to_string(), r#type: info.r#type, value },
                Err(diagnostic) => Inspection::FilterFailed { variable: name.to_string(), filter: filter.to_string(), diagnostic },
            });
        }

        if info.children.is_none() {
            return Ok(Inspection::Scalar { variable: name.to_string(), r#type: info.r#type, value: structured });
        }

        Ok(Inspection::Summary {
            variable: name.to_string(),
            r#type: info.r#type.clone(),
            classname: info.classname.clone(),
            structure: inspection::structural_summary(&info),
        })
    }

    pub async fn get_history(&self, name: &str, steps_ago: u32, limit: u32) -> Result<Vec<HistoryEntry>> {
        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;
        self.touch_activity().await;

        let (session_id, current_step) = {
            let state = self.state.lock().await;
            let session = state.session.as_ref().ok_or(BridgeError::NoActiveSession)?;
            if session.id == PENDING_SESSION_ID {
                return Err(BridgeError::NoActiveSession);
            }
            (session.id.clone(), session.step_counter)
        };

        let target_step = current_step.saturating_sub(steps_ago);
        self.ledger.get_variable_history(&session_id, name, target_step, limit)
    }

    pub async fn get_session_status(&self) -> Option<(String, SessionStatus, Session)> {
        let _guard = self.op_lock.lock().await;
        self.drain_pending_events().await;
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| (s.id.clone(), s.status, s.clone()))
    }

    async fn stop_sequence_locked(&self) -> Result<()> {
        let (link, session_id, already_stopped) = {
            let state = self.state.lock().await;
            match &state.session {
                None => return Ok(()),
                Some(session) if session.status == SessionStatus::Stopped => (None, session.id.clone(), true),
                Some(session) => (state.link.clone(), session.id.clone(), false),
            }
        };

        if already_stopped {
            return Ok(());
        }

        if let Some(link) = &link {
            let _ = link.send_command("stop", &[], None).await;
            link.close().await;
        }

        if session_id != PENDING_SESSION_ID {
            if let Err(e) = self.ledger.finalize_session(&session_id) {
                log::warn!("session {session_id}: failed to finalize ledger: {e}");
            }
        }

        let mut state = self.state.lock().await;
        if let Some(session) = state.session.as_mut() {
            session.status = SessionStatus::Stopped;
        }
        state.link = None;
        Ok(())
    }

    /// Poll every `watchdog_timeout` and stop the session if no activity
    /// (a break event or an agent request) has landed since the last check.
    fn spawn_watchdog(&self, runtime: Arc<Self>) {
        let timeout = self.config.watchdog_timeout;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;

                let stopped = {
                    let state = runtime.state.lock().await;
                    state.session.as_ref().map(|s| s.status.is_terminal()).unwrap_or(true)
                };
                if stopped {
                    return;
                }

                let elapsed = {
                    let state = runtime.state.lock().await;
                    state.last_activity.elapsed()
                };

                if elapsed >= timeout {
                    log::warn!("watchdog: session idle for {elapsed:?}, stopping");
                    let _ = runtime.stop_sequence_locked().await;
                    return;
                }
            }
        });
    }
}

fn breakpoint_spec(breakpoint: &Breakpoint) -> BreakpointSpec {
    match &breakpoint.condition {
        Some(expr) => BreakpointSpec {
            r#type: "conditional".to_string(),
            filename: Some(breakpoint.remote_file.clone()),
            lineno: Some(breakpoint.line),
            expression: Some(expr.clone()),
            ..Default::default()
        },
        None => BreakpointSpec {
            r#type: "line".to_string(),
            filename: Some(breakpoint.remote_file.clone()),
            lineno: Some(breakpoint.line),
            ..Default::default()
        },
    }
}

fn reason_label(break_info: &BreakInfo) -> &'static str {
    match map_reason(&break_info.reason) {
        PauseReasonKind::StepComplete => "step_complete",
        PauseReasonKind::Exception => "exception",
        PauseReasonKind::BreakpointHit => "breakpoint_hit",
    }
}

/// Read up to 3 lines of local source centered on `line` (1-indexed),
/// best-effort: any IO failure yields `None` rather than propagating.
fn read_snippet(path: &Path, line: u32) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    if line == 0 {
        return None;
    }
    let idx = (line - 1) as usize;
    let start = idx.saturating_sub(1);
    let end = (idx + 1).min(lines.len().saturating_sub(1));
    if start >= lines.len() {
        return None;
    }
    Some(lines[start..=end].join("\n"))
}
