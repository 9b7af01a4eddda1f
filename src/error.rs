//! The error taxonomy shared by every component of the bridge.
//!
//! Each variant carries a stable string `code` and a `recoverable` flag, per
//! the error handling design: session/connection/input errors are
//! recoverable (the agent can retry or correct its request), protocol errors
//! propagate the debuggee's own error code, and `Unknown` is fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("no active debug session")]
    NoActiveSession,

    #[error("a debug session is already active")]
    SessionAlreadyActive,

    #[error("session is not paused")]
    SessionNotPaused,

    #[error("session has stopped")]
    SessionStopped,

    #[error("timed out waiting for the debuggee")]
    ConnectionTimeout,

    #[error("no available port in the configured range")]
    NoAvailablePort,

    #[error("not connected to a debuggee")]
    NotConnected,

    #[error("debuggee returned protocol error {0}")]
    DbgpError(i32),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl BridgeError {
    /// The stable string code surfaced to the agent, per spec.md §7.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NoActiveSession => "NO_ACTIVE_SESSION",
            BridgeError::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            BridgeError::SessionNotPaused => "SESSION_NOT_PAUSED",
            BridgeError::SessionStopped => "SESSION_STOPPED",
            BridgeError::ConnectionTimeout => "CONNECTION_TIMEOUT",
            BridgeError::NoAvailablePort => "NO_AVAILABLE_PORT",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::DbgpError(_) => "DBGP_ERROR",
            BridgeError::ValidationError(_) => "VALIDATION_ERROR",
            BridgeError::InvalidFilter(_) => "INVALID_FILTER",
            BridgeError::Io(_) | BridgeError::Xml(_) | BridgeError::Sqlite(_) => "UNKNOWN_ERROR",
            BridgeError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Whether the agent can reasonably retry or correct its request.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            BridgeError::Unknown(_) | BridgeError::Io(_) | BridgeError::Xml(_) | BridgeError::Sqlite(_)
        )
    }

    /// A short hint advising the agent's next step, per spec.md §7.
    pub fn hint(&self) -> String {
        match self {
            BridgeError::NoActiveSession => {
                "call start_debug_session before issuing this request".to_string()
            }
            BridgeError::SessionAlreadyActive => {
                "stop the current session before starting a new one".to_string()
            }
            BridgeError::SessionNotPaused => {
                "this operation requires the session to be paused at a breakpoint".to_string()
            }
            BridgeError::SessionStopped => {
                "the session has ended; call start_debug_session to begin a new one".to_string()
            }
            BridgeError::ConnectionTimeout => {
                "the debuggee did not respond in time; check that it is reachable".to_string()
            }
            BridgeError::NoAvailablePort => {
                "free up a port in the configured range or widen port_range_end".to_string()
            }
            BridgeError::NotConnected => {
                "the debuggee connection was closed; start a new session".to_string()
            }
            BridgeError::DbgpError(code) => format!("the debuggee rejected the command (code {code})"),
            BridgeError::ValidationError(_) => "correct the request arguments and retry".to_string(),
            BridgeError::InvalidFilter(_) => "inspect available_keys and retry with a valid filter".to_string(),
            _ => "this is an internal error; check the bridge logs".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
