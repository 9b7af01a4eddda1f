//! A DBGp debugger bridge: a long-lived process that exposes a small set of
//! high-level debugging operations to a tool-calling agent and translates
//! them into the DBGp wire protocol spoken by an XDebug-enabled PHP
//! interpreter.
//!
//! The crate is organized leaf-first, each module owning one component of
//! the design:
//!
//! - [`codec`] — frame/unframe DBGp messages, parse the XML tree, decode
//!   `<property>` elements into [`codec::VariableInfo`].
//! - [`path_mapper`] — bidirectional translation between local and remote
//!   filesystem namespaces.
//! - [`ledger`] — the durable, append-only store of steps and variable
//!   snapshots behind "time-travel" history queries.
//! - [`link`] — the TCP listener, trigger-process lifecycle, transaction
//!   correlation, and event dispatch that drives the debuggee.
//! - [`runtime`] — the session state machine, breakpoint registry, start/stop
//!   sequences, and watchdog.
//! - [`inspection`] — the surgical path-filter evaluator and structural
//!   summaries that keep variable inspection responses small.
//! - [`dispatch`] — thin JSON-in/JSON-out translation between the six
//!   agent-facing tools and the [`runtime::SessionRuntime`].
//!
//! Configuration ([`config`]) and the error taxonomy ([`error`]) are shared
//! across every layer above.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inspection;
pub mod ledger;
pub mod link;
pub mod path_mapper;
pub mod runtime;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{BridgeError, Result};
pub use runtime::SessionRuntime;
