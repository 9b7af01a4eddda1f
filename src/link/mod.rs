//! DBGp Link: the TCP listener, trigger-process lifecycle, transaction
//! correlation table, and event dispatch of spec.md §4.2.
//!
//! Grounded in the teacher's `adapter.rs` (`Adapter::single_session_mode`
//! spawning a background listener thread that feeds an `mpsc::Receiver`),
//! generalized from a single-session stdio listener to a `tokio` task that
//! owns a real `TcpStream`, correlates many in-flight transactions, and
//! interleaves asynchronous `break`/`close` events on the same socket.

mod trigger;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::codec::{decode_property, encode_base64, encode_command, decode_file_uri, FrameDecoder, VariableInfo, XmlNode};
use crate::error::{BridgeError, Result};

pub use trigger::spawn_trigger;

const DBGP_PROPERTY_NOT_FOUND: i32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReasonKind {
    BreakpointHit,
    StepComplete,
    Exception,
}

/// Map the debuggee's raw reason text per spec.md §4.2: `"ok"` completes a
/// step, `"error"`/`"exception"` signal an exception, everything else is
/// treated as a breakpoint hit (the open question resolved in spec.md §9 —
/// callers should keep the raw text alongside this mapping).
pub fn map_reason(raw: &str) -> PauseReasonKind {
    match raw {
        "ok" => PauseReasonKind::StepComplete,
        "error" | "exception" => PauseReasonKind::Exception,
        _ => PauseReasonKind::BreakpointHit,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionInfo {
    pub name: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakInfo {
    pub remote_filename: String,
    pub lineno: u32,
    pub reason: String,
    pub exception: Option<ExceptionInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Break(BreakInfo),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub level: u32,
    pub r#type: String,
    pub filename: String,
    pub lineno: u32,
    pub r#where: Option<String>,
    pub cmdbegin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakpointSpec {
    pub r#type: String,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub function: Option<String>,
    pub exception: Option<String>,
    pub expression: Option<String>,
}

struct PendingResponses {
    waiters: HashMap<u64, oneshot::Sender<Result<XmlNode>>>,
}

/// The live DBGp connection. Owns the listener until a debuggee dials in,
/// then owns the write half of the socket and a background reader task that
/// feeds both transaction correlation and the event channel.
pub struct Link {
    listener: Mutex<Option<TcpListener>>,
    bound_port: Mutex<Option<u16>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<Mutex<PendingResponses>>,
    next_txid: AtomicU64,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<LinkEvent>>,
    child: Mutex<Option<Child>>,
    connection_timeout: Duration,
    closed: AtomicBool,
}

impl Link {
    pub fn new(connection_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Link {
            listener: Mutex::new(None),
            bound_port: Mutex::new(None),
            write_half: Mutex::new(None),
            pending: Arc::new(Mutex::new(PendingResponses { waiters: HashMap::new() })),
            next_txid: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(events_rx),
            child: Mutex::new(None),
            connection_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Bind on `port`, retrying sequentially through `port_range_end` on
    /// `EADDRINUSE`. Failed attempts never hold a socket open, so no cleanup
    /// is needed on giving up.
    pub async fn listen(&self, port: u16, port_range_end: u16) -> Result<u16> {
        for candidate in port..=port_range_end {
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => {
                    *self.listener.lock().await = Some(listener);
                    *self.bound_port.lock().await = Some(candidate);
                    log::info!("dbgp link listening on port {candidate}");
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }
        Err(BridgeError::NoAvailablePort)
    }

    pub async fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().await
    }

    /// Accept the inbound debuggee connection and start the background
    /// reader task. Resolves once the socket is accepted; does not wait for
    /// the `<init>` packet.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let listener = self.listener.lock().await.take().ok_or(BridgeError::NotConnected)?;

        let (stream, _addr) = tokio::time::timeout(timeout, listener.accept())
            .await
            .map_err(|_| BridgeError::ConnectionTimeout)?
            .map_err(BridgeError::Io)?;

        let (read_half, write_half) = stream.into_split();
        *self.write_half.lock().await = Some(write_half);

        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone();
        tokio::spawn(read_loop(read_half, pending, events_tx));

        Ok(())
    }

    /// Spawn the trigger command, exporting the environment variables the
    /// debuggee needs to dial back into the bound port (spec.md §6).
    pub async fn execute_trigger(&self, command: &str, cwd: Option<&Path>) -> Result<()> {
        let port = self.bound_port().await.ok_or(BridgeError::NotConnected)?;

        let mut env = HashMap::new();
        env.insert(
            "XDEBUG_CONFIG".to_string(),
            format!("client_host=host.docker.internal client_port={port}"),
        );
        env.insert("XDEBUG_SESSION".to_string(), "mcp".to_string());
        env.insert("XDEBUG_MODE".to_string(), "debug".to_string());
        env.insert("XDEBUG_TRIGGER".to_string(), "yes".to_string());

        let child = spawn_trigger(command, cwd, &env)?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Resolve on the next `break` event, or fail on `close`/timeout.
    pub async fn wait_for_break(&self, timeout: Duration) -> Result<BreakInfo> {
        let mut rx = self.events_rx.lock().await;
        loop {
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(LinkEvent::Break(info))) => return Ok(info),
                Ok(Some(LinkEvent::Close)) => return Err(BridgeError::NotConnected),
                Ok(None) => return Err(BridgeError::NotConnected),
                Err(_) => return Err(BridgeError::ConnectionTimeout),
            }
        }
    }

    /// Drain any event queued since the last poll without blocking, for the
    /// runtime to interleave event processing with in-flight commands.
    pub async fn try_recv_event(&self) -> Option<LinkEvent> {
        self.events_rx.lock().await.try_recv().ok()
    }

    /// Issue a continuation command (`run`, `step_*`) without waiting for its
    /// reply: DBGp only answers a continuation once the debuggee next breaks
    /// or stops, so awaiting it here would block the caller for however long
    /// that takes. The reply still arrives through `read_loop`/`handle_message`
    /// like any other frame and is surfaced as an ordinary `break`/`close`
    /// event for `wait_for_break` (or `try_recv_event`) to observe; it simply
    /// has no waiter registered to resolve.
    pub async fn send_command_no_reply(&self, verb: &str, args: &[(char, String)], trailing_b64: Option<&str>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::NotConnected);
        }

        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_command(verb, txid, args, trailing_b64);

        let mut guard = self.write_half.lock().await;
        let write_half = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        write_half.write_all(&bytes).await.map_err(BridgeError::Io)
    }

    pub async fn send_command(&self, verb: &str, args: &[(char, String)], trailing_b64: Option<&str>) -> Result<XmlNode> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::NotConnected);
        }

        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.waiters.insert(txid, tx);

        let bytes = encode_command(verb, txid, args, trailing_b64);

        {
            let mut guard = self.write_half.lock().await;
            let write_half = guard.as_mut().ok_or(BridgeError::NotConnected)?;
            write_half.write_all(&bytes).await.map_err(BridgeError::Io)?;
        }

        // Timeouts do not remove the pending waiter: a late response must
        // still be matched and discarded rather than logged as unmatched
        // (spec.md §5 "Cancellation & timeouts").
        match tokio::time::timeout(self.connection_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => Err(BridgeError::ConnectionTimeout),
        }
    }

    pub async fn set_breakpoint(&self, spec: &BreakpointSpec) -> Result<String> {
        let mut args = vec![('t', spec.r#type.clone())];
        let mut trailing = None;

        match spec.r#type.as_str() {
            "exception" => {
                if let Some(exception) = &spec.exception {
                    args.push(('x', exception.clone()));
                }
            }
            "conditional" => {
                if let Some(filename) = &spec.filename {
                    args.push(('f', format!("file://{filename}")));
                }
                if let Some(lineno) = spec.lineno {
                    args.push(('n', lineno.to_string()));
                }
                if let Some(expr) = &spec.expression {
                    trailing = Some(encode_base64(expr));
                }
            }
            _ => {
                if let Some(filename) = &spec.filename {
                    args.push(('f', format!("file://{filename}")));
                }
                if let Some(lineno) = spec.lineno {
                    args.push(('n', lineno.to_string()));
                }
                if let Some(function) = &spec.function {
                    args.push(('m', function.clone()));
                }
            }
        }

        let response = self.send_command("breakpoint_set", &args, trailing.as_deref()).await?;
        response
            .attr("id")
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Unknown("breakpoint_set response missing id".to_string()))
    }

    pub async fn remove_breakpoint(&self, id: &str) -> Result<()> {
        self.send_command("breakpoint_remove", &[('d', id.to_string())], None).await?;
        Ok(())
    }

    /// Fetch a variable; DBGp error 300 (not found) is converted to `None`
    /// rather than propagated (spec.md §4.2, §7).
    pub async fn get_property(&self, name: &str, depth: u32, max_children: u32) -> Result<Option<VariableInfo>> {
        let args = [
            ('n', name.to_string()),
            ('d', depth.to_string()),
            ('m', max_children.to_string()),
        ];
        match self.send_command("property_get", &args, None).await {
            Ok(response) => Ok(response.child_named("property").map(decode_property)),
            Err(BridgeError::DbgpError(DBGP_PROPERTY_NOT_FOUND)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_context_variables(&self, context_id: u32, depth: u32) -> Result<Vec<VariableInfo>> {
        let args = [('c', context_id.to_string()), ('d', depth.to_string())];
        let response = self.send_command("context_get", &args, None).await?;
        Ok(response.children_named("property").map(decode_property).collect())
    }

    pub async fn get_stack_frames(&self) -> Result<Vec<StackFrame>> {
        let response = self.send_command("stack_get", &[], None).await?;
        Ok(response
            .children_named("stack")
            .map(|node| StackFrame {
                level: node.attr("level").and_then(|v| v.parse().ok()).unwrap_or(0),
                r#type: node.attr("type").unwrap_or("file").to_string(),
                filename: node.attr("filename").map(decode_file_uri).unwrap_or_default(),
                lineno: node.attr("lineno").and_then(|v| v.parse().ok()).unwrap_or(0),
                r#where: node.attr("where").map(str::to_string),
                cmdbegin: node.attr("cmdbegin").map(str::to_string),
            })
            .collect())
    }

    pub async fn evaluate(&self, expression: &str) -> Result<VariableInfo> {
        let trailing = encode_base64(expression);
        let response = self.send_command("eval", &[], Some(&trailing)).await?;
        response
            .child_named("property")
            .map(decode_property)
            .ok_or_else(|| BridgeError::Unknown("eval response missing property".to_string()))
    }

    pub async fn set_feature(&self, name: &str, value: &str) -> Result<()> {
        let args = [('n', name.to_string()), ('v', value.to_string())];
        self.send_command("feature_set", &args, None).await?;
        Ok(())
    }

    pub async fn break_on_exception(&self, name: &str) -> Result<String> {
        self.set_breakpoint(&BreakpointSpec {
            r#type: "exception".to_string(),
            exception: Some(name.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Idempotent: kills the trigger process best-effort, rejects all
    /// pending commands, and drops the socket/listener.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }

        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.waiters.drain() {
            let _ = waiter.send(Err(BridgeError::NotConnected));
        }
        drop(pending);

        *self.write_half.lock().await = None;
        *self.listener.lock().await = None;
    }
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    pending: Arc<Mutex<PendingResponses>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events_tx.send(LinkEvent::Close);
                let mut pending = pending.lock().await;
                for (_, waiter) in pending.waiters.drain() {
                    let _ = waiter.send(Err(BridgeError::NotConnected));
                }
                return;
            }
            Ok(n) => n,
        };

        decoder.push(&buf[..n]);
        for message in decoder.drain_messages() {
            handle_message(&message, &pending, &events_tx).await;
        }
    }
}

async fn handle_message(bytes: &[u8], pending: &Arc<Mutex<PendingResponses>>, events_tx: &mpsc::UnboundedSender<LinkEvent>) {
    let node = match crate::codec::parse_xml(bytes) {
        Ok(node) => node,
        Err(e) => {
            log::warn!("dbgp: dropping unparsable frame: {e}");
            return;
        }
    };

    if node.tag.ends_with("init") {
        log::info!("dbgp: debuggee init: idekey={:?}", node.attr("idekey"));
        return;
    }
    if !node.tag.ends_with("response") {
        log::debug!("dbgp: ignoring unexpected top-level element {:?}", node.tag);
        return;
    }

    let status = node.attr("status").unwrap_or("").to_string();
    let reason = node.attr("reason").unwrap_or("ok").to_string();

    let result: Result<XmlNode> = match node.child_named("error") {
        Some(error_node) => {
            let code = error_node.attr("code").and_then(|c| c.parse().ok()).unwrap_or(0);
            Err(BridgeError::DbgpError(code))
        }
        None => Ok(node.clone()),
    };

    if let Some(txid) = node.attr("transaction_id").and_then(|t| t.parse::<u64>().ok()) {
        if let Some(waiter) = pending.lock().await.waiters.remove(&txid) {
            let _ = waiter.send(result);
        }
    }

    match status.as_str() {
        "break" => {
            let location = node.child_named("message").or_else(|| node.child_named("xdebug:message"));
            let remote_filename = location.and_then(|n| n.attr("filename")).map(decode_file_uri).unwrap_or_default();
            let lineno = location.and_then(|n| n.attr("lineno")).and_then(|l| l.parse().ok()).unwrap_or(0);
            let exception = node.attr("exception").map(|name| ExceptionInfo {
                name: name.to_string(),
                message: node.attr("message").map(str::to_string),
            });
            let _ = events_tx.send(LinkEvent::Break(BreakInfo { remote_filename, lineno, reason, exception }));
        }
        "stopped" => {
            let _ = events_tx.send(LinkEvent::Close);
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reason_mapping_matches_spec_table() {
        assert_eq!(map_reason("ok"), PauseReasonKind::StepComplete);
        assert_eq!(map_reason("error"), PauseReasonKind::Exception);
        assert_eq!(map_reason("exception"), PauseReasonKind::Exception);
        assert_eq!(map_reason("breakpoint"), PauseReasonKind::BreakpointHit);
        assert_eq!(map_reason("anything_else"), PauseReasonKind::BreakpointHit);
    }

    #[tokio::test]
    async fn listen_binds_to_first_free_port_in_range() {
        let link = Link::new(Duration::from_secs(1));
        // Occupy the base port first so the walk has to advance.
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let blocked_port = blocker.local_addr().unwrap().port();

        let bound = link.listen(blocked_port, blocked_port + 5).await.unwrap();
        assert_ne!(bound, blocked_port);
        assert!(bound <= blocked_port + 5);
    }

    #[tokio::test]
    async fn listen_exhausting_range_fails_with_no_available_port() {
        let link = Link::new(Duration::from_secs(1));
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        // A single-port "range" already occupied.
        let result = link.listen(port, port).await;
        assert!(matches!(result, Err(BridgeError::NoAvailablePort)));
    }

    #[tokio::test]
    async fn send_command_round_trips_through_a_loopback_stream() {
        let link = Arc::new(Link::new(Duration::from_secs(2)));
        let port = link.listen(0, 0).await.unwrap();

        let connect = tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });

        link.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        let mut debuggee = connect.await.unwrap();

        let link_clone = Arc::clone(&link);
        let command_task = tokio::spawn(async move {
            link_clone.send_command("feature_set", &[('n', "foo".to_string()), ('v', "1".to_string())], None).await
        });

        // Read the encoded command off the debuggee side, then reply.
        let mut incoming = [0u8; 256];
        let n = debuggee.read(&mut incoming).await.unwrap();
        let request_text = String::from_utf8_lossy(&incoming[..n]);
        assert!(request_text.contains("feature_set"));
        assert!(request_text.contains("-i 1"));

        let xml = r#"<response transaction_id="1" command="feature_set" feature="foo" success="1"/>"#;
        let frame = format!("{}\0{}\0", xml.len(), xml);
        debuggee.write_all(frame.as_bytes()).await.unwrap();

        let response = command_task.await.unwrap().unwrap();
        assert_eq!(response.attr("feature"), Some("foo"));
    }

    #[tokio::test]
    async fn close_rejects_pending_waiters() {
        let link = Arc::new(Link::new(Duration::from_secs(5)));
        let port = link.listen(0, 0).await.unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(("127.0.0.1", port)).await.unwrap() });
        link.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        let _debuggee = connect.await.unwrap();

        let link_clone = Arc::clone(&link);
        let command_task = tokio::spawn(async move { link_clone.send_command("run", &[], None).await });

        // Give the command a moment to register as pending, then close.
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.close().await;

        let result = command_task.await.unwrap();
        assert!(matches!(result, Err(BridgeError::NotConnected)));
    }
}
