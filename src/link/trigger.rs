//! Trigger process lifecycle: spawn the externally supplied command that
//! starts the debuggee, fire-and-forget (spec.md §4.2, §9).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::{BridgeError, Result};

/// Spawn `command` through a shell so that user-provided pipelines and URL
/// quoting work as the user wrote them. `shlex` is still used up front to
/// validate that the command is at least well-quoted, and to produce the
/// argv logged at debug level; the child itself runs under `sh -c` so
/// pipes/redirects behave as the caller expects.
pub fn spawn_trigger(command: &str, cwd: Option<&Path>, env: &HashMap<String, String>) -> Result<Child> {
    let argv = shlex::split(command)
        .ok_or_else(|| BridgeError::ValidationError(format!("unable to parse trigger command: {command:?}")))?;
    if argv.is_empty() {
        return Err(BridgeError::ValidationError("trigger command is empty".to_string()));
    }
    log::debug!("trigger argv: {argv:?}");

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.envs(env);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Detached: the bridge must be able to exit without waiting on this
    // child (spec.md §4.2 — "never blocks").
    cmd.kill_on_drop(false);

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_lines(stderr, "stderr"));
    }

    Ok(child)
}

async fn drain_lines(io: impl AsyncRead + Unpin, label: &'static str) {
    let mut lines = BufReader::new(io).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let truncated: String = line.chars().take(2048).collect();
                log::debug!("trigger {label}: {truncated}");
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rejects_unbalanced_quoting() {
        let result = spawn_trigger("curl 'unterminated", None, &HashMap::new());
        assert!(matches!(result, Err(BridgeError::ValidationError(_))));
    }

    #[tokio::test]
    async fn spawns_and_drains_output() {
        let mut env = HashMap::new();
        env.insert("XDEBUG_TRIGGER".to_string(), "yes".to_string());
        let mut child = spawn_trigger("echo hello", None, &env).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
