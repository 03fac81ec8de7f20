//! Pipeline orchestration: thread lifetimes, subprocess handles, and the
//! host callback protocol for both transfer directions.

pub mod backup;
pub mod restore;

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{GantryError, Result};
use crate::relay::LogRelay;

/// How long to wait for the external tool to exit before giving up on it.
pub(crate) const TOOL_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn spawn_export_tool(command: &mut Command) -> Result<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| GantryError::Upstream(format!("failed to spawn export tool: {e}")))
}

pub(crate) fn spawn_import_tool(command: &mut Command) -> Result<Child> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| GantryError::Upstream(format!("failed to spawn import tool: {e}")))
}

/// Drain the tool's stderr line by line into the relay mailbox.
pub(crate) fn spawn_stderr_relay(stderr: ChildStderr, relay: Arc<LogRelay>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => relay.put(&line),
                Err(_) => break,
            }
        }
    })
}

/// Ask the tool to terminate, escalating to a hard kill after `timeout`.
pub(crate) fn terminate_tool(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    if wait_with_timeout(child, timeout).is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Wait up to `timeout` for the child to exit. `None` means still running.
pub(crate) fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return None,
        }
    }
}

/// Wait for a clean tool exit; abnormal exit is an upstream failure.
pub(crate) fn reap_tool(child: &mut Child, timeout: Duration) -> Result<()> {
    match wait_with_timeout(child, timeout) {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(GantryError::Upstream(format!(
            "external tool exited with {status}"
        ))),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(GantryError::Upstream(
                "external tool did not exit in time".into(),
            ))
        }
    }
}
