//! Detached process launch and pid-level control.
//!
//! The shared service must outlive whichever launcher started it, so
//! children are spawned into their own process group with stdio discarded
//! and are never waited on. Control afterwards is pid-based: a signal-0
//! probe for liveness, SIGKILL for teardown. No graceful shutdown is
//! negotiated; the proxy keeps no state worth flushing.

use crate::error::{validate_pid_for_check, Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Spawn `argv` detached and return its pid immediately.
pub fn launch_detached(argv: &[String]) -> Result<u32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Process("empty command line".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|source| Error::LaunchFailed {
            command: program.clone(),
            source,
        })?;

    let pid = child.id();
    tracing::debug!(pid, command = %program, "launched detached process");
    Ok(pid)
}

/// Liveness and termination, abstracted so the broker can be exercised
/// against a fake process table in tests.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Talks to the real process table of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcessControl;

impl ProcessControl for HostProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = validate_pid_for_check(pid) else {
            return false;
        };
        match signal::kill(pid, None) {
            Ok(()) => true,
            // Exists but owned by someone else. Registry records only ever
            // point at our own processes, but err on the side of alive.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let Some(nix_pid) = validate_pid_for_check(pid) else {
            return Ok(());
        };
        // The service is its own group leader; take the group down so any
        // helper children go with it, then fall back to the pid alone.
        match signal::killpg(nix_pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(_) => match signal::kill(nix_pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(Error::Process(format!("Failed to kill pid {}: {}", pid, e))),
            },
        }
    }
}
