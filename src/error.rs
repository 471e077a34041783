use miette::Diagnostic;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(slink::filesystem::error))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Process error: {0}")]
    #[diagnostic(code(slink::process::error))]
    Process(String),

    #[error("No free port found in {low}..={high} after {attempts} attempts")]
    #[diagnostic(
        code(slink::port::exhausted),
        help("Widen port_range in ~/.config/slink/config.json, or clear stale locks under the scratch directory")
    )]
    PortExhausted { low: u16, high: u16, attempts: u32 },

    #[error("Failed to launch '{command}': {source}")]
    #[diagnostic(
        code(slink::process::launch_failed),
        help("Check that the executable exists and is executable")
    )]
    LaunchFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not acquire lock on {path} within {timeout_secs}s")]
    #[diagnostic(
        code(slink::lock::timeout),
        help("Another slink process may be holding the registry; retrying is safe")
    )]
    LockTimeout { path: String, timeout_secs: u64 },

    #[error("Interactive authentication needs the '{secret}' secret, which is not configured")]
    #[diagnostic(
        code(slink::tunnel::credentials_required),
        help("Add \"{secret}\" to ~/.config/slink/config.json")
    )]
    CredentialsRequired { secret: &'static str },

    #[error("Tunnel authentication did not complete within {deadline_secs}s")]
    #[diagnostic(code(slink::tunnel::timeout))]
    TunnelTimeout { deadline_secs: u64 },

    #[error("Tunnel setup failed: {0}")]
    #[diagnostic(code(slink::tunnel::error))]
    Tunnel(String),

    #[error("All provisioning mirrors failed for {}: {}", .asset, .errors.join("; "))]
    #[diagnostic(
        code(slink::provision::all_mirrors_failed),
        help("Check network connectivity, or place the file under ~/.config/slink/bin/ yourself")
    )]
    AllProvisionMirrorsFailed { asset: String, errors: Vec<String> },

    #[error("Queue query failed: {0}")]
    #[diagnostic(
        code(slink::queue::error),
        help("Check that squeue is on PATH and the scheduler is reachable")
    )]
    Queue(String),

    #[error("Submission failed: {0}")]
    #[diagnostic(code(slink::submit::error))]
    Submit(String),

    /// The wrapped user command ran and exited non-zero. Its own output is
    /// the user feedback; main propagates the code without a redundant
    /// message.
    #[error("job command exited with status {code}")]
    JobExited { code: i32 },
}

impl Error {
    /// Whether the caller may simply retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

/// Convert a pid recorded in the registry into something `kill` accepts.
///
/// Returns `None` for pids that cannot be represented (0, or beyond
/// `i32::MAX`) rather than erroring: a registry record carrying such a pid
/// is treated the same as a dead process.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_bounds() {
        assert!(validate_pid_for_check(0).is_none());
        assert!(validate_pid_for_check(u32::MAX).is_none());
        assert_eq!(
            validate_pid_for_check(1234),
            Some(nix::unistd::Pid::from_raw(1234))
        );
    }

    #[test]
    fn lock_timeout_is_retryable() {
        let err = Error::LockTimeout {
            path: "/tmp/x".to_string(),
            timeout_secs: 10,
        };
        assert!(err.is_retryable());
        assert!(!Error::Config("x".to_string()).is_retryable());
    }

    #[test]
    fn mirror_errors_are_joined() {
        let err = Error::AllProvisionMirrorsFailed {
            asset: "Country.mmdb".to_string(),
            errors: vec!["mirror-a: 404".to_string(), "mirror-b: timeout".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("mirror-a: 404"));
        assert!(msg.contains("mirror-b: timeout"));
    }
}
