//! Bridging the shared service across hosts.
//!
//! A batch job may land on any compute node; the proxy it depends on
//! listens on the submit host. The agent builds an ssh forward that makes
//! the service port appear on the job's own loopback, and (when the
//! cluster's login policy insists on interactive verification) drives the
//! ssh prompts itself: pattern-matched output feeds the
//! [`auth::AuthAutomaton`], credentials come from the settings, and one
//! deadline timer bounds the whole exchange.

pub mod auth;
pub mod keys;
pub mod totp;

use crate::error::{Error, Result};
use auth::{AuthAction, AuthAutomaton, AuthEvent, SecretKind};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Overall wall-clock budget for completing authentication.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Replies typed faster than this trip anti-automation heuristics on some
/// login appliances.
const DEFAULT_RESPONSE_DELAY: Duration = Duration::from_millis(500);

/// How long the event loop sleeps between output polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cap on the rolling output buffer the prompt patterns run against.
const TAIL_LIMIT: usize = 4096;

/// Secrets available for driving interactive prompts.
#[derive(Debug, Clone, Default)]
pub struct TunnelCredentials {
    pub otp_seed: Option<String>,
    pub password: Option<String>,
}

pub struct TunnelAgent {
    credentials: TunnelCredentials,
    deadline: Duration,
    response_delay: Duration,
}

impl TunnelAgent {
    pub fn new(credentials: TunnelCredentials) -> Self {
        Self {
            credentials,
            deadline: DEFAULT_DEADLINE,
            response_delay: DEFAULT_RESPONSE_DELAY,
        }
    }

    #[cfg(test)]
    fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Argv that, run on a compute node, binds `loopback_port` locally and
    /// forwards it to `service_port` on the submit host. `-f` makes ssh
    /// detach once the forward is up, so a clean exit of the driven
    /// process means success.
    pub fn build_forward_command(
        &self,
        user: &str,
        host: &str,
        service_port: u16,
        loopback_port: u16,
    ) -> Result<Vec<String>> {
        let mut argv = vec![
            "ssh".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        // Prefer the dedicated key when it exists; ssh falls back to the
        // interactive methods on its own when it doesn't.
        if let Ok(key) = keys::key_path() {
            if key.exists() {
                argv.push("-i".to_string());
                argv.push(key.display().to_string());
            }
        }
        argv.push("-L".to_string());
        argv.push(format!("{}:127.0.0.1:{}", loopback_port, service_port));
        argv.push(format!("{}@{}", user, host));
        Ok(argv)
    }

    /// Run `argv` on a PTY and see authentication through. Returns once
    /// the driven command exits cleanly (for the `-f` forward that means
    /// the tunnel is up and backgrounded). On any failure path the driven
    /// process is killed before returning: a half-established tunnel is
    /// never left behind.
    pub fn execute(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Tunnel("empty tunnel command".to_string()))?;

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Tunnel(format!("failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Tunnel(format!("failed to spawn '{}': {}", program, e)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Tunnel(format!("failed to read pty: {}", e)))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Tunnel(format!("failed to write pty: {}", e)))?;

        let output = spawn_reader(reader);
        let result = self.drive(&output, writer.as_mut(), child.as_mut());
        if result.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        result
    }

    /// The event loop: poll for {output chunk, EOF, timeout tick} until
    /// the automaton finishes or the deadline expires.
    fn drive(
        &self,
        output: &mpsc::Receiver<Vec<u8>>,
        writer: &mut dyn Write,
        child: &mut dyn portable_pty::Child,
    ) -> Result<()> {
        let mut automaton = AuthAutomaton::new();
        let deadline = Instant::now() + self.deadline;
        let mut tail = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("tunnel authentication deadline expired");
                return Err(Error::TunnelTimeout {
                    deadline_secs: self.deadline.as_secs(),
                });
            }

            match output.recv_timeout(remaining.min(POLL_INTERVAL)) {
                Ok(bytes) => {
                    tail.push_str(&String::from_utf8_lossy(&bytes));
                    if tail.len() > TAIL_LIMIT {
                        let mut cut = tail.len() - TAIL_LIMIT;
                        while !tail.is_char_boundary(cut) {
                            cut += 1;
                        }
                        tail.drain(..cut);
                    }
                    if let AuthAction::Send(kind) = automaton.step(AuthEvent::Output(&tail)) {
                        let secret = self.secret_for(kind)?;
                        std::thread::sleep(self.response_delay);
                        writer
                            .write_all(secret.as_bytes())
                            .and_then(|_| writer.write_all(b"\n"))
                            .map_err(|e| {
                                Error::Tunnel(format!("failed to answer prompt: {}", e))
                            })?;
                        tracing::debug!(kind = ?kind, "answered authentication prompt");
                        // A fresh prompt must match fresh output.
                        tail.clear();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // No output; the child may have exited without an EOF
                    // reaching us yet.
                    if let Ok(Some(status)) = child.try_wait() {
                        return self.finish(&mut automaton, status.success());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = child
                        .wait()
                        .map_err(|e| Error::Tunnel(format!("failed to reap tunnel: {}", e)))?;
                    return self.finish(&mut automaton, status.success());
                }
            }
        }
    }

    fn finish(&self, automaton: &mut AuthAutomaton, exit_ok: bool) -> Result<()> {
        match automaton.step(AuthEvent::Eof { exit_ok }) {
            AuthAction::Finish { success: true } => {
                tracing::info!("forward tunnel established");
                Ok(())
            }
            _ => Err(Error::Tunnel(
                "ssh exited before the forward was established".to_string(),
            )),
        }
    }

    fn secret_for(&self, kind: SecretKind) -> Result<String> {
        match kind {
            SecretKind::Otp => {
                let seed = self
                    .credentials
                    .otp_seed
                    .as_deref()
                    .ok_or(Error::CredentialsRequired { secret: "otp_seed" })?;
                totp::code_now(seed)
            }
            SecretKind::Password => self
                .credentials
                .password
                .clone()
                .ok_or(Error::CredentialsRequired { secret: "password" }),
        }
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
