//! The interactive-authentication automaton.
//!
//! ssh output is pattern-matched into events; the automaton decides what,
//! if anything, to type back. It owns no clock and does no I/O, which
//! keeps every transition unit-testable; the driver in
//! [`super::TunnelAgent::execute`] owns the PTY and the deadline timer.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Reading output, waiting for a prompt or for the command to finish.
    AwaitPrompt,
    /// A one-time code was typed; waiting for the verdict.
    OtpSent,
    /// The password was typed; waiting for the verdict.
    PasswordSent,
    /// The driven command finished, one way or the other.
    Done,
}

/// What the driver observed on the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent<'a> {
    /// Accumulated output since the last credential was sent.
    Output(&'a str),
    /// The command closed its output. `exit_ok` is its exit status.
    Eof { exit_ok: bool },
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Nothing actionable yet; keep reading.
    Wait,
    /// Type this credential (after the anti-automation delay).
    Send(SecretKind),
    /// The exchange is over.
    Finish { success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Otp,
    Password,
}

pub struct AuthAutomaton {
    state: AuthState,
    otp_prompt: Regex,
    password_prompt: Regex,
}

impl AuthAutomaton {
    pub fn new() -> Self {
        Self {
            state: AuthState::AwaitPrompt,
            // Prompts arrive without a trailing newline, so both patterns
            // anchor to the end of the accumulated output.
            otp_prompt: Regex::new(
                r"(?i)(verification code|one-time password|otp|authenticator code)[^\n]*:\s*$",
            )
            .expect("static regex pattern is valid"),
            password_prompt: Regex::new(r"(?i)password[^\n]*:\s*$")
                .expect("static regex pattern is valid"),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Advance on one observation. A server re-prompting after a rejected
    /// credential produces another `Send`; the driver's deadline bounds
    /// how long that can go on.
    pub fn step(&mut self, event: AuthEvent<'_>) -> AuthAction {
        match event {
            AuthEvent::Eof { exit_ok } => {
                self.state = AuthState::Done;
                AuthAction::Finish { success: exit_ok }
            }
            AuthEvent::Output(_) if self.state == AuthState::Done => AuthAction::Wait,
            AuthEvent::Output(text) => {
                // OTP first: "one-time password:" would also match the
                // password pattern.
                if self.otp_prompt.is_match(text) {
                    self.state = AuthState::OtpSent;
                    AuthAction::Send(SecretKind::Otp)
                } else if self.password_prompt.is_match(text) {
                    self.state = AuthState::PasswordSent;
                    AuthAction::Send(SecretKind::Password)
                } else {
                    AuthAction::Wait
                }
            }
        }
    }
}

impl Default for AuthAutomaton {
    fn default() -> Self {
        Self::new()
    }
}
