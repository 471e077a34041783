//! Free-port allocation with cross-process reservation locks.
//!
//! Binding a test socket proves a port is free *now*; it says nothing about
//! the window between closing the test socket and the real service binding
//! it. The allocator closes that window with a lock file named after the
//! port: whoever holds `port_<n>` owns the number until the reservation is
//! confirmed or dropped, so two concurrent allocators can never hand out
//! the same port, even across unrelated processes.

use crate::error::{Error, Result};
use crate::lock::FileLock;
use rand::Rng;
use std::net::TcpListener;
use std::path::PathBuf;

/// Candidate probes before giving up on the range.
const MAX_ATTEMPTS: u32 = 512;

/// A provisionally reserved port. The reservation lives exactly as long as
/// this value: call [`confirm`](PortReservation::confirm) once the real
/// service has bound the port, or drop it to return the port to the pool.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    lock: Option<FileLock>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The service now holds the port by having bound it; the lock file has
    /// done its job and is released.
    pub fn confirm(mut self) {
        self.lock.take();
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    scratch_dir: PathBuf,
}

impl PortAllocator {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }

    /// Find and reserve one free port in `low..=high`.
    pub fn allocate(&self, low: u16, high: u16) -> Result<PortReservation> {
        if low == 0 || low > high {
            return Err(Error::Config(format!(
                "invalid port range [{}, {}]",
                low, high
            )));
        }
        std::fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create scratch directory {}: {}",
                self.scratch_dir.display(),
                e
            ))
        })?;

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let candidate: u16 = rng.gen_range(low..=high);

            // Port already bound by someone: try the next candidate.
            let sock = match TcpListener::bind(("0.0.0.0", candidate)) {
                Ok(s) => s,
                Err(_) => continue,
            };

            let lock_path = self.scratch_dir.join(format!("port_{}", candidate));
            match FileLock::try_acquire(&lock_path)? {
                Some(lock) => {
                    // Free the test socket for the real listener; the lock
                    // keeps other allocators off this number until the
                    // caller confirms.
                    drop(sock);
                    tracing::debug!(port = candidate, "reserved free port");
                    return Ok(PortReservation {
                        port: candidate,
                        lock: Some(lock),
                    });
                }
                // Another allocator got here first, between our bind and
                // its own confirm.
                None => drop(sock),
            }
        }

        Err(Error::PortExhausted {
            low,
            high,
            attempts: MAX_ATTEMPTS,
        })
    }
}
