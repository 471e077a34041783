//! Batch-queue visibility.
//!
//! The broker's consumer set is the primary bookkeeping; the queue is the
//! safety net. Before killing a shared service, the broker asks the
//! scheduler itself whether any slink-submitted job is still alive: a job
//! that died without calling release, or that sits in COMPLETING while the
//! scheduler reaps it, must keep the service up.

use crate::error::{Error, Result};
use std::process::Command;

/// Compact state the scheduler reports for a job on its way out.
const TERMINAL_STATES: &[&str] = &["CG", "COMPLETING"];

/// Jobs submitted with the proxy enabled carry a marker name so the
/// quiescence check can recognize them in the queue listing.
pub fn marker_job_name(identifier: &str) -> String {
    format!("__slink_{}__", identifier)
}

/// Extract the identifier from a marker job name, if it is one.
pub fn parse_marker(name: &str) -> Option<&str> {
    let inner = name.strip_prefix("__slink_")?.strip_suffix("__")?;
    (!inner.is_empty()).then_some(inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJob {
    pub id: String,
    pub name: String,
    pub state: String,
}

impl QueueJob {
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATES.contains(&self.state.as_str())
    }
}

/// Read-only view of the scheduler's queue.
pub trait QueueStatus: Send + Sync {
    /// Jobs currently visible in the queue for this user.
    fn list_active_jobs(&self) -> Result<Vec<QueueJob>>;

    /// The job id of the calling process, when it runs inside an
    /// allocation. Used to exclude the caller from its own quiescence
    /// check.
    fn own_job_id(&self) -> Option<String> {
        None
    }
}

/// The real scheduler, via `squeue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Squeue;

impl QueueStatus for Squeue {
    fn list_active_jobs(&self) -> Result<Vec<QueueJob>> {
        let output = Command::new("squeue")
            .args(["--me", "--noheader", "-O", "JobID:64,Name:128,StateCompact:16"])
            .output()
            .map_err(|e| Error::Queue(format!("failed to run squeue: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Queue(format!(
                "squeue exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_squeue_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn own_job_id(&self) -> Option<String> {
        std::env::var("SLURM_JOB_ID").ok()
    }
}

fn parse_squeue_output(text: &str) -> Vec<QueueJob> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?;
            let name = fields.next()?;
            let state = fields.next()?;
            Some(QueueJob {
                id: id.to_string(),
                name: name.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// True when no slink-marked job other than the caller's own is still live.
///
/// An unreachable queue reports *not* quiescent: destroying a shared
/// service on a guess is worse than leaving it for the next release.
pub fn is_quiescent(queue: &dyn QueueStatus) -> bool {
    match queue.list_active_jobs() {
        Ok(jobs) => {
            let own = queue.own_job_id();
            !jobs.iter().any(|job| {
                parse_marker(&job.name).is_some()
                    && !job.is_terminal()
                    && own.as_deref() != Some(job.id.as_str())
            })
        }
        Err(e) => {
            tracing::warn!("Queue status unavailable, treating as busy: {}", e);
            false
        }
    }
}
