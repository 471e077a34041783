//! Acquire/release of the shared per-host service.
//!
//! Many unrelated processes call into this broker; the registry lock is
//! what makes their interleavings safe. Both operations run entirely
//! inside one registry transaction:
//!
//! - `acquire` checks liveness and (if needed) starts the service under
//!   the same lock, so two callers can never both observe "not running"
//!   and launch duplicates.
//! - `release` removes the consumer and decides teardown under the same
//!   lock, so a concurrent acquire can't slip in between "set is empty"
//!   and the kill.

use crate::error::Result;
use crate::process::ProcessControl;
use crate::queue::{self, QueueStatus};
use crate::registry::{HostKey, Outcome, Registry, ServiceFlavor, ServiceRecord};
use std::sync::Arc;

/// Where a consumer reaches its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Pid of the service process; `None` for user-managed instances.
    pub pid: Option<u32>,
    pub port: u16,
}

/// What `release` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other consumers remain; the service stays up.
    StillInUse,
    /// The consumer set is empty but the queue still shows related work;
    /// the service stays up for the next release to re-evaluate.
    QueueBusy,
    /// Last consumer gone and the queue is quiet: service terminated,
    /// record deleted.
    Stopped,
    /// No record existed for this host key.
    NotRegistered,
}

pub struct ServiceBroker {
    registry: Registry,
    queue: Arc<dyn QueueStatus>,
    process: Arc<dyn ProcessControl>,
}

impl ServiceBroker {
    pub fn new(
        registry: Registry,
        queue: Arc<dyn QueueStatus>,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            registry,
            queue,
            process,
        }
    }

    /// Register `consumer` against the service for `key`, starting it via
    /// `start` when no live instance exists.
    ///
    /// `start` runs with the registry lock held; it must only do local
    /// work (allocate a port, write a config file, spawn the binary) and
    /// never touch the network. If it fails, the transaction rolls back
    /// and no record is written.
    pub fn acquire(
        &self,
        key: &HostKey,
        consumer: &str,
        start: impl FnOnce() -> Result<ServiceEndpoint>,
    ) -> Result<ServiceEndpoint> {
        self.registry.with_transaction(key, |current| {
            let live = current.filter(|record| self.record_is_live(key, record));

            match live {
                Some(mut record) => {
                    record.consumers.insert(consumer.to_string());
                    let endpoint = ServiceEndpoint {
                        pid: record.pid,
                        port: record.port,
                    };
                    tracing::debug!(
                        key = %key,
                        consumer,
                        port = endpoint.port,
                        consumers = record.consumers.len(),
                        "joined running service"
                    );
                    Ok((Outcome::Keep(record), endpoint))
                }
                None => {
                    let endpoint = start()?;
                    let mut record = ServiceRecord::new(endpoint.pid, endpoint.port);
                    record.consumers.insert(consumer.to_string());
                    tracing::info!(
                        key = %key,
                        consumer,
                        pid = ?endpoint.pid,
                        port = endpoint.port,
                        "started service"
                    );
                    Ok((Outcome::Keep(record), endpoint))
                }
            }
        })
    }

    /// Drop `consumer` from the service for `key`; tear the service down
    /// when it was the last one and the queue shows no related work.
    ///
    /// Releasing a consumer that is not in the set is a no-op on
    /// membership, so a retried release can never double-decrement.
    pub fn release(&self, key: &HostKey, consumer: &str) -> Result<ReleaseOutcome> {
        self.registry.with_transaction(key, |current| {
            let Some(mut record) = current else {
                tracing::debug!(key = %key, consumer, "release without record");
                return Ok((Outcome::Delete, ReleaseOutcome::NotRegistered));
            };

            record.consumers.remove(consumer);

            if !record.consumers.is_empty() {
                tracing::debug!(
                    key = %key,
                    consumer,
                    remaining = record.consumers.len(),
                    "released; service still in use"
                );
                return Ok((Outcome::Keep(record), ReleaseOutcome::StillInUse));
            }

            if !queue::is_quiescent(self.queue.as_ref()) {
                tracing::info!(
                    key = %key,
                    consumer,
                    "consumer set empty but queue shows related work; keeping service"
                );
                return Ok((Outcome::Keep(record), ReleaseOutcome::QueueBusy));
            }

            if key.flavor() == ServiceFlavor::Managed {
                if let Some(pid) = record.pid {
                    if self.process.is_alive(pid) {
                        self.process.kill(pid)?;
                    }
                    tracing::info!(key = %key, pid, "terminated idle service");
                }
            }
            Ok((Outcome::Delete, ReleaseOutcome::Stopped))
        })
    }

    /// A record counts as live unless we can prove otherwise. Proof is
    /// only possible on the host that owns the pid; elsewhere the record
    /// is trusted optimistically (the owning host self-heals on its next
    /// transaction).
    fn record_is_live(&self, key: &HostKey, record: &ServiceRecord) -> bool {
        match key.flavor() {
            ServiceFlavor::Custom => true,
            ServiceFlavor::Managed => {
                if !key.is_local() {
                    return true;
                }
                match record.pid {
                    Some(pid) => self.process.is_alive(pid),
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::queue::{QueueJob, QueueStatus};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    /// Process table the tests fully control.
    #[derive(Default)]
    struct FakeProcesses {
        alive: Mutex<BTreeSet<u32>>,
        killed: Mutex<Vec<u32>>,
    }

    impl FakeProcesses {
        fn spawn(&self, pid: u32) {
            self.alive.lock().insert(pid);
        }
        fn die(&self, pid: u32) {
            self.alive.lock().remove(&pid);
        }
        fn killed(&self) -> Vec<u32> {
            self.killed.lock().clone()
        }
    }

    impl ProcessControl for FakeProcesses {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }
        fn kill(&self, pid: u32) -> Result<()> {
            self.alive.lock().remove(&pid);
            self.killed.lock().push(pid);
            Ok(())
        }
    }

    struct FakeQueue {
        jobs: Mutex<Vec<QueueJob>>,
    }

    impl FakeQueue {
        fn quiet() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
            }
        }
        fn set_jobs(&self, jobs: Vec<QueueJob>) {
            *self.jobs.lock() = jobs;
        }
    }

    impl QueueStatus for FakeQueue {
        fn list_active_jobs(&self) -> Result<Vec<QueueJob>> {
            Ok(self.jobs.lock().clone())
        }
    }

    struct DownQueue;
    impl QueueStatus for DownQueue {
        fn list_active_jobs(&self) -> Result<Vec<QueueJob>> {
            Err(Error::Queue("controller unreachable".to_string()))
        }
    }

    fn local_key() -> HostKey {
        HostKey::local(ServiceFlavor::Managed).unwrap()
    }

    fn broker_with(
        dir: &TempDir,
        queue: Arc<dyn QueueStatus>,
        processes: Arc<FakeProcesses>,
    ) -> ServiceBroker {
        ServiceBroker::new(Registry::open(dir.path()), queue, processes)
    }

    #[test]
    fn second_acquire_joins_instead_of_starting() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        let first = broker
            .acquire(&key, "job-1", || {
                processes.spawn(100);
                Ok(ServiceEndpoint {
                    pid: Some(100),
                    port: 21010,
                })
            })
            .unwrap();

        let second = broker
            .acquire(&key, "job-2", || {
                panic!("service is live; start must not be called");
            })
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn failed_start_leaves_no_record() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        let result = broker.acquire(&key, "job-1", || {
            Err(Error::Process("binary missing".to_string()))
        });
        assert!(result.is_err());

        // The rollback means the next acquire starts fresh.
        let endpoint = broker
            .acquire(&key, "job-1", || {
                processes.spawn(101);
                Ok(ServiceEndpoint {
                    pid: Some(101),
                    port: 21011,
                })
            })
            .unwrap();
        assert_eq!(endpoint.pid, Some(101));
    }

    #[test]
    fn stale_record_recovers_with_fresh_service() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        broker
            .acquire(&key, "job-1", || {
                processes.spawn(100);
                Ok(ServiceEndpoint {
                    pid: Some(100),
                    port: 21010,
                })
            })
            .unwrap();

        // The service dies without anyone calling release.
        processes.die(100);

        let endpoint = broker
            .acquire(&key, "job-2", || {
                processes.spawn(200);
                Ok(ServiceEndpoint {
                    pid: Some(200),
                    port: 21020,
                })
            })
            .unwrap();
        assert_eq!(endpoint.pid, Some(200));
        assert_eq!(endpoint.port, 21020);
    }

    #[test]
    fn refcount_reaches_zero_then_stops() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        for consumer in ["job-1", "job-2", "job-3"] {
            broker
                .acquire(&key, consumer, || {
                    processes.spawn(100);
                    Ok(ServiceEndpoint {
                        pid: Some(100),
                        port: 21010,
                    })
                })
                .unwrap();
        }

        assert_eq!(
            broker.release(&key, "job-2").unwrap(),
            ReleaseOutcome::StillInUse
        );
        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::StillInUse
        );
        assert!(processes.is_alive(100));

        assert_eq!(
            broker.release(&key, "job-3").unwrap(),
            ReleaseOutcome::Stopped
        );
        assert_eq!(processes.killed(), vec![100]);

        // Record gone: a further release finds nothing.
        assert_eq!(
            broker.release(&key, "job-3").unwrap(),
            ReleaseOutcome::NotRegistered
        );
    }

    #[test]
    fn duplicate_acquire_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        for _ in 0..2 {
            broker
                .acquire(&key, "job-1", || {
                    processes.spawn(100);
                    Ok(ServiceEndpoint {
                        pid: Some(100),
                        port: 21010,
                    })
                })
                .unwrap();
        }

        // One release suffices: the consumer registered once.
        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::Stopped
        );
    }

    #[test]
    fn release_of_unknown_consumer_does_not_double_decrement() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = local_key();

        broker
            .acquire(&key, "job-1", || {
                processes.spawn(100);
                Ok(ServiceEndpoint {
                    pid: Some(100),
                    port: 21010,
                })
            })
            .unwrap();
        broker
            .acquire(&key, "job-2", || unreachable!())
            .unwrap();

        // "job-x" was never a consumer; membership must be untouched.
        assert_eq!(
            broker.release(&key, "job-x").unwrap(),
            ReleaseOutcome::StillInUse
        );
        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::StillInUse
        );
        assert_eq!(
            broker.release(&key, "job-2").unwrap(),
            ReleaseOutcome::Stopped
        );
    }

    #[test]
    fn queue_activity_overrides_empty_consumer_set() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let queue = Arc::new(FakeQueue::quiet());
        let broker = broker_with(&dir, queue.clone(), processes.clone());
        let key = local_key();

        broker
            .acquire(&key, "job-1", || {
                processes.spawn(100);
                Ok(ServiceEndpoint {
                    pid: Some(100),
                    port: 21010,
                })
            })
            .unwrap();

        queue.set_jobs(vec![QueueJob {
            id: "1201".to_string(),
            name: crate::queue::marker_job_name("other-job"),
            state: "R".to_string(),
        }]);

        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::QueueBusy
        );
        assert!(processes.is_alive(100), "service must survive a busy queue");

        // Queue drains; the next release tears the service down even
        // though the releasing consumer is long gone from the set.
        queue.set_jobs(Vec::new());
        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::Stopped
        );
        assert_eq!(processes.killed(), vec![100]);
    }

    #[test]
    fn unreachable_queue_keeps_service_alive() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(DownQueue), processes.clone());
        let key = local_key();

        broker
            .acquire(&key, "job-1", || {
                processes.spawn(100);
                Ok(ServiceEndpoint {
                    pid: Some(100),
                    port: 21010,
                })
            })
            .unwrap();

        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::QueueBusy
        );
        assert!(processes.is_alive(100));
        assert!(processes.killed().is_empty());
    }

    #[test]
    fn custom_flavor_skips_process_management() {
        let dir = TempDir::new().unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let broker = broker_with(&dir, Arc::new(FakeQueue::quiet()), processes.clone());
        let key = HostKey::local(ServiceFlavor::Custom).unwrap();

        let endpoint = broker
            .acquire(&key, "job-1", || {
                Ok(ServiceEndpoint {
                    pid: None,
                    port: 7890,
                })
            })
            .unwrap();
        assert_eq!(endpoint.port, 7890);

        assert_eq!(
            broker.release(&key, "job-1").unwrap(),
            ReleaseOutcome::Stopped
        );
        assert!(
            processes.killed().is_empty(),
            "custom instances are never killed"
        );
    }
}
