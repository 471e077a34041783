//! The shared service registry.
//!
//! One JSON document per broker host identity, at a well-known path under
//! the (typically shared) home directory, maps host keys to
//! [`ServiceRecord`]s. Every read-modify-write goes through
//! [`Registry::with_transaction`], which holds an exclusive file lock for
//! the duration of the closure. That lock is the only thing linearizing
//! acquire/release calls from unrelated processes, so nothing inside a
//! transaction may block on the network or another lock.
//!
//! A record's pid can only be validated on the host that owns the process;
//! a registry written on the login host and read on a compute node is
//! trusted optimistically and corrected the next time the owning host
//! transacts. The race window this leaves is bounded by cluster job
//! turnover (minutes), which the design accepts.

use crate::error::{Error, Result};
use crate::lock::FileLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DOCUMENT_NAME: &str = "services.json";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Which kind of service instance a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceFlavor {
    /// Spawned and killed by the broker.
    Managed,
    /// A user-managed instance on a fixed port; bookkeeping only.
    Custom,
}

/// Identity of one service instance: the host that runs it, suffixed for
/// the custom flavor so both can coexist in the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    host: String,
    flavor: ServiceFlavor,
}

impl HostKey {
    pub fn managed(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            flavor: ServiceFlavor::Managed,
        }
    }

    pub fn custom(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            flavor: ServiceFlavor::Custom,
        }
    }

    /// Key for the host this process runs on.
    pub fn local(flavor: ServiceFlavor) -> Result<Self> {
        let host = local_hostname()?;
        Ok(Self { host, flavor })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn flavor(&self) -> ServiceFlavor {
        self.flavor
    }

    /// Whether this key names the host we are running on, the only place
    /// pid liveness is authoritative.
    pub fn is_local(&self) -> bool {
        local_hostname().map(|h| h == self.host).unwrap_or(false)
    }

    pub fn document_key(&self) -> String {
        match self.flavor {
            ServiceFlavor::Managed => self.host.clone(),
            ServiceFlavor::Custom => format!("{}@custom", self.host),
        }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.document_key())
    }
}

pub fn local_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::Config(format!("Could not determine hostname: {}", e)))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Persisted state of one running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Pid of the service process; `None` for the custom flavor.
    pub pid: Option<u32>,

    /// TCP port the service listens on.
    pub port: u16,

    /// Job identifiers currently depending on the service. A set: adding
    /// a consumer twice is idempotent, and so is removing one.
    #[serde(default)]
    pub consumers: BTreeSet<String>,
}

impl ServiceRecord {
    pub fn new(pid: Option<u32>, port: u16) -> Self {
        Self {
            pid,
            port,
            consumers: BTreeSet::new(),
        }
    }
}

/// What a transaction closure decided to do with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Keep(ServiceRecord),
    Delete,
}

type Document = BTreeMap<String, ServiceRecord>;

#[derive(Debug, Clone)]
pub struct Registry {
    document_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl Registry {
    /// Open the registry stored in `dir` (created on first write).
    pub fn open(dir: &Path) -> Self {
        let document_path = dir.join(DOCUMENT_NAME);
        let lock_path = dir.join(format!("{}.lock", DOCUMENT_NAME));
        Self {
            document_path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Run `f` against the current record for `key` under the registry
    /// lock, then apply its decision atomically.
    ///
    /// `f` receives `None` when no record exists. An `Err` from `f` aborts
    /// the transaction: nothing is written and the lock is released, so a
    /// failed service start can never leave a record behind.
    pub fn with_transaction<T>(
        &self,
        key: &HostKey,
        f: impl FnOnce(Option<ServiceRecord>) -> Result<(Outcome, T)>,
    ) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;

        let mut document = self.read_document()?;
        let doc_key = key.document_key();
        let current = document.get(&doc_key).cloned();

        let (outcome, value) = f(current)?;

        match outcome {
            Outcome::Keep(record) => {
                document.insert(doc_key, record);
            }
            Outcome::Delete => {
                document.remove(&doc_key);
            }
        }
        self.write_document(&document)?;
        Ok(value)
    }

    /// A consistent copy of the whole document, for status display.
    pub fn snapshot(&self) -> Result<Document> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        self.read_document()
    }

    fn read_document(&self) -> Result<Document> {
        match fs::read_to_string(&self.document_path) {
            Ok(text) if text.trim().is_empty() => Ok(Document::new()),
            Ok(text) => match serde_json::from_str(&text) {
                Ok(document) => Ok(document),
                // A torn or hand-edited document means we no longer know
                // about any service; treat as empty and let liveness
                // checks rediscover reality.
                Err(e) => {
                    tracing::warn!(
                        "Registry document {} is unreadable ({}); starting fresh",
                        self.document_path.display(),
                        e
                    );
                    Ok(Document::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &Document) -> Result<()> {
        let parent = self
            .document_path
            .parent()
            .ok_or_else(|| Error::Filesystem("registry path has no parent".to_string()))?;
        fs::create_dir_all(parent)?;

        // Atomic replace: readers either see the old document or the new
        // one, never a partial write.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, document)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.document_path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
