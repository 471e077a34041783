//! # slink
//!
//! A SLURM job launcher that wraps arbitrary commands with allocation
//! flags and, when asked, routes their traffic through a shared per-host
//! proxy service.
//!
//! ## The broker
//!
//! Many independently launched processes (the interactive launcher plus
//! any number of batch jobs, possibly on other hosts) share one proxy
//! process per submit host. They coordinate through nothing but a
//! file-lock-protected JSON registry on the shared home directory:
//!
//! - [`port::PortAllocator`] reserves a free TCP port with a lock file so
//!   concurrent allocators never collide.
//! - [`process`] launches the service detached and controls it by pid.
//! - [`registry::Registry`] linearizes all record mutation under one
//!   advisory file lock.
//! - [`broker::ServiceBroker`] reference-counts consumers, self-heals
//!   stale records, and tears the service down only when the consumer set
//!   is empty *and* the batch queue shows no related work.
//! - [`tunnel::TunnelAgent`] bridges the service port to a compute node's
//!   loopback over ssh, driving interactive authentication prompts when
//!   key auth is not an option.
//!
//! ## Everything else
//!
//! [`submit`] renders `srun`/`sbatch` invocations and job scripts,
//! [`provision`] fetches the proxy binary and geo database, [`config`]
//! holds the typed settings, and [`queue`] wraps `squeue`.

pub mod broker;
pub mod config;
pub mod error;
pub mod lock;
pub mod port;
pub mod process;
pub mod provision;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod submit;
pub mod tunnel;

pub use broker::{ReleaseOutcome, ServiceBroker, ServiceEndpoint};
pub use config::Settings;
pub use error::{Error, Result};
pub use registry::{HostKey, Registry, ServiceFlavor, ServiceRecord};
