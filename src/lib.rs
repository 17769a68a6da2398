//! haproxy-supervisor: sidecar supervisor for safe haproxy reloads
//!
//! haproxy reloads by replacing itself: a fresh instance takes over the
//! listeners and the old one winds down. Between the two there is a short
//! window in which new TCP connections can be refused. This crate supervises
//! that dance:
//!
//! - a **reload state machine** collapses concurrent reload triggers into at
//!   most one queued follow-up and serialises the physical reloads;
//! - a **connection hold queue** (NFQUEUE + iptables) optionally parks new
//!   SYNs for selected destination addresses across the switchover and
//!   releases them once the new instance is up, so clients see latency
//!   instead of a reset.
//!
//! Around the core: an HTTP (or UNIX socket) reload trigger, an embedded UDP
//! syslog receiver for the proxy's logs, and two interchangeable process
//! drivers (daemonized `-sf` handover, or a persistent `-W` master signalled
//! with `SIGUSR2`).
//!
//! # Modules
//!
//! - [`config`]: flags, IP list and mode parsing
//! - [`control`]: the reload trigger endpoint
//! - [`error`]: error types
//! - [`haproxy`]: process drivers and the config check
//! - [`iptables`]: the SYN-diversion rule shim
//! - [`netqueue`]: the connection hold queue
//! - [`proc`]: kernel queue counters
//! - [`reload`]: the reload state machine
//! - [`syslog`]: the embedded syslog receiver

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod control;
pub mod error;
pub mod haproxy;
pub mod iptables;
pub mod netqueue;
pub mod proc;
pub mod reload;
pub mod syslog;

pub use config::{Config, ControlAddress, Mode};
pub use control::ControlServer;
pub use error::{
    ConfigError, ControlError, NetQueueError, ReloadError, SupervisorError, SyslogError,
};
pub use haproxy::{
    check_config, parse_pids, HaproxyDaemon, HaproxyMasterWorker, HaproxyServer,
    DEFAULT_SPAWN_TIMEOUT,
};
pub use netqueue::{new_net_queue, NetQueue, NetfilterQueue, NullNetQueue};
pub use proc::{ProcNetfilter, QueueCounters, PROC_NETFILTER_QUEUE_PATH};
pub use reload::{ReloadController, ReloadState};
pub use syslog::SyslogServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
