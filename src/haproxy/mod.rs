//! haproxy process drivers
//!
//! Two interchangeable drivers share the [`HaproxyServer`] contract:
//!
//! - [`HaproxyDaemon`]: the daemonized mode. Every reload spawns a fresh
//!   instance carrying `-sf <old-pids>` so the new instance asks the old
//!   workers to finish; live pids are read from the pidfile.
//! - [`HaproxyMasterWorker`]: the `-W` mode. One persistent master process
//!   is kept across reloads and signalled with `SIGUSR2` to respawn its
//!   workers.
//!
//! The reload state machine wrapping these drivers is driver-agnostic; see
//! the `reload` module.

mod daemon;
mod master_worker;

use std::path::Path;

use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;

use crate::error::ReloadError;

pub use daemon::{parse_pids, HaproxyDaemon, DEFAULT_SPAWN_TIMEOUT};
pub use master_worker::HaproxyMasterWorker;

/// Contract shared by the haproxy drivers
#[async_trait]
pub trait HaproxyServer: Send + Sync {
    /// Spawn haproxy for the first time. Fails with
    /// [`ReloadError::AlreadyRunning`] if it is already up.
    async fn start(&self) -> Result<(), ReloadError>;

    /// Kill the tracked process.
    async fn stop(&self) -> Result<(), ReloadError>;

    /// The per-driver physical reload step: respawn with `-sf` (daemon) or
    /// signal the master with `SIGUSR2` (master-worker). Serialization and
    /// coalescing are the reload state machine's job, not the driver's.
    async fn reload(&self) -> Result<(), ReloadError>;

    /// Whether the kernel accepts a zero-signal probe to the recorded pid(s).
    fn is_running(&self) -> bool;

    /// The pids a successful reload replaces. Empty for the master-worker
    /// driver, whose master survives reloads.
    fn pids(&self) -> Vec<i32>;
}

/// Zero-signal liveness probe.
pub(crate) fn process_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Run `haproxy -c -q -f <config>` and report its output on rejection.
///
/// This is independent of the drivers; callers may use it to vet a new
/// configuration before triggering a reload.
///
/// # Errors
///
/// [`ReloadError::Check`] carries the combined stdout and stderr of the
/// failed check; [`ReloadError::Spawn`] if the binary cannot be executed.
pub async fn check_config(binary: &Path, config_file: &Path) -> Result<(), ReloadError> {
    let output = Command::new(binary)
        .arg("-c")
        .arg("-q")
        .arg("-f")
        .arg(config_file)
        .output()
        .await
        .map_err(ReloadError::Spawn)?;

    if output.status.success() {
        return Ok(());
    }
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(ReloadError::Check {
        output: combined.trim().to_string(),
    })
}
