//! Master-worker haproxy driver
//!
//! haproxy started with `-W` keeps a master process that never goes away;
//! `SIGUSR2` makes it re-read the configuration and respawn its workers. A
//! reload in this mode is therefore a signal, not a spawn, and the master
//! pid is stable across any number of reloads.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{info, warn};

use super::{process_alive, HaproxyServer};
use crate::error::ReloadError;

/// Driver for haproxy in master-worker (`-W`) mode
pub struct HaproxyMasterWorker {
    binary: PathBuf,
    pidfile: PathBuf,
    config_file: PathBuf,
    // Some(pid) iff the master is expected to be running
    master: Arc<parking_lot::Mutex<Option<i32>>>,
}

impl HaproxyMasterWorker {
    pub fn new(
        binary: impl Into<PathBuf>,
        pidfile: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            pidfile: pidfile.into(),
            config_file: config_file.into(),
            master: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Pid of the tracked master process, if one is expected to be running.
    #[must_use]
    pub fn master_pid(&self) -> Option<i32> {
        *self.master.lock()
    }
}

#[async_trait]
impl HaproxyServer for HaproxyMasterWorker {
    async fn start(&self) -> Result<(), ReloadError> {
        if self.is_running() {
            return Err(ReloadError::AlreadyRunning);
        }

        let mut child = Command::new(&self.binary)
            .arg("-W")
            .arg("-f")
            .arg(&self.config_file)
            .arg("-p")
            .arg(&self.pidfile)
            .spawn()
            .map_err(ReloadError::Spawn)?;

        let Some(pid) = child.id() else {
            return Err(ReloadError::Spawn(io::Error::other(
                "master exited before its pid could be read",
            )));
        };
        let pid = pid as i32;
        *self.master.lock() = Some(pid);
        info!("haproxy master started with pid {pid}");

        // The waiter owns the child; it clears the handle when the master
        // goes away so is_running degrades cleanly.
        let master = Arc::clone(&self.master);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!("haproxy master finished"),
                Ok(status) => warn!("haproxy master finished with {status}"),
                Err(e) => warn!("couldn't wait for haproxy master: {e}"),
            }
            let mut guard = master.lock();
            if *guard == Some(pid) {
                *guard = None;
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ReloadError> {
        let pid = self.master.lock().take();
        let Some(pid) = pid else {
            return Err(ReloadError::NotRunning);
        };
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| ReloadError::signal(pid, e.to_string()))
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        let pid = self.master_pid();
        match pid {
            Some(pid) if process_alive(pid) => kill(Pid::from_raw(pid), Signal::SIGUSR2)
                .map_err(|e| ReloadError::signal(pid, e.to_string())),
            // Master gone (or never started): degrade to a fresh start.
            _ => self.start().await,
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.master_pid(), Some(pid) if process_alive(pid))
    }

    fn pids(&self) -> Vec<i32> {
        // The master survives reloads; there is never anything to reap.
        Vec::new()
    }
}
