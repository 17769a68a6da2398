//! Daemonized haproxy driver
//!
//! Reloads in this mode respawn haproxy: the new instance receives
//! `-sf <old-pids>` and asks the previous workers to finish their
//! connections and exit. The foreground spawn terminates quickly on success
//! because haproxy daemonizes; the daemonized workers register themselves in
//! the pidfile (one pid per worker when `nbproc > 1`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::warn;

use super::{process_alive, HaproxyServer};
use crate::error::ReloadError;

/// Ceiling on the spawn wall time during start and reload
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Parse a pidfile body: whitespace-separated decimal pids, anything else
/// ignored.
#[must_use]
pub fn parse_pids(contents: &str) -> Vec<i32> {
    contents
        .split_whitespace()
        .filter_map(|token| token.parse::<i32>().ok())
        .collect()
}

/// Driver for daemonized haproxy
pub struct HaproxyDaemon {
    binary: PathBuf,
    pidfile: PathBuf,
    config_file: PathBuf,
    spawn_timeout: Duration,
}

impl HaproxyDaemon {
    pub fn new(
        binary: impl Into<PathBuf>,
        pidfile: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            pidfile: pidfile.into(),
            config_file: config_file.into(),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }

    /// Override the spawn ceiling (mainly for tests).
    #[must_use]
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Read the live worker pids from the pidfile.
    ///
    /// # Errors
    ///
    /// [`ReloadError::Pidfile`] when the pidfile cannot be read.
    pub fn read_pids(&self) -> Result<Vec<i32>, ReloadError> {
        let contents = std::fs::read_to_string(&self.pidfile)
            .map_err(|e| ReloadError::pidfile(self.pidfile.display().to_string(), e.to_string()))?;
        Ok(parse_pids(&contents))
    }

    /// First pid from the pidfile, or 0 when none is available.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pids().first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    fn command(&self, old_pids: &[i32]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-D")
            .arg("-f")
            .arg(&self.config_file)
            .arg("-p")
            .arg(&self.pidfile);
        if !old_pids.is_empty() {
            cmd.arg("-sf");
            for pid in old_pids {
                cmd.arg(pid.to_string());
            }
        }
        cmd
    }

    async fn spawn_and_wait(&self, old_pids: &[i32]) -> Result<(), ReloadError> {
        let mut child = self.command(old_pids).spawn().map_err(ReloadError::Spawn)?;
        match tokio::time::timeout(self.spawn_timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(ReloadError::Exit { status }),
            Ok(Err(e)) => Err(ReloadError::Spawn(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("couldn't kill timed out haproxy spawn: {e}");
                }
                Err(ReloadError::Timeout {
                    seconds: self.spawn_timeout.as_secs(),
                })
            }
        }
    }
}

#[async_trait]
impl HaproxyServer for HaproxyDaemon {
    async fn start(&self) -> Result<(), ReloadError> {
        if self.is_running() {
            return Err(ReloadError::AlreadyRunning);
        }
        self.spawn_and_wait(&[]).await
    }

    async fn stop(&self) -> Result<(), ReloadError> {
        let pid = self.pid();
        if !process_alive(pid) {
            return Err(ReloadError::NotRunning);
        }
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| ReloadError::signal(pid, e.to_string()))
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        let old_pids = if self.is_running() {
            self.pids()
        } else {
            Vec::new()
        };
        self.spawn_and_wait(&old_pids).await
    }

    fn is_running(&self) -> bool {
        process_alive(self.pid())
    }

    fn pids(&self) -> Vec<i32> {
        self.read_pids().unwrap_or_default()
    }
}
