//! Reload state machine
//!
//! Any number of concurrent reload triggers collapse into at most one queued
//! follow-up, and at most one physical reload runs at a time:
//!
//! ```text
//! From       Event             To          Action
//! Idle       reload requested  Reloading   run physical reload
//! Reloading  reload requested  Waiting     remember follow-up
//! Waiting    reload requested  Waiting     drop (collapsed)
//! Reloading  reload finished   Idle        —
//! Waiting    reload finished   Reloading   run physical reload again
//! ```
//!
//! Two locks with distinct jobs: the state mutex serialises the table above
//! and is never held across I/O; the serial reload lock covers the whole
//! capture → spawn → release pipeline. A caller whose request moved the
//! state to `Waiting` is already queued on the serial lock and performs the
//! follow-up run itself once the in-flight reload finishes, so no caller
//! returns before the spawn its request triggered has completed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::ReloadError;
use crate::haproxy::{process_alive, HaproxyServer};
use crate::netqueue::NetQueue;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Give up waiting on an old process after this long; a worker still serving
/// after the timeout is draining a very long-lived connection.
const REAP_TIMEOUT: Duration = Duration::from_secs(300);

/// Position of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    Reloading,
    Waiting,
}

/// Driver-agnostic reload coordinator
pub struct ReloadController {
    state: Mutex<ReloadState>,
    reload_lock: tokio::sync::Mutex<()>,
    haproxy: Arc<dyn HaproxyServer>,
    net_queue: Arc<dyn NetQueue>,
}

impl ReloadController {
    pub fn new(haproxy: Arc<dyn HaproxyServer>, net_queue: Arc<dyn NetQueue>) -> Self {
        Self {
            state: Mutex::new(ReloadState::Idle),
            reload_lock: tokio::sync::Mutex::new(()),
            haproxy,
            net_queue,
        }
    }

    /// Current state. Mostly useful to assert the machine returned to
    /// [`ReloadState::Idle`].
    #[must_use]
    pub fn state(&self) -> ReloadState {
        *self.state.lock()
    }

    /// Trigger a reload.
    ///
    /// Collapsed requests return `Ok` immediately: a follow-up reload that
    /// will observe their trigger is already queued. Accepted requests block
    /// until their own physical reload has completed.
    ///
    /// # Errors
    ///
    /// Returns the driver failure (spawn error, non-zero exit, timeout) or a
    /// hold-queue failure. The state machine advances regardless.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        if !self.request() {
            return Ok(());
        }
        let _serial = self.reload_lock.lock().await;
        let result = self.run_physical().await;
        self.finish();
        result
    }

    /// Advance on an external trigger; false means collapsed.
    fn request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ReloadState::Idle => {
                *state = ReloadState::Reloading;
                true
            }
            ReloadState::Reloading => {
                *state = ReloadState::Waiting;
                true
            }
            ReloadState::Waiting => false,
        }
    }

    /// Advance on physical-reload completion.
    fn finish(&self) {
        let mut state = self.state.lock();
        match *state {
            ReloadState::Idle => {}
            ReloadState::Reloading => *state = ReloadState::Idle,
            ReloadState::Waiting => *state = ReloadState::Reloading,
        }
    }

    async fn run_physical(&self) -> Result<(), ReloadError> {
        let old_pids = self.haproxy.pids();
        let start = Instant::now();

        self.net_queue.capture().await?;
        let reloaded = self.haproxy.reload().await;
        // The capture window must never outlive its reload.
        if let Err(e) = self.net_queue.release().await {
            warn!("couldn't release connection hold queue: {e}");
        }

        self.reap(old_pids);
        reloaded?;

        info!("Reload took {:?}", start.elapsed());
        if let Some(pid) = self.haproxy.pids().first() {
            info!("haproxy reloaded with pid {pid}");
        }
        Ok(())
    }

    /// Watch each replaced pid until it exits; detached, never blocks the
    /// state machine.
    fn reap(&self, old_pids: Vec<i32>) {
        for pid in old_pids {
            tokio::spawn(async move {
                if !process_alive(pid) {
                    warn!("old process {pid} already gone");
                    return;
                }
                let deadline = Instant::now() + REAP_TIMEOUT;
                loop {
                    tokio::time::sleep(REAP_POLL_INTERVAL).await;
                    if !process_alive(pid) {
                        info!("Old process with pid {pid} finished");
                        return;
                    }
                    if Instant::now() >= deadline {
                        warn!("old process {pid} still running after {REAP_TIMEOUT:?}");
                        return;
                    }
                }
            });
        }
    }
}
