//! Active hold queue backed by a kernel NFQUEUE
//!
//! The kernel binding is a synchronous netlink socket, so everything that
//! touches it runs on one dedicated drain thread: the packet pump, the
//! iptables window management and the verdicts. The async side coordinates
//! with the thread over three channels forming the `capture` → `capturing`
//! → `release` ping-pong.
//!
//! Two counts matter during drain and they are not interchangeable. The
//! kernel's `waiting` counter says whether packets are still pending a
//! verdict, but it lags user space by at least one read; consuming by it
//! would block on packets that never arrived. The number of packets already
//! pulled into the in-process buffer is the authoritative amount to consume
//! per round.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nfq::{Queue, Verdict};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ipv4_targets, NetQueue};
use crate::error::NetQueueError;
use crate::iptables;
use crate::proc::ProcNetfilter;

/// Upper bound on packets buffered in-process; the kernel queue is sized to
/// match, so overflow shows up in its `queue_dropped` counter.
pub const MAX_PACKETS_IN_QUEUE: usize = 65_536;

/// Poll cadence while idle between capture windows
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Poll cadence inside a capture window and during drain
const CAPTURE_POLL: Duration = Duration::from_millis(1);

/// Hold queue bound to a kernel NFQUEUE id
pub struct NetfilterQueue {
    queue_num: u16,
    capture_tx: mpsc::Sender<()>,
    capturing_rx: tokio::sync::Mutex<mpsc::Receiver<Result<(), NetQueueError>>>,
    release_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    buffered: Arc<AtomicI64>,
    thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl NetfilterQueue {
    /// Bind the kernel queue and start the drain thread.
    ///
    /// The packet pump starts immediately so that SYNs arriving while the
    /// first capture window's rule is being installed are never lost.
    ///
    /// # Errors
    ///
    /// Returns [`NetQueueError::Bind`] if the NFQUEUE cannot be bound or the
    /// kernel statistics file is unavailable. Both are fatal: without them
    /// the hold guarantee cannot be provided.
    pub fn bind(queue_num: u16, ips: Vec<IpAddr>) -> Result<Self, NetQueueError> {
        let mut queue =
            Queue::open().map_err(|e| NetQueueError::bind(queue_num, e.to_string()))?;
        queue
            .bind(queue_num)
            .map_err(|e| NetQueueError::bind(queue_num, e.to_string()))?;
        // the kernel's default queue length is far smaller than our buffer
        let _ = queue.set_queue_max_len(queue_num, MAX_PACKETS_IN_QUEUE as u32);
        queue.set_nonblocking(true);

        let proc_nf = ProcNetfilter::new().map_err(|e| {
            NetQueueError::bind(queue_num, format!("netfilter stats unavailable: {e}"))
        })?;

        let (capture_tx, capture_rx) = mpsc::channel(1);
        let (capturing_tx, capturing_rx) = mpsc::channel(1);
        let (release_tx, release_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let buffered = Arc::new(AtomicI64::new(0));

        let drain = DrainLoop {
            queue,
            queue_num,
            targets: ipv4_targets(&ips),
            proc: proc_nf,
            buffer: VecDeque::new(),
            buffered: Arc::clone(&buffered),
            capture_rx,
            capturing_tx,
            release_rx,
            cancel: cancel.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("netqueue-{queue_num}"))
            .spawn(move || drain.run())
            .map_err(|e| NetQueueError::bind(queue_num, e.to_string()))?;

        Ok(Self {
            queue_num,
            capture_tx,
            capturing_rx: tokio::sync::Mutex::new(capturing_rx),
            release_tx,
            cancel,
            buffered,
            thread: parking_lot::Mutex::new(Some(handle)),
        })
    }

    /// Kernel queue id this instance is bound to
    #[must_use]
    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    /// Packets currently held in the in-process buffer
    #[must_use]
    pub fn buffered(&self) -> i64 {
        self.buffered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NetQueue for NetfilterQueue {
    async fn capture(&self) -> Result<(), NetQueueError> {
        self.capture_tx
            .send(())
            .await
            .map_err(|_| NetQueueError::Closed)?;
        let mut capturing = self.capturing_rx.lock().await;
        match capturing.recv().await {
            Some(result) => result,
            None => Err(NetQueueError::Closed),
        }
    }

    async fn release(&self) -> Result<(), NetQueueError> {
        self.release_tx
            .send(())
            .await
            .map_err(|_| NetQueueError::Closed)
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        debug!("netfilter queue {} stopped", self.queue_num);
    }
}

/// State owned by the drain thread
struct DrainLoop {
    queue: Queue,
    queue_num: u16,
    targets: Vec<Ipv4Addr>,
    proc: ProcNetfilter,
    buffer: VecDeque<nfq::Message>,
    buffered: Arc<AtomicI64>,
    capture_rx: mpsc::Receiver<()>,
    capturing_tx: mpsc::Sender<Result<(), NetQueueError>>,
    release_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl DrainLoop {
    fn run(mut self) {
        debug!("drain loop started for netfilter queue {}", self.queue_num);
        let mut last_queue_dropped = 0u64;
        let mut last_user_dropped = 0u64;

        loop {
            // Idle: keep the pump warm while waiting for a capture request.
            let got_capture = loop {
                if self.cancel.is_cancelled() {
                    break false;
                }
                match self.capture_rx.try_recv() {
                    Ok(()) => break true,
                    Err(TryRecvError::Empty) => {
                        self.pump();
                        std::thread::sleep(IDLE_POLL);
                    }
                    Err(TryRecvError::Disconnected) => break false,
                }
            };
            if !got_capture {
                break;
            }

            if let Err(e) = self.install_rules() {
                error!("couldn't install hold rules: {e}");
                let _ = self.capturing_tx.blocking_send(Err(e));
                continue;
            }
            if self.capturing_tx.blocking_send(Ok(())).is_err() {
                self.remove_rules();
                break;
            }

            let window = Instant::now();
            let released = loop {
                if self.cancel.is_cancelled() {
                    break false;
                }
                match self.release_rx.try_recv() {
                    Ok(()) => break true,
                    Err(TryRecvError::Empty) => {
                        if !self.pump() {
                            std::thread::sleep(CAPTURE_POLL);
                        }
                    }
                    Err(TryRecvError::Disconnected) => break false,
                }
            };
            // Rules come out on every exit path, released or not.
            self.remove_rules();

            let delayed = self.drain();
            info!(
                "Delayed {delayed} packets during reload window ({:?})",
                window.elapsed()
            );
            self.report_drops(&mut last_queue_dropped, &mut last_user_dropped);

            if !released {
                break;
            }
        }
        self.shutdown();
    }

    /// Pull everything the kernel has ready into the in-process buffer.
    /// Returns whether any packet arrived.
    fn pump(&mut self) -> bool {
        let mut any = false;
        while self.buffer.len() < MAX_PACKETS_IN_QUEUE {
            match self.queue.recv() {
                Ok(msg) => {
                    self.buffer.push_back(msg);
                    self.buffered.fetch_add(1, Ordering::Relaxed);
                    any = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("couldn't read from netfilter queue {}: {e}", self.queue_num);
                    break;
                }
            }
        }
        any
    }

    fn install_rules(&self) -> Result<(), NetQueueError> {
        let mut installed = Vec::with_capacity(self.targets.len());
        for ip in &self.targets {
            match iptables::append_rule(*ip, self.queue_num) {
                Ok(()) => installed.push(*ip),
                Err(e) => {
                    for prev in installed {
                        if let Err(del) = iptables::delete_rule(prev, self.queue_num) {
                            error!("couldn't roll back hold rule for {prev}: {del}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn remove_rules(&self) {
        for ip in &self.targets {
            if let Err(e) = iptables::delete_rule(*ip, self.queue_num) {
                error!("couldn't remove hold rule for {ip}: {e}");
            }
        }
    }

    /// Accept held packets until the kernel reports none waiting.
    ///
    /// Each round consumes exactly the buffered count, then re-reads the
    /// kernel counters. Consuming by the kernel's `waiting` would deadlock:
    /// it can report packets the pump has not received yet.
    fn drain(&mut self) -> u64 {
        let mut total = 0u64;
        loop {
            if let Err(e) = self.proc.refresh() {
                warn!("Couldn't update netfilter queue stats: {e}");
                total += self.accept_buffered();
                break;
            }
            let waiting = self.proc.get(self.queue_num).map_or(0, |q| q.waiting);
            if waiting == 0 {
                break;
            }
            self.pump();
            let accepted = self.accept_buffered();
            total += accepted;
            if accepted == 0 {
                std::thread::sleep(CAPTURE_POLL);
            }
        }
        total
    }

    /// Verdict-accept everything currently buffered, FIFO.
    fn accept_buffered(&mut self) -> u64 {
        let count = self.buffered.load(Ordering::Relaxed).max(0) as usize;
        let count = count.min(self.buffer.len());
        let mut accepted = 0u64;
        while accepted < count as u64 {
            let Some(mut msg) = self.buffer.pop_front() else {
                break;
            };
            msg.set_verdict(Verdict::Accept);
            if let Err(e) = self.queue.verdict(msg) {
                warn!("couldn't set verdict on held packet: {e}");
            }
            accepted += 1;
        }
        self.buffered.fetch_sub(accepted as i64, Ordering::Relaxed);
        accepted
    }

    fn report_drops(&self, last_queue_dropped: &mut u64, last_user_dropped: &mut u64) {
        let Some(counters) = self.proc.get(self.queue_num) else {
            return;
        };
        if counters.queue_dropped > *last_queue_dropped {
            warn!(
                "Dropped {} packets due to full kernel queue",
                counters.queue_dropped - *last_queue_dropped
            );
            *last_queue_dropped = counters.queue_dropped;
        }
        if counters.user_dropped > *last_user_dropped {
            warn!(
                "Dropped {} packets before reaching user space",
                counters.user_dropped - *last_user_dropped
            );
            *last_user_dropped = counters.user_dropped;
        }
    }

    fn shutdown(&mut self) {
        let remaining = self.accept_buffered();
        if remaining > 0 {
            info!("Accepted {remaining} held packets at shutdown");
        }
        if let Err(e) = self.queue.unbind(self.queue_num) {
            debug!("couldn't unbind netfilter queue {}: {e}", self.queue_num);
        }
    }
}
