//! Connection hold queue
//!
//! During a reload there is a short window in which neither the old nor the
//! new haproxy accepts connections. The hold queue parks incoming TCP SYNs
//! for a configured set of destination addresses across that window, then
//! releases them in order, so clients see elongated connection latency
//! instead of a reset.
//!
//! # Architecture
//!
//! ```text
//! Reload pipeline          Drain thread                    Kernel
//! ---------------          ------------                    ------
//! capture()  ──────────►   install iptables rules   ────►  SYNs diverted
//!            ◄──────────   capturing                       to NFQUEUE n
//!   (spawn new haproxy)    pump packets into buffer  ◄───
//! release()  ──────────►   delete iptables rules
//!                          accept buffered packets   ────►  SYNs proceed
//! ```
//!
//! `capture`/`release` form a strict ping-pong rendezvous; the serial reload
//! lock in the reload controller guarantees windows never nest. The packet
//! pump runs from the moment the queue is constructed, well before the first
//! capture, so SYNs arriving right as the rule is installed are never lost
//! to a full kernel queue.

mod queue;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::NetQueueError;

pub use queue::NetfilterQueue;

/// Capability set of the connection hold queue
#[async_trait]
pub trait NetQueue: Send + Sync {
    /// Start a hold window. Returns once the firewall rules are installed
    /// and new SYNs for the configured addresses are being diverted.
    async fn capture(&self) -> Result<(), NetQueueError>;

    /// End the hold window. The firewall rules are removed and the buffered
    /// packets are accepted in FIFO order; this call does not wait for the
    /// drain to complete.
    async fn release(&self) -> Result<(), NetQueueError>;

    /// Tear down the queue: cancel the drain loop, remove any rules from a
    /// window still in progress, verdict every buffered packet and close the
    /// kernel binding.
    async fn stop(&self);
}

/// Hold queue used when no IPs are configured; never touches the kernel.
#[derive(Debug, Default)]
pub struct NullNetQueue;

#[async_trait]
impl NetQueue for NullNetQueue {
    async fn capture(&self) -> Result<(), NetQueueError> {
        Ok(())
    }

    async fn release(&self) -> Result<(), NetQueueError> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// Build the hold queue for the configured IP set.
///
/// An empty set yields the [`NullNetQueue`]; otherwise the kernel queue is
/// bound immediately, which is the only fallible step.
///
/// # Errors
///
/// Returns [`NetQueueError::Bind`] when the NFQUEUE cannot be bound.
pub fn new_net_queue(
    queue_num: u16,
    ips: Vec<IpAddr>,
) -> Result<Arc<dyn NetQueue>, NetQueueError> {
    if ips.is_empty() {
        return Ok(Arc::new(NullNetQueue));
    }
    Ok(Arc::new(NetfilterQueue::bind(queue_num, ips)?))
}

/// Keep the IPv4 members of the configured set; the iptables rule shape is
/// IPv4-only, so other addresses are logged and skipped.
pub(crate) fn ipv4_targets(ips: &[IpAddr]) -> Vec<std::net::Ipv4Addr> {
    ips.iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(v6) => {
                warn!("Only IPv4 addresses supported: {v6} found");
                None
            }
        })
        .collect()
}
