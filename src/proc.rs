//! Kernel netfilter-queue statistics reader
//!
//! Parses `/proc/net/netfilter/nfnetlink_queue` into a snapshot keyed by
//! queue id. Each line carries nine whitespace-separated decimal fields:
//!
//! ```text
//! queue_num  port_id  waiting  copy_mode  copy_range  queue_dropped  user_dropped  id_sequence  1
//! ```
//!
//! The `waiting` counter is the number of packets the kernel holds pending a
//! verdict. The drain loop uses it to decide whether the kernel still owes
//! packets, but never to decide how many to consume from the in-process
//! buffer (see the hold queue module).
//!
//! [`ProcNetfilter::refresh`] replaces the snapshot atomically: concurrent
//! readers see either the pre- or the post-refresh state in its entirety.
//! Queues no longer present in the kernel are dropped from the snapshot.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// Kernel statistics path
pub const PROC_NETFILTER_QUEUE_PATH: &str = "/proc/net/netfilter/nfnetlink_queue";

/// Counters for a single kernel queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounters {
    /// Queue id (the `--queue-num` of the iptables rule)
    pub id: u16,
    /// Netlink peer port id of the binding process
    pub port_id: u32,
    /// Packets currently queued awaiting a verdict
    pub waiting: u64,
    /// Copy mode (2 = copy packet payload)
    pub copy_mode: u8,
    /// Per-packet copy size
    pub copy_range: u32,
    /// Packets dropped because the kernel queue was full
    pub queue_dropped: u64,
    /// Packets dropped because they could not be sent to user space
    pub user_dropped: u64,
    /// Last packet sequence number handed out
    pub last_seq: u64,
    /// Queue refcount (always 1 in current kernels)
    pub refcount: u32,
}

/// Refreshable snapshot of all kernel netfilter queues
pub struct ProcNetfilter {
    path: PathBuf,
    queues: RwLock<HashMap<u16, QueueCounters>>,
}

impl ProcNetfilter {
    /// Open the default kernel statistics path and read an initial snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the proc file cannot be read, typically because the
    /// `nfnetlink_queue` module is not loaded.
    pub fn new() -> io::Result<Self> {
        Self::with_path(PROC_NETFILTER_QUEUE_PATH)
    }

    /// Same as [`ProcNetfilter::new`] with an explicit path.
    pub fn with_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let pn = Self {
            path: path.as_ref().to_path_buf(),
            queues: RwLock::new(HashMap::new()),
        };
        pn.refresh()?;
        Ok(pn)
    }

    /// Re-read the statistics file and replace the snapshot.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O or parse error; the previous snapshot is
    /// kept untouched in that case.
    pub fn refresh(&self) -> io::Result<()> {
        let file = std::fs::File::open(&self.path)?;
        let parsed = parse(io::BufReader::new(file))?;
        *self.queues.write() = parsed;
        Ok(())
    }

    /// Look up the counters for a queue id in the current snapshot.
    #[must_use]
    pub fn get(&self, id: u16) -> Option<QueueCounters> {
        self.queues.read().get(&id).copied()
    }

    /// Number of queues in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}

fn parse(reader: impl BufRead) -> io::Result<HashMap<u16, QueueCounters>> {
    let mut queues = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let counters = parse_line(&line).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed nfnetlink_queue line: {line:?}"),
            )
        })?;
        queues.insert(counters.id, counters);
    }
    Ok(queues)
}

fn parse_line(line: &str) -> Option<QueueCounters> {
    let mut fields = line.split_whitespace();
    let counters = QueueCounters {
        id: fields.next()?.parse().ok()?,
        port_id: fields.next()?.parse().ok()?,
        waiting: fields.next()?.parse().ok()?,
        copy_mode: fields.next()?.parse().ok()?,
        copy_range: fields.next()?.parse().ok()?,
        queue_dropped: fields.next()?.parse().ok()?,
        user_dropped: fields.next()?.parse().ok()?,
        last_seq: fields.next()?.parse().ok()?,
        refcount: fields.next()?.parse().ok()?,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(counters)
}
