//! iptables shim for the connection hold queue
//!
//! Appends and deletes the one rule shape the hold queue needs: divert TCP
//! SYNs for a destination address into an NFQUEUE. Invoked synchronously from
//! the drain thread; the `-w` flag makes iptables wait for the xtables lock
//! instead of failing when another invocation is running.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::NetQueueError;

const IPTABLES_BIN: &str = "iptables";

/// Rule direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Append,
    Delete,
}

impl RuleAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// Build the argument vector for one hold rule.
#[must_use]
pub fn rule_args(action: RuleAction, ip: Ipv4Addr, queue_num: u16) -> Vec<String> {
    vec![
        action.flag().to_string(),
        "INPUT".to_string(),
        "-j".to_string(),
        "NFQUEUE".to_string(),
        "-w".to_string(),
        "-p".to_string(),
        "tcp".to_string(),
        "--syn".to_string(),
        "--destination".to_string(),
        ip.to_string(),
        "--queue-num".to_string(),
        queue_num.to_string(),
    ]
}

/// Install the hold rule for one destination address.
///
/// # Errors
///
/// Returns [`NetQueueError::Iptables`] when iptables cannot be executed or
/// exits non-zero; the hold window must not be entered in that case.
pub fn append_rule(ip: Ipv4Addr, queue_num: u16) -> Result<(), NetQueueError> {
    run(RuleAction::Append, ip, queue_num)
}

/// Remove the hold rule for one destination address.
pub fn delete_rule(ip: Ipv4Addr, queue_num: u16) -> Result<(), NetQueueError> {
    run(RuleAction::Delete, ip, queue_num)
}

fn run(action: RuleAction, ip: Ipv4Addr, queue_num: u16) -> Result<(), NetQueueError> {
    let args = rule_args(action, ip, queue_num);
    let pretty = args.join(" ");
    let output = Command::new(IPTABLES_BIN)
        .args(&args)
        .output()
        .map_err(|e| NetQueueError::iptables(pretty.clone(), e.to_string()))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(NetQueueError::iptables(
        pretty,
        format!("{}: {}", output.status, stderr.trim()),
    ))
}
