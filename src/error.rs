//! Error types for haproxy-supervisor
//!
//! Errors are categorized by subsystem: configuration, the kernel-assisted
//! connection hold queue, the reload pipeline, the control endpoint and the
//! embedded syslog receiver.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Top-level error type for the supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration errors (flag parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection hold queue errors
    #[error("Net queue error: {0}")]
    NetQueue(#[from] NetQueueError),

    /// Reload pipeline errors
    #[error("Reload error: {0}")]
    Reload(#[from] ReloadError),

    /// Control endpoint errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Embedded syslog receiver errors
    #[error("Syslog error: {0}")]
    Syslog(#[from] SyslogError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
///
/// These are fatal at start-up and always carry the offending value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value in `-net-queue-ips` did not parse as an IP address
    #[error("incorrect IP: {0}")]
    InvalidIp(String),

    /// Unknown `-mode` value
    #[error("unknown mode '{0}', expected 'daemon' or 'master-worker'")]
    InvalidMode(String),

    /// Control address is neither a socket address nor a UNIX socket path
    #[error("invalid control address '{value}': {reason}")]
    InvalidControlAddress { value: String, reason: String },

    /// A numeric flag did not parse
    #[error("invalid value '{value}' for flag {flag}")]
    InvalidNumber { flag: &'static str, value: String },
}

impl ConfigError {
    /// Config errors are never recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    pub fn control_address(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidControlAddress {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the connection hold queue and its kernel surfaces
#[derive(Debug, Error)]
pub enum NetQueueError {
    /// Failed to open or bind the kernel NFQUEUE
    #[error("failed to bind netfilter queue {queue_num}: {reason}")]
    Bind { queue_num: u16, reason: String },

    /// iptables exited non-zero; the hold window cannot be guaranteed
    #[error("iptables {args} failed: {reason}")]
    Iptables { args: String, reason: String },

    /// The drain loop has terminated and can no longer serve requests
    #[error("net queue is stopped")]
    Closed,

    /// Failed to read the kernel queue statistics file
    #[error("failed to read netfilter queue stats: {0}")]
    Proc(#[from] io::Error),
}

impl NetQueueError {
    /// Bind and iptables failures undermine the hold guarantee and are fatal;
    /// proc reads are transient.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Proc(_))
    }

    pub fn bind(queue_num: u16, reason: impl Into<String>) -> Self {
        Self::Bind {
            queue_num,
            reason: reason.into(),
        }
    }

    pub fn iptables(args: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Iptables {
            args: args.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the reload pipeline and the haproxy drivers
#[derive(Debug, Error)]
pub enum ReloadError {
    /// `start` was called while the proxy is already running
    #[error("server already started")]
    AlreadyRunning,

    /// `stop` was called while the proxy is not running
    #[error("server not started")]
    NotRunning,

    /// Spawning the proxy binary failed
    #[error("couldn't spawn haproxy: {0}")]
    Spawn(#[source] io::Error),

    /// The spawned proxy exited non-zero
    #[error("haproxy couldn't reload configuration: exited with {status}")]
    Exit { status: ExitStatus },

    /// The spawn did not terminate within the reload ceiling
    #[error("reload timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Delivering a signal to the proxy failed
    #[error("couldn't signal process {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    /// The pidfile could not be read
    #[error("couldn't open pidfile {path}: {reason}")]
    Pidfile { path: String, reason: String },

    /// The configuration check (`haproxy -c`) rejected the config
    #[error("configuration check failed: {output}")]
    Check { output: String },

    /// The hold queue failed while the reload was in flight
    #[error(transparent)]
    NetQueue(#[from] NetQueueError),
}

impl ReloadError {
    /// Reload errors are reported to the caller, who may re-issue the reload.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyRunning | Self::NotRunning => false,
            Self::NetQueue(e) => e.is_recoverable(),
            _ => true,
        }
    }

    pub fn signal(pid: i32, reason: impl Into<String>) -> Self {
        Self::Signal {
            pid,
            reason: reason.into(),
        }
    }

    pub fn pidfile(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Pidfile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Control endpoint errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Failed to bind the control listener
    #[error("failed to bind control endpoint on {address}: {reason}")]
    Bind { address: String, reason: String },

    /// I/O error while serving
    #[error("control I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    pub fn bind(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// Embedded syslog receiver errors
#[derive(Debug, Error)]
pub enum SyslogError {
    /// Failed to bind the UDP socket
    #[error("failed to bind syslog receiver on {address}: {reason}")]
    Bind { address: String, reason: String },

    /// I/O error while receiving
    #[error("syslog I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyslogError {
    pub fn bind(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with SupervisorError
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_offending_value() {
        let err = ConfigError::InvalidIp("10.0.0.999".into());
        assert!(err.to_string().contains("10.0.0.999"));

        let err = ConfigError::InvalidMode("worker".into());
        assert!(err.to_string().contains("worker"));

        let err = NetQueueError::bind(7, "permission denied");
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_recovery_classification() {
        assert!(!ConfigError::InvalidMode("x".into()).is_recoverable());
        assert!(!NetQueueError::bind(0, "eperm").is_recoverable());
        assert!(NetQueueError::Proc(io::Error::other("transient")).is_recoverable());
        assert!(ReloadError::Timeout { seconds: 15 }.is_recoverable());
        assert!(!ReloadError::AlreadyRunning.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let err: SupervisorError = NetQueueError::Closed.into();
        assert!(matches!(err, SupervisorError::NetQueue(_)));

        let err: ReloadError = NetQueueError::Closed.into();
        assert!(matches!(err, ReloadError::NetQueue(_)));
    }
}
