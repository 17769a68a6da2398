//! Supervisor configuration
//!
//! All configuration comes from command-line flags; there is no configuration
//! file. This module holds the typed [`Config`] the entrypoint builds from the
//! parsed flags, plus the parsers for the values that can fail: the
//! comma-separated IP list, the driver mode and the control address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Default path to the haproxy binary
pub const DEFAULT_HAPROXY_PATH: &str = "/usr/local/sbin/haproxy";

/// Default haproxy pidfile path
pub const DEFAULT_PIDFILE: &str = "/var/run/haproxy.pid";

/// Default haproxy configuration file path
pub const DEFAULT_CONFIG_FILE: &str = "/usr/local/etc/haproxy/haproxy.cfg";

/// Default control endpoint address
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1:15000";

/// Default UDP port for the embedded syslog receiver
pub const DEFAULT_SYSLOG_PORT: u16 = 514;

/// How the supervised haproxy is operated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Daemonized haproxy, reloaded by respawning with `-sf <old-pids>`
    Daemon,
    /// Persistent master process (`-W`), reloaded with `SIGUSR2`
    MasterWorker,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daemon" => Ok(Self::Daemon),
            "master-worker" => Ok(Self::MasterWorker),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::MasterWorker => write!(f, "master-worker"),
        }
    }
}

/// Where the control endpoint listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    /// HTTP on a TCP socket, single route `POST /reload`
    Http(SocketAddr),
    /// Line-oriented commands on a UNIX socket
    Unix(PathBuf),
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for ControlAddress {
    type Err = ConfigError;

    /// A `unix://` prefix or an absolute path selects the UNIX socket form;
    /// anything else must parse as `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::control_address(s, "empty socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Http)
            .map_err(|e| ConfigError::control_address(s, e.to_string()))
    }
}

/// Fully validated supervisor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the haproxy binary
    pub haproxy_path: PathBuf,
    /// Pidfile haproxy writes its worker pids to
    pub pidfile: PathBuf,
    /// Configuration file passed to haproxy with `-f`
    pub config_file: PathBuf,
    /// Control endpoint bind
    pub control_address: ControlAddress,
    /// UDP port for the embedded syslog receiver
    pub syslog_port: u16,
    /// Kernel NFQUEUE id used by the connection hold queue
    pub queue_number: u16,
    /// Destination IPs whose SYNs are held during reloads; empty disables
    /// the hold queue entirely
    pub net_queue_ips: Vec<IpAddr>,
    /// Driver mode
    pub mode: Mode,
}

/// Parse the comma-separated `-net-queue-ips` value.
///
/// An empty string yields an empty list (hold queue disabled). Any entry that
/// does not parse as an IP address fails the whole list, reporting the
/// offending entry.
pub fn parse_ip_list(arg: &str) -> Result<Vec<IpAddr>, ConfigError> {
    if arg.is_empty() {
        return Ok(Vec::new());
    }
    arg.split(',')
        .map(|entry| {
            entry
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidIp(entry.trim().to_string()))
        })
        .collect()
}
