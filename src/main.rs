//! haproxy-supervisor entry point
//!
//! Wires the supervisor together: connection hold queue, embedded syslog
//! receiver, haproxy driver, reload state machine and control endpoint, then
//! waits for SIGTERM/SIGINT and tears everything down in order.
//!
//! # Usage
//!
//! ```bash
//! haproxy-supervisor \
//!     -haproxy /usr/local/sbin/haproxy \
//!     -haproxy-config /usr/local/etc/haproxy/haproxy.cfg \
//!     -control-address 127.0.0.1:15000 \
//!     -net-queue-ips 10.0.0.10,10.0.0.11 -nf-queue-number 5
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use haproxy_supervisor::config::{
    self, Config, ControlAddress, Mode, DEFAULT_CONFIG_FILE, DEFAULT_CONTROL_ADDRESS,
    DEFAULT_HAPROXY_PATH, DEFAULT_PIDFILE, DEFAULT_SYSLOG_PORT,
};
use haproxy_supervisor::error::ConfigError;
use haproxy_supervisor::haproxy::{check_config, HaproxyDaemon, HaproxyMasterWorker, HaproxyServer};
use haproxy_supervisor::netqueue::new_net_queue;
use haproxy_supervisor::reload::ReloadController;
use haproxy_supervisor::{ControlServer, SyslogServer};

/// How long to keep waiting for haproxy to come up when the initial start
/// fails (typically an invalid configuration that an operator is fixing).
const CONFIG_TIMEOUT: Duration = Duration::from_secs(300);

/// Command-line arguments
struct Args {
    haproxy_path: String,
    pidfile: String,
    config_file: String,
    control_address: String,
    syslog_port: String,
    queue_number: String,
    net_queue_ips: String,
    mode: String,
    check: bool,
    show_version: bool,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            haproxy_path: DEFAULT_HAPROXY_PATH.to_string(),
            pidfile: DEFAULT_PIDFILE.to_string(),
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            control_address: DEFAULT_CONTROL_ADDRESS.to_string(),
            syslog_port: DEFAULT_SYSLOG_PORT.to_string(),
            queue_number: "0".to_string(),
            net_queue_ips: String::new(),
            mode: "daemon".to_string(),
            check: false,
            show_version: false,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-haproxy" | "--haproxy" => {
                    if let Some(value) = args.next() {
                        parsed.haproxy_path = value;
                    }
                }
                "-haproxy-pidfile" | "--haproxy-pidfile" => {
                    if let Some(value) = args.next() {
                        parsed.pidfile = value;
                    }
                }
                "-haproxy-config" | "--haproxy-config" => {
                    if let Some(value) = args.next() {
                        parsed.config_file = value;
                    }
                }
                "-control-address" | "--control-address" => {
                    if let Some(value) = args.next() {
                        parsed.control_address = value;
                    }
                }
                "-syslog-port" | "--syslog-port" => {
                    if let Some(value) = args.next() {
                        parsed.syslog_port = value;
                    }
                }
                "-nf-queue-number" | "--nf-queue-number" => {
                    if let Some(value) = args.next() {
                        parsed.queue_number = value;
                    }
                }
                "-net-queue-ips" | "--net-queue-ips" => {
                    if let Some(value) = args.next() {
                        parsed.net_queue_ips = value;
                    }
                }
                "-mode" | "--mode" => {
                    if let Some(value) = args.next() {
                        parsed.mode = value;
                    }
                }
                "-check" | "--check" => {
                    parsed.check = true;
                }
                "-version" | "--version" => {
                    parsed.show_version = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }
        parsed
    }

    fn into_config(self) -> Result<Config, ConfigError> {
        let syslog_port =
            self.syslog_port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidNumber {
                    flag: "-syslog-port",
                    value: self.syslog_port.clone(),
                })?;
        let queue_number =
            self.queue_number
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidNumber {
                    flag: "-nf-queue-number",
                    value: self.queue_number.clone(),
                })?;
        Ok(Config {
            haproxy_path: PathBuf::from(self.haproxy_path),
            pidfile: PathBuf::from(self.pidfile),
            config_file: PathBuf::from(self.config_file),
            control_address: self.control_address.parse::<ControlAddress>()?,
            syslog_port,
            queue_number,
            net_queue_ips: config::parse_ip_list(&self.net_queue_ips)?,
            mode: self.mode.parse::<Mode>()?,
        })
    }
}

fn print_help() {
    println!(
        r#"haproxy-supervisor v{}

Sidecar supervisor for safe haproxy reloads.

USAGE:
    haproxy-supervisor [OPTIONS]

OPTIONS:
    -haproxy <PATH>            Path to haproxy binary [default: {}]
    -haproxy-pidfile <PATH>    Pidfile for haproxy [default: {}]
    -haproxy-config <PATH>     Path to configuration file for haproxy
                               [default: {}]
    -control-address <ADDR>    host:port for the HTTP control endpoint, or a
                               UNIX socket path [default: {}]
    -syslog-port <PORT>        UDP port for the embedded syslog receiver
                               [default: {}]
    -nf-queue-number <NUM>     Netfilter queue number used to retain
                               connections during reloads [default: 0]
    -net-queue-ips <CSV>       Comma-separated destination IPs whose
                               connections are retained during reloads;
                               empty disables the hold queue
    -mode <MODE>               haproxy mode: daemon or master-worker
                               [default: daemon]
    -check                     Check the haproxy configuration and exit
    -version                   Print version and exit
    -h, --help                 Print help

REQUIREMENTS:
    The hold queue needs CAP_NET_ADMIN (or root), the nfnetlink_queue
    kernel module and iptables."#,
        haproxy_supervisor::VERSION,
        DEFAULT_HAPROXY_PATH,
        DEFAULT_PIDFILE,
        DEFAULT_CONFIG_FILE,
        DEFAULT_CONTROL_ADDRESS,
        DEFAULT_SYSLOG_PORT,
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("hyper=warn".parse().expect("static directive"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.show_version {
        println!("haproxy-supervisor v{}", haproxy_supervisor::VERSION);
        return Ok(());
    }

    let check = args.check;
    let config = args.into_config().context("invalid configuration")?;

    if check {
        return match check_config(&config.haproxy_path, &config.config_file).await {
            Ok(()) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
    }

    init_logging();
    info!("haproxy-supervisor v{}", haproxy_supervisor::VERSION);

    // Hold queue first: binding the kernel queue is the step that can fail
    // fatally, and the packet pump must be warm before any capture.
    let net_queue = new_net_queue(config.queue_number, config.net_queue_ips.clone())
        .context("couldn't set up connection hold queue")?;
    if config.net_queue_ips.is_empty() {
        info!("Connection hold queue disabled (no -net-queue-ips)");
    } else {
        info!(
            "Connection hold queue on NFQUEUE {} for {} address(es)",
            config.queue_number,
            config.net_queue_ips.len()
        );
    }

    let syslog = SyslogServer::bind(config.syslog_port)
        .await
        .context("couldn't start embedded syslog")?;
    let syslog_shutdown = syslog.shutdown_sender();
    let syslog_handle = tokio::spawn(syslog.run());

    let haproxy: Arc<dyn HaproxyServer> = match config.mode {
        Mode::Daemon => Arc::new(HaproxyDaemon::new(
            &config.haproxy_path,
            &config.pidfile,
            &config.config_file,
        )),
        Mode::MasterWorker => Arc::new(HaproxyMasterWorker::new(
            &config.haproxy_path,
            &config.pidfile,
            &config.config_file,
        )),
    };

    if let Err(e) = haproxy.start().await {
        warn!("Couldn't start haproxy: {e}");
        warn!("Will wait for valid configuration");
        let haproxy = Arc::clone(&haproxy);
        tokio::spawn(async move {
            let came_up = tokio::time::timeout(CONFIG_TIMEOUT, async {
                while !haproxy.is_running() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            })
            .await;
            if came_up.is_err() {
                error!("Timeout while waiting for haproxy to start");
                std::process::exit(1);
            }
            info!("haproxy started");
        });
    }

    let controller = Arc::new(ReloadController::new(
        Arc::clone(&haproxy),
        Arc::clone(&net_queue),
    ));

    let control = ControlServer::bind(&config.control_address, controller)
        .await
        .context("couldn't start control endpoint")?;
    let control_shutdown = control.shutdown_sender();
    let control_handle = tokio::spawn(control.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    // Shutdown order: control endpoint, proxy, hold queue, syslog.
    let _ = control_shutdown.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    if let Err(e) = haproxy.stop().await {
        warn!("Couldn't stop haproxy: {e}");
    }

    net_queue.stop().await;

    let _ = syslog_shutdown.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), syslog_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}
