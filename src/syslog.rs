//! Embedded syslog receiver
//!
//! haproxy cannot log to files; it speaks syslog. Pointing its `log` stanza
//! at `127.0.0.1:<port>` lands every proxy log line here, where it is
//! re-emitted through the supervisor's own logger so both processes share
//! one output stream.
//!
//! Framing is auto-detected per datagram: a `<PRI>` header followed by the
//! version digit `1` and a space is RFC 5424, a bare `<PRI>` header is
//! RFC 3164, and anything else is forwarded untouched. The syslog severity
//! picks the re-emit level.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::SyslogError;

/// Largest datagram we accept; haproxy's default line limit is far below.
const MAX_DATAGRAM: usize = 8192;

/// UDP syslog receiver bound to loopback
pub struct SyslogServer {
    socket: UdpSocket,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyslogServer {
    /// Bind `127.0.0.1:<port>`.
    ///
    /// # Errors
    ///
    /// [`SyslogError::Bind`] when the socket cannot be bound.
    pub async fn bind(port: u16) -> Result<Self, SyslogError> {
        let address = format!("127.0.0.1:{port}");
        let socket = UdpSocket::bind(&address)
            .await
            .map_err(|e| SyslogError::bind(address.clone(), e.to_string()))?;
        info!("Syslog receiver listening on {address}");

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            socket,
            shutdown_tx,
        })
    }

    /// Actual bound address; useful when binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Sender that stops the receive loop.
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Receive and re-emit until a shutdown signal arrives.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _peer)) => {
                            let raw = String::from_utf8_lossy(&buf[..len]);
                            emit(&parse_message(raw.trim_end()));
                        }
                        Err(e) => warn!("syslog receive error: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Syslog receiver shutting down");
                    return;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SyslogMessage<'a> {
    severity: Option<u8>,
    facility: Option<u8>,
    rfc5424: bool,
    content: &'a str,
}

impl<'a> SyslogMessage<'a> {
    fn unframed(content: &'a str) -> Self {
        Self {
            severity: None,
            facility: None,
            rfc5424: false,
            content,
        }
    }
}

fn parse_message(raw: &str) -> SyslogMessage<'_> {
    let Some(rest) = raw.strip_prefix('<') else {
        return SyslogMessage::unframed(raw);
    };
    let Some(end) = rest.find('>') else {
        return SyslogMessage::unframed(raw);
    };
    let pri = match rest[..end].parse::<u16>() {
        Ok(pri) if pri <= 191 => pri,
        _ => return SyslogMessage::unframed(raw),
    };
    let content = &rest[end + 1..];
    let rfc5424 = content.starts_with("1 ");
    let content = if rfc5424 { &content[2..] } else { content };
    SyslogMessage {
        severity: Some((pri & 0x07) as u8),
        facility: Some((pri >> 3) as u8),
        rfc5424,
        content,
    }
}

fn emit(message: &SyslogMessage<'_>) {
    match message.severity {
        Some(0..=3) => error!(target: "haproxy", "{}", message.content),
        Some(4) => warn!(target: "haproxy", "{}", message.content),
        Some(7) => debug!(target: "haproxy", "{}", message.content),
        _ => info!(target: "haproxy", "{}", message.content),
    }
}
