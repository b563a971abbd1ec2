//! Single-shot reachability probes.
//!
//! Stream targets are probed with a bounded TCP connect that is released
//! immediately on success.
//!
//! Datagram targets have no handshake, so the probe is best-effort: a
//! connected UDP socket sends one empty datagram and waits for the probe
//! timeout. A reply means reachable. An ICMP-driven error (port or host
//! unreachable, surfaced by the kernel on the connected socket) means
//! unreachable. Silence is treated as reachable because there is no
//! negative evidence. This is a known limitation: a sleeping host that
//! drops traffic silently is reported reachable once its address no longer
//! produces ICMP errors.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{Protocol, ServiceConfig};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Reachable,
    Unreachable,
}

/// Probes one target endpoint.
#[derive(Debug, Clone)]
pub struct LivenessChecker {
    host: String,
    port: u16,
    protocol: Protocol,
    timeout: Duration,
}

impl LivenessChecker {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            timeout,
        }
    }

    /// Build a checker for a service's target.
    pub fn for_service(config: &ServiceConfig) -> Self {
        Self::new(
            config.target_host.clone(),
            config.target_port,
            config.protocol,
            config.probe_timeout,
        )
    }

    /// Run one probe. Never fails; network errors resolve to `Unreachable`.
    pub async fn probe(&self) -> Liveness {
        probe(&self.host, self.port, self.protocol, self.timeout).await
    }
}

/// Run one bounded-time probe against `host:port`.
pub async fn probe(host: &str, port: u16, protocol: Protocol, probe_timeout: Duration) -> Liveness {
    match protocol {
        Protocol::Tcp => probe_stream(host, port, probe_timeout).await,
        Protocol::Udp => probe_datagram(host, port, probe_timeout).await,
    }
}

async fn probe_stream(host: &str, port: u16, probe_timeout: Duration) -> Liveness {
    match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => {
            debug!(host, port, "tcp probe succeeded");
            Liveness::Reachable
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "tcp probe failed: connection error");
            Liveness::Unreachable
        }
        Err(_) => {
            debug!(host, port, "tcp probe failed: timeout");
            Liveness::Unreachable
        }
    }
}

async fn probe_datagram(host: &str, port: u16, probe_timeout: Duration) -> Liveness {
    let addr = match timeout(probe_timeout, resolve(host, port)).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "udp probe failed: resolve error");
            return Liveness::Unreachable;
        }
        Err(_) => {
            debug!(host, port, "udp probe failed: resolve timeout");
            return Liveness::Unreachable;
        }
    };

    let socket = match connected_udp_socket(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(host, port, error = %e, "udp probe failed: socket error");
            return Liveness::Unreachable;
        }
    };

    if let Err(e) = socket.send(&[]).await {
        debug!(host, port, error = %e, "udp probe failed: send error");
        return Liveness::Unreachable;
    }

    let mut buf = [0u8; 64];
    match timeout(probe_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => {
            debug!(host, port, "udp probe succeeded: reply received");
            Liveness::Reachable
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "udp probe failed: icmp error");
            Liveness::Unreachable
        }
        Err(_) => {
            debug!(host, port, "udp probe inconclusive: no reply, assuming reachable");
            Liveness::Reachable
        }
    }
}

/// Resolve `host:port` to its first socket address.
pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}:{}", host, port),
        )
    })
}

/// Bind an ephemeral UDP socket of the right family and connect it to `addr`.
pub(crate) async fn connected_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}
