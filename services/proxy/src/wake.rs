//! Magic packet transmission.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;
use wolp_networking::{MacAddress, MagicPacket, WOL_BROADCAST_ADDR, WOL_DEFAULT_PORT};

/// Sends Wake-on-LAN magic packets to a fixed destination.
///
/// Fire-and-forget: a successful send says nothing about whether the target
/// woke. Only local transmission failures are reported.
#[derive(Debug, Clone)]
pub struct WakeSignaler {
    destination: SocketAddr,
}

impl WakeSignaler {
    pub fn new(destination: SocketAddr) -> Self {
        Self { destination }
    }

    /// Signaler for the limited broadcast address on `port`.
    pub fn broadcast(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(WOL_BROADCAST_ADDR), port))
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Broadcast one magic packet for `mac`.
    pub async fn send(&self, mac: MacAddress) -> io::Result<()> {
        let packet = MagicPacket::new(mac);

        let local: SocketAddr = if self.destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;

        let sent = socket.send_to(packet.as_bytes(), self.destination).await?;
        if sent != packet.as_bytes().len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short magic packet send: {} bytes", sent),
            ));
        }

        debug!(mac = %mac, destination = %self.destination, "magic packet sent");
        Ok(())
    }
}

impl Default for WakeSignaler {
    fn default() -> Self {
        Self::broadcast(WOL_DEFAULT_PORT)
    }
}
