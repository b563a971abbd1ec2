//! Stream forwarding.
//!
//! Each session relays bytes in both directions as two independent copy
//! loops. EOF on one side half-closes the matching write side of the other
//! connection, so a client that finishes sending still gets its reply. An
//! error in either direction ends the session and both sockets are dropped.
//! Sessions are never retried.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::stats::ServiceStats;

/// Relay buffer size per direction.
const BUFFER_SIZE: usize = 8192;

/// Outcome of one relay session.
#[derive(Debug)]
pub struct Transfer {
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
    /// The error that ended the session early, if any.
    pub error: Option<io::Error>,
}

/// Forwards accepted client connections to one target.
#[derive(Debug, Clone)]
pub struct StreamForwarder {
    target_host: String,
    target_port: u16,
    connect_timeout: Duration,
    stats: Arc<ServiceStats>,
}

impl StreamForwarder {
    pub fn new(
        target_host: impl Into<String>,
        target_port: u16,
        connect_timeout: Duration,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            connect_timeout,
            stats,
        }
    }

    /// Connect to the target and relay until both directions finish.
    pub async fn forward(&self, mut client: TcpStream) -> io::Result<Transfer> {
        let mut target = self.connect().await?;
        let target_addr = target.peer_addr()?;
        debug!(target_addr = %target_addr, "connected to target");

        let transfer = relay(&mut client, &mut target).await;

        self.stats
            .bytes_to_target
            .fetch_add(transfer.bytes_to_target, Ordering::Relaxed);
        self.stats
            .bytes_from_target
            .fetch_add(transfer.bytes_from_target, Ordering::Relaxed);

        Ok(transfer)
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let addr = (self.target_host.as_str(), self.target_port);
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "target connect timeout")),
        }
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.target_host, self.target_port)
    }
}

/// Relay between `client` and `target` until both directions reach EOF or
/// either fails.
pub async fn relay(client: &mut TcpStream, target: &mut TcpStream) -> Transfer {
    let (mut client_read, mut client_write) = client.split();
    let (mut target_read, mut target_write) = target.split();

    let mut bytes_to_target = 0u64;
    let mut bytes_from_target = 0u64;

    let result = tokio::try_join!(
        copy_half(&mut client_read, &mut target_write, &mut bytes_to_target),
        copy_half(&mut target_read, &mut client_write, &mut bytes_from_target),
    );

    Transfer {
        bytes_to_target,
        bytes_from_target,
        error: result.err(),
    }
}

/// Copy until EOF, then shut down the writer.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    writer.shutdown().await
}
