//! Datagram forwarding.
//!
//! Each client address gets an association: an ephemeral UDP socket
//! connected to the target, plus a reply pump that relays target datagrams
//! back to the client through the proxy's listening socket. Datagrams carry
//! no close signal, so an association is reclaimed after it has been idle in
//! both directions for the idle timeout. A send or receive error also ends
//! the association.
//!
//! The target address is resolved once, on the first association, and
//! reused; a failed lookup is retried on the next new client.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::liveness::{connected_udp_socket, resolve};
use crate::stats::{ActiveGuard, ServiceStats};

/// Largest datagram relayed.
const MAX_DATAGRAM: usize = 65_535;

/// Per-client association state.
struct Association {
    id: u64,
    socket: Arc<UdpSocket>,
    activity: Arc<Activity>,
    pump: AbortHandle,
}

/// Last activity on an association, as milliseconds since it was created.
struct Activity {
    created: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        self.created + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + idle_timeout
    }
}

/// Result of offering a datagram to the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the target.
    Forwarded,
    /// Dropped: the client cap is reached.
    Dropped,
}

/// Relays datagrams between clients of one listening socket and a target.
pub struct DatagramForwarder {
    listener: Arc<UdpSocket>,
    target_host: String,
    target_port: u16,
    target: OnceCell<SocketAddr>,
    idle_timeout: Duration,
    max_clients: usize,
    stats: Arc<ServiceStats>,
    associations: Mutex<HashMap<SocketAddr, Association>>,
    next_id: AtomicU64,
}

impl DatagramForwarder {
    pub fn new(
        listener: Arc<UdpSocket>,
        target_host: impl Into<String>,
        target_port: u16,
        idle_timeout: Duration,
        max_clients: usize,
        stats: Arc<ServiceStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listener,
            target_host: target_host.into(),
            target_port,
            target: OnceCell::new(),
            idle_timeout,
            max_clients,
            stats,
            associations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Forward one client datagram to the target, creating the client's
    /// association if needed.
    pub async fn forward(self: &Arc<Self>, payload: &[u8], client: SocketAddr) -> io::Result<Delivery> {
        let (id, socket, activity) = match self.existing(client) {
            Some(found) => found,
            None => match self.open(client).await? {
                Some(created) => created,
                None => return Ok(Delivery::Dropped),
            },
        };

        activity.touch();
        if let Err(e) = socket.send(payload).await {
            self.close(client, id);
            return Err(e);
        }

        self.stats.datagrams_to_target.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_to_target
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        Ok(Delivery::Forwarded)
    }

    /// Number of live client associations.
    pub fn association_count(&self) -> usize {
        self.lock().len()
    }

    /// Tear down every association.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (client, association) in drained {
            association.pump.abort();
            debug!(client = %client, "datagram association closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, Association>> {
        self.associations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn existing(&self, client: SocketAddr) -> Option<(u64, Arc<UdpSocket>, Arc<Activity>)> {
        self.lock()
            .get(&client)
            .map(|a| (a.id, Arc::clone(&a.socket), Arc::clone(&a.activity)))
    }

    /// Resolved target address, looked up on first use.
    async fn target_addr(&self) -> io::Result<SocketAddr> {
        self.target
            .get_or_try_init(|| resolve(&self.target_host, self.target_port))
            .await
            .copied()
    }

    fn drop_over_cap(&self, client: SocketAddr) {
        self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            client = %client,
            max_clients = self.max_clients,
            "datagram client limit reached, dropping"
        );
    }

    async fn open(
        self: &Arc<Self>,
        client: SocketAddr,
    ) -> io::Result<Option<(u64, Arc<UdpSocket>, Arc<Activity>)>> {
        if self.association_count() >= self.max_clients {
            self.drop_over_cap(client);
            return Ok(None);
        }

        let target = self.target_addr().await?;
        let socket = Arc::new(connected_udp_socket(target).await?);
        let activity = Arc::new(Activity::new());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut associations = self.lock();

        // Another datagram from the same client may have raced us here.
        if let Some(a) = associations.get(&client) {
            return Ok(Some((a.id, Arc::clone(&a.socket), Arc::clone(&a.activity))));
        }

        // Other clients may have filled the table while we were binding.
        if associations.len() >= self.max_clients {
            drop(associations);
            self.drop_over_cap(client);
            return Ok(None);
        }

        let forwarder = Arc::clone(self);
        let pump_socket = Arc::clone(&socket);
        let pump_activity = Arc::clone(&activity);
        let pump = tokio::spawn(async move {
            forwarder
                .pump_replies(id, client, pump_socket, pump_activity)
                .await
        });

        associations.insert(
            client,
            Association {
                id,
                socket: Arc::clone(&socket),
                activity: Arc::clone(&activity),
                pump: pump.abort_handle(),
            },
        );
        drop(associations);

        debug!(client = %client, target = %target, "datagram association opened");
        Ok(Some((id, socket, activity)))
    }

    async fn pump_replies(
        self: Arc<Self>,
        id: u64,
        client: SocketAddr,
        socket: Arc<UdpSocket>,
        activity: Arc<Activity>,
    ) {
        let _active = ActiveGuard::new(&self.stats);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let deadline = activity.idle_deadline(self.idle_timeout);

            tokio::select! {
                received = socket.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => {
                            self.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(client = %client, error = %e, "target receive failed");
                            break;
                        }
                    };

                    activity.touch();
                    if let Err(e) = self.listener.send_to(&buf[..n], client).await {
                        self.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(client = %client, error = %e, "client send failed");
                        break;
                    }

                    self.stats.datagrams_from_target.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_from_target.fetch_add(n as u64, Ordering::Relaxed);
                }
                _ = sleep_until(deadline) => {
                    if Instant::now() >= activity.idle_deadline(self.idle_timeout) {
                        debug!(client = %client, "datagram association idle");
                        break;
                    }
                }
            }
        }

        self.remove(client, id);
    }

    fn close(&self, client: SocketAddr, id: u64) {
        if let Some(association) = self.remove(client, id) {
            association.pump.abort();
        }
    }

    fn remove(&self, client: SocketAddr, id: u64) -> Option<Association> {
        let mut associations = self.lock();
        if associations.get(&client).map(|a| a.id) == Some(id) {
            associations.remove(&client)
        } else {
            None
        }
    }
}
