//! One proxied service end to end.
//!
//! A service owns its listening socket, its health monitor and its wake
//! coordinator. Each stream connection runs in its own task; a client waiting
//! on a wake blocks only itself. Datagrams are forwarded inline while the
//! target is reachable. While a wake is pending they are parked in one
//! arrival-ordered queue per service and flushed in that order once the
//! target answers, so the receive loop never stalls on a wake and a burst is
//! never reordered across it.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use super::datagram::{DatagramForwarder, Delivery};
use super::stream::StreamForwarder;
use crate::config::{Protocol, ServiceConfig};
use crate::coordinator::{WakeCoordinator, WakeOutcome};
use crate::error::ProxyError;
use crate::health::HealthMonitor;
use crate::stats::{ActiveGuard, ServiceStats, StatsSnapshot};

/// Default time in-flight sessions get to finish after stop.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Largest datagram accepted from clients.
const MAX_DATAGRAM: usize = 65_535;

/// Datagrams held per service while a wake is pending.
const MAX_PARKED_DATAGRAMS: usize = 1024;

/// How in-flight sessions are treated on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Sessions still running after this long are force-closed.
    pub drain_grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// State shared by a service's accept loop and its sessions.
struct ServiceContext {
    config: ServiceConfig,
    monitor: Arc<HealthMonitor>,
    coordinator: Arc<WakeCoordinator>,
    stats: Arc<ServiceStats>,
}

impl ServiceContext {
    /// Cheap liveness check, waking the target if needed.
    async fn admit(&self) -> WakeOutcome {
        if self.monitor.current_state().is_reachable() {
            return WakeOutcome::Awakened;
        }
        self.coordinator.ensure_awake().await
    }
}

enum Bound {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

/// A running proxied service.
pub struct ServiceProxy {
    ctx: Arc<ServiceContext>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceProxy {
    /// Validate, bind the listener, and start serving.
    pub async fn start(config: ServiceConfig, policy: ShutdownPolicy) -> Result<Self, ProxyError> {
        config.validate()?;

        let bind_addr = config.bind_addr();
        let bound = match config.protocol {
            Protocol::Tcp => TcpListener::bind(bind_addr).await.map(Bound::Stream),
            Protocol::Udp => UdpSocket::bind(bind_addr)
                .await
                .map(|s| Bound::Datagram(Arc::new(s))),
        }
        .map_err(|source| ProxyError::BindFailed {
            addr: bind_addr,
            source,
        })?;

        let local_addr = match &bound {
            Bound::Stream(listener) => listener.local_addr(),
            Bound::Datagram(socket) => socket.local_addr(),
        }
        .map_err(|source| ProxyError::BindFailed {
            addr: bind_addr,
            source,
        })?;

        let stats = Arc::new(ServiceStats::default());
        let monitor = HealthMonitor::new(&config);
        let coordinator = WakeCoordinator::new(&config, Arc::clone(&monitor), Arc::clone(&stats));
        let ctx = Arc::new(ServiceContext {
            config,
            monitor,
            coordinator,
            stats,
        });

        ctx.monitor.start().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = match bound {
            Bound::Stream(listener) => tokio::spawn(run_stream(
                listener,
                Arc::clone(&ctx),
                shutdown_rx,
                policy,
            )),
            Bound::Datagram(socket) => {
                tokio::spawn(run_datagram(socket, Arc::clone(&ctx), shutdown_rx))
            }
        };

        info!(
            service = %ctx.config.name,
            proxy_port = ctx.config.proxy_port,
            protocol = %ctx.config.protocol,
            local_addr = %local_addr,
            target_host = %ctx.config.target_host,
            target_port = ctx.config.target_port,
            "service started"
        );

        Ok(Self {
            ctx,
            local_addr,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.ctx.config
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.ctx.monitor
    }

    pub fn coordinator(&self) -> &Arc<WakeCoordinator> {
        &self.ctx.coordinator
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Stop accepting, stop monitoring, and drain or force-close sessions.
    ///
    /// Bounded by the drain grace period plus one probe timeout.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        // Release clients parked on a wake and refuse new episodes, so the
        // drain is not held up and nothing is woken after stop.
        self.ctx.coordinator.close();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(service = %self.ctx.config.name, error = %e, "service task panicked");
            }
        }

        self.ctx.monitor.stop().await;

        let stats = self.ctx.stats.snapshot();
        info!(
            service = %self.ctx.config.name,
            proxy_port = self.ctx.config.proxy_port,
            connections_accepted = stats.connections_accepted,
            connections_rejected = stats.connections_rejected,
            forward_errors = stats.forward_errors,
            bytes_to_target = stats.bytes_to_target,
            bytes_from_target = stats.bytes_from_target,
            wake_episodes = stats.wake_episodes,
            wake_packets_sent = stats.wake_packets_sent,
            "service stopped"
        );
    }
}

async fn run_stream(
    listener: TcpListener,
    ctx: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
    policy: ShutdownPolicy,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let span = tracing::info_span!(
                        "connection",
                        service = %ctx.config.name,
                        peer = %peer_addr
                    );
                    sessions.spawn(handle_stream(Arc::clone(&ctx), stream, peer_addr).instrument(span));
                }
                Err(e) => {
                    error!(service = %ctx.config.name, error = %e, "accept error");
                    // Avoid a tight loop on persistent errors.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    drain(&ctx.config.name, sessions, policy).await;
}

async fn handle_stream(ctx: Arc<ServiceContext>, client: TcpStream, peer_addr: SocketAddr) {
    let _active = ActiveGuard::new(&ctx.stats);
    info!(proxy_port = ctx.config.proxy_port, "connection accepted");

    if ctx.admit().await == WakeOutcome::TimedOut {
        ctx.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            proxy_port = ctx.config.proxy_port,
            reason = "wake_timeout",
            "connection rejected"
        );
        // Dropping the stream closes it before any byte is forwarded.
        return;
    }

    let forwarder = StreamForwarder::new(
        ctx.config.target_host.clone(),
        ctx.config.target_port,
        ctx.config.connect_timeout,
        Arc::clone(&ctx.stats),
    );

    match forwarder.forward(client).await {
        Ok(transfer) => match transfer.error {
            None => debug!(
                bytes_to_target = transfer.bytes_to_target,
                bytes_from_target = transfer.bytes_from_target,
                "connection closed"
            ),
            Some(e) => {
                ctx.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_addr = %peer_addr,
                    error = %e,
                    bytes_to_target = transfer.bytes_to_target,
                    bytes_from_target = transfer.bytes_from_target,
                    "forwarding error"
                );
            }
        },
        Err(e) => {
            ctx.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
            warn!(peer_addr = %peer_addr, error = %e, "forwarding error: target connect failed");
        }
    }
}

async fn run_datagram(
    socket: Arc<UdpSocket>,
    ctx: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let forwarder = DatagramForwarder::new(
        Arc::clone(&socket),
        ctx.config.target_host.clone(),
        ctx.config.target_port,
        ctx.config.udp_idle_timeout,
        ctx.config.max_udp_clients,
        Arc::clone(&ctx.stats),
    );
    let mut parked: VecDeque<(Vec<u8>, SocketAddr)> = VecDeque::new();
    let mut admission: Option<JoinHandle<WakeOutcome>> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, client)) => {
                    let payload = buf[..n].to_vec();
                    if admission.is_some() {
                        // A wake is pending: queue behind earlier datagrams.
                        park(&ctx, &mut parked, payload, client);
                    } else if ctx.monitor.current_state().is_reachable() {
                        forward_datagram(&ctx, &forwarder, &payload, client).await;
                    } else {
                        park(&ctx, &mut parked, payload, client);
                        let waiting = Arc::clone(&ctx);
                        let span = tracing::info_span!(
                            "datagram_wake",
                            service = %ctx.config.name,
                            peer = %client
                        );
                        admission = Some(tokio::spawn(
                            async move { waiting.admit().await }.instrument(span),
                        ));
                    }
                }
                Err(e) => {
                    // ICMP errors from earlier replies surface here; they are
                    // not fatal to the listener.
                    debug!(service = %ctx.config.name, error = %e, "datagram receive error");
                    if is_fatal_recv_error(&e) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            },
            outcome = admitted(&mut admission), if admission.is_some() => {
                admission = None;
                flush_parked(&ctx, &forwarder, &mut parked, outcome).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(handle) = admission.take() {
        handle.abort();
    }
    if !parked.is_empty() {
        debug!(
            service = %ctx.config.name,
            discarded = parked.len(),
            "discarding parked datagrams on shutdown"
        );
    }
    forwarder.close_all();
}

/// Outcome of the pending admission. Never resolves when there is none.
async fn admitted(admission: &mut Option<JoinHandle<WakeOutcome>>) -> WakeOutcome {
    match admission {
        // A cancelled or panicked admission counts as a failed wake.
        Some(handle) => handle.await.unwrap_or(WakeOutcome::TimedOut),
        None => std::future::pending().await,
    }
}

/// Hold a datagram until the pending wake resolves, in arrival order.
fn park(
    ctx: &ServiceContext,
    parked: &mut VecDeque<(Vec<u8>, SocketAddr)>,
    payload: Vec<u8>,
    client: SocketAddr,
) {
    if parked.len() >= MAX_PARKED_DATAGRAMS {
        ctx.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            service = %ctx.config.name,
            proxy_port = ctx.config.proxy_port,
            peer_addr = %client,
            limit = MAX_PARKED_DATAGRAMS,
            "wake queue full, dropping datagram"
        );
        return;
    }
    parked.push_back((payload, client));
}

/// Forward every parked datagram in arrival order, or reject them all.
async fn flush_parked(
    ctx: &ServiceContext,
    forwarder: &Arc<DatagramForwarder>,
    parked: &mut VecDeque<(Vec<u8>, SocketAddr)>,
    outcome: WakeOutcome,
) {
    match outcome {
        WakeOutcome::Awakened => {
            while let Some((payload, client)) = parked.pop_front() {
                forward_datagram(ctx, forwarder, &payload, client).await;
            }
        }
        WakeOutcome::TimedOut => {
            let rejected = parked.len();
            parked.clear();
            ctx.stats
                .connections_rejected
                .fetch_add(rejected as u64, Ordering::Relaxed);
            warn!(
                service = %ctx.config.name,
                proxy_port = ctx.config.proxy_port,
                reason = "wake_timeout",
                datagrams = rejected,
                "datagram rejected"
            );
        }
    }
}

async fn forward_datagram(
    ctx: &ServiceContext,
    forwarder: &Arc<DatagramForwarder>,
    payload: &[u8],
    client: SocketAddr,
) {
    match forwarder.forward(payload, client).await {
        Ok(Delivery::Forwarded) => {}
        Ok(Delivery::Dropped) => {
            ctx.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            ctx.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                service = %ctx.config.name,
                peer_addr = %client,
                error = %e,
                "forwarding error"
            );
        }
    }
}

fn is_fatal_recv_error(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Wait up to the grace period for sessions, then abort the rest.
async fn drain(service: &str, mut sessions: JoinSet<()>, policy: ShutdownPolicy) {
    if sessions.is_empty() {
        return;
    }

    let in_flight = sessions.len();
    debug!(service, in_flight, "draining sessions");

    let drained = tokio::time::timeout(policy.drain_grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            service,
            remaining = sessions.len(),
            drain_grace_ms = policy.drain_grace.as_millis() as u64,
            "force-closing sessions after drain grace"
        );
        sessions.shutdown().await;
    }
}
