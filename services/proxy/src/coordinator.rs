//! Wake episode coordination.
//!
//! At most one wake episode runs per service. The first caller that finds
//! the target down creates the session and a driver task that sends a single
//! magic packet, then polls liveness at the health check cadence until the
//! target answers or the wake timeout passes. Every caller, including the
//! creator, waits on the session's outcome channel, so all clients of one
//! episode observe the same outcome.
//!
//! The driver runs as its own task so a client disconnecting mid-wake does
//! not cancel the episode for everyone else.
//!
//! Once [`close`](WakeCoordinator::close) is called the coordinator starts no
//! further episodes; every later caller that finds the target down observes
//! `TimedOut` without a packet being sent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use wolp_networking::MacAddress;

use crate::config::ServiceConfig;
use crate::health::{HealthMonitor, LivenessStatus};
use crate::stats::ServiceStats;
use crate::wake::WakeSignaler;

/// Terminal outcome of a wake episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The target is reachable.
    Awakened,
    /// The target did not become reachable before the deadline.
    TimedOut,
}

impl WakeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeOutcome::Awakened => "awakened",
            WakeOutcome::TimedOut => "timed_out",
        }
    }
}

/// An in-flight wake episode.
struct WakeSession {
    episode: u64,
    deadline: Instant,
    outcome: watch::Receiver<Option<WakeOutcome>>,
    driver: AbortHandle,
}

/// Collapses concurrent cold-start connections into one wake sequence.
pub struct WakeCoordinator {
    service: String,
    proxy_port: u16,
    mac: MacAddress,
    wake_timeout: Duration,
    check_interval: Duration,
    monitor: Arc<HealthMonitor>,
    signaler: WakeSignaler,
    stats: Arc<ServiceStats>,
    session: Mutex<Option<WakeSession>>,
    closed: AtomicBool,
    next_episode: AtomicU64,
}

impl WakeCoordinator {
    pub fn new(
        config: &ServiceConfig,
        monitor: Arc<HealthMonitor>,
        stats: Arc<ServiceStats>,
    ) -> Arc<Self> {
        Self::with_signaler(
            config,
            monitor,
            WakeSignaler::new(config.wake_destination),
            stats,
        )
    }

    pub fn with_signaler(
        config: &ServiceConfig,
        monitor: Arc<HealthMonitor>,
        signaler: WakeSignaler,
        stats: Arc<ServiceStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: config.name.clone(),
            proxy_port: config.proxy_port,
            mac: config.mac_address,
            wake_timeout: config.wake_timeout,
            check_interval: config.health_check_interval,
            monitor,
            signaler,
            stats,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
            next_episode: AtomicU64::new(1),
        })
    }

    /// Make sure the target is awake, waking it if needed.
    ///
    /// Returns immediately if the monitor already reports the target
    /// reachable. Otherwise joins the active episode, or starts one.
    pub async fn ensure_awake(self: &Arc<Self>) -> WakeOutcome {
        if self.monitor.current_state().is_reachable() {
            return WakeOutcome::Awakened;
        }

        let Some(mut outcome) = self.join_or_start() else {
            return WakeOutcome::TimedOut;
        };
        let result = outcome.wait_for(Option::is_some).await.map(|o| *o);

        match result {
            Ok(Some(outcome)) => outcome,
            // Driver cancelled before reporting.
            Ok(None) | Err(_) => WakeOutcome::TimedOut,
        }
    }

    /// Whether a wake episode is currently in flight.
    pub fn is_waking(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort the in-flight episode, if any, and refuse to start new ones.
    /// Waiters of the aborted episode observe `TimedOut`.
    pub fn close(&self) {
        let mut slot = self.lock_session();
        self.closed.store(true, Ordering::Release);
        if let Some(session) = slot.take() {
            session.driver.abort();
            info!(
                service = %self.service,
                proxy_port = self.proxy_port,
                episode = session.episode,
                "wake episode cancelled"
            );
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<WakeSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to the active session, or create it and spawn its driver.
    /// Returns `None` once the coordinator is closed.
    ///
    /// Check and create happen under one lock, so exactly one caller per
    /// episode becomes the creator, and none after `close`.
    fn join_or_start(self: &Arc<Self>) -> Option<watch::Receiver<Option<WakeOutcome>>> {
        let mut slot = self.lock_session();

        if self.closed.load(Ordering::Acquire) {
            debug!(service = %self.service, "coordinator closed, not waking");
            return None;
        }

        if let Some(session) = slot.as_ref() {
            debug!(
                service = %self.service,
                episode = session.episode,
                remaining_ms = session.deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "joining wake episode"
            );
            return Some(session.outcome.clone());
        }

        let episode = self.next_episode.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let deadline = started_at + self.wake_timeout;
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let coordinator = Arc::clone(self);
        let driver = tokio::spawn(async move {
            coordinator
                .drive(episode, started_at, deadline, outcome_tx)
                .await
        });

        *slot = Some(WakeSession {
            episode,
            deadline,
            outcome: outcome_rx.clone(),
            driver: driver.abort_handle(),
        });

        Some(outcome_rx)
    }

    async fn drive(
        self: Arc<Self>,
        episode: u64,
        started_at: Instant,
        deadline: Instant,
        outcome_tx: watch::Sender<Option<WakeOutcome>>,
    ) {
        self.stats.wake_episodes.fetch_add(1, Ordering::Relaxed);
        info!(
            service = %self.service,
            proxy_port = self.proxy_port,
            episode,
            mac = %self.mac,
            wake_timeout_ms = self.wake_timeout.as_millis() as u64,
            "wake episode started"
        );

        let outcome = self.wake_and_poll(started_at, deadline).await;

        if outcome == WakeOutcome::TimedOut {
            self.stats.wake_timeouts.fetch_add(1, Ordering::Relaxed);
        }

        // Destroy the session before publishing, so a caller arriving after
        // the outcome starts a fresh episode.
        {
            let mut slot = self.lock_session();
            if slot.as_ref().map(|s| s.episode) == Some(episode) {
                *slot = None;
            }
        }
        let _ = outcome_tx.send(Some(outcome));

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        match outcome {
            WakeOutcome::Awakened => info!(
                service = %self.service,
                proxy_port = self.proxy_port,
                episode,
                outcome = outcome.as_str(),
                elapsed_ms,
                "wake episode finished"
            ),
            WakeOutcome::TimedOut => warn!(
                service = %self.service,
                proxy_port = self.proxy_port,
                episode,
                outcome = outcome.as_str(),
                elapsed_ms,
                "wake episode finished"
            ),
        }
    }

    async fn wake_and_poll(&self, started_at: Instant, deadline: Instant) -> WakeOutcome {
        // Nothing has been observed yet: check before waking an awake host.
        if self.monitor.current_state().status == LivenessStatus::Unknown {
            if let Ok(state) = timeout_at(deadline, self.monitor.force_probe()).await {
                if state.is_reachable() {
                    return WakeOutcome::Awakened;
                }
            }
        }

        match self.signaler.send(self.mac).await {
            Ok(()) => {
                self.stats.wake_packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Keep polling: the packet may still have left the host.
                warn!(
                    service = %self.service,
                    proxy_port = self.proxy_port,
                    destination = %self.signaler.destination(),
                    error = %e,
                    "wake packet send failed"
                );
            }
        }

        let mut ticker =
            tokio::time::interval_at(started_at + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => return WakeOutcome::TimedOut,
            }

            match timeout_at(deadline, self.monitor.force_probe()).await {
                Ok(state) if state.is_reachable() => return WakeOutcome::Awakened,
                Ok(state) => {
                    debug!(
                        service = %self.service,
                        status = state.status.as_str(),
                        "target not yet reachable"
                    );
                }
                Err(_) => return WakeOutcome::TimedOut,
            }
        }
    }
}
