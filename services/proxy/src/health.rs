//! Background liveness tracking for one service.
//!
//! The monitor is the only writer of a service's [`LivenessState`]. Readers
//! get a copied snapshot from a lock-free cell and never see a partial
//! update. Probes are serialized: the interval loop and [`force_probe`]
//! never run two probes against the same target at once.
//!
//! Scheduling: the first probe runs as soon as the monitor starts; each
//! subsequent probe runs one interval after the previous probe completes.
//!
//! [`force_probe`]: HealthMonitor::force_probe

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::liveness::{Liveness, LivenessChecker};

/// Last known liveness of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// No probe has completed yet.
    Unknown,
    Reachable,
    Unreachable,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessStatus::Unknown => "unknown",
            LivenessStatus::Reachable => "reachable",
            LivenessStatus::Unreachable => "unreachable",
        }
    }
}

impl From<Liveness> for LivenessStatus {
    fn from(liveness: Liveness) -> Self {
        match liveness {
            Liveness::Reachable => LivenessStatus::Reachable,
            Liveness::Unreachable => LivenessStatus::Unreachable,
        }
    }
}

/// Snapshot of a service's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState {
    pub status: LivenessStatus,
    /// When the probe that produced `status` completed.
    pub checked_at: Option<DateTime<Utc>>,
}

impl LivenessState {
    pub fn unknown() -> Self {
        Self {
            status: LivenessStatus::Unknown,
            checked_at: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == LivenessStatus::Reachable
    }
}

/// Periodic prober publishing a service's liveness.
pub struct HealthMonitor {
    service: String,
    checker: LivenessChecker,
    interval: Duration,
    state: ArcSwap<LivenessState>,
    probe_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor for a service. The loop does not run until [`start`].
    ///
    /// [`start`]: HealthMonitor::start
    pub fn new(config: &ServiceConfig) -> Arc<Self> {
        Self::with_checker(
            config.name.clone(),
            LivenessChecker::for_service(config),
            config.health_check_interval,
        )
    }

    pub fn with_checker(
        service: impl Into<String>,
        checker: LivenessChecker,
        interval: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            service: service.into(),
            checker,
            interval,
            state: ArcSwap::from_pointee(LivenessState::unknown()),
            probe_lock: Mutex::new(()),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the probe loop. Calling this on a running monitor is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let shutdown_rx = self.shutdown_tx.subscribe();
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move { monitor.run(shutdown_rx).await }));
    }

    /// Signal the loop to exit and wait for it.
    ///
    /// An in-flight probe completes (it is bounded by the probe timeout) but
    /// no further probe is scheduled.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!(service = %self.service, "health monitor stopped");
        }
    }

    /// Last published state. Never blocks.
    pub fn current_state(&self) -> LivenessState {
        **self.state.load()
    }

    /// Probe now and publish the result.
    ///
    /// Waits for an in-flight probe to finish first rather than overlapping it.
    pub async fn force_probe(&self) -> LivenessState {
        self.probe_and_publish().await
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.service,
            interval_ms = self.interval.as_millis() as u64,
            "starting health monitor"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.probe_and_publish().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(service = %self.service, "health monitor loop exiting");
    }

    async fn probe_and_publish(&self) -> LivenessState {
        let _guard = self.probe_lock.lock().await;

        let status = LivenessStatus::from(self.checker.probe().await);
        let next = LivenessState {
            status,
            checked_at: Some(Utc::now()),
        };

        let previous = self.state.swap(Arc::new(next));
        if previous.status != status {
            if previous.status == LivenessStatus::Unknown {
                debug!(service = %self.service, status = status.as_str(), "initial target liveness");
            } else {
                info!(
                    service = %self.service,
                    from = previous.status.as_str(),
                    to = status.as_str(),
                    "target liveness changed"
                );
            }
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use tokio::net::TcpListener;

    fn monitor_for(port: u16, interval: Duration) -> Arc<HealthMonitor> {
        HealthMonitor::with_checker(
            "test",
            LivenessChecker::new("127.0.0.1", port, Protocol::Tcp, Duration::from_millis(200)),
            interval,
        )
    }

    #[tokio::test]
    async fn test_unknown_before_first_probe() {
        let monitor = monitor_for(1, Duration::from_millis(50));
        let state = monitor.current_state();
        assert_eq!(state.status, LivenessStatus::Unknown);
        assert!(state.checked_at.is_none());
    }

    #[tokio::test]
    async fn test_loop_publishes_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = monitor_for(port, Duration::from_millis(50));

        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = monitor.current_state();
        assert_eq!(state.status, LivenessStatus::Reachable);
        assert!(state.checked_at.is_some());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_loop_tracks_target_going_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = monitor_for(port, Duration::from_millis(50));

        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.current_state().is_reachable());

        drop(listener);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(monitor.current_state().status, LivenessStatus::Unreachable);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_force_probe_updates_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = monitor_for(port, Duration::from_secs(60));

        let state = monitor.force_probe().await;
        assert!(state.is_reachable());
        assert_eq!(monitor.current_state(), state);
    }

    #[tokio::test]
    async fn test_stop_halts_probing() {
        let monitor = monitor_for(1, Duration::from_millis(20));
        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;

        let frozen = monitor.current_state();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.current_state(), frozen);
    }
}
