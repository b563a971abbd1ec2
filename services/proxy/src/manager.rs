//! Lifecycle of all configured services.

use std::net::SocketAddr;

use futures_util::future::join_all;
use tracing::{error, info};

use crate::config::{check_unique_ports, ServiceConfig};
use crate::error::ProxyError;
use crate::proxy::{ServiceProxy, ShutdownPolicy};

/// A service that could not be started.
#[derive(Debug)]
pub struct FailedService {
    pub name: String,
    pub proxy_port: u16,
    pub error: ProxyError,
}

/// Owns every running service.
pub struct ProxyManager {
    services: Vec<ServiceProxy>,
    failed: Vec<FailedService>,
}

impl ProxyManager {
    /// Start one proxy per service.
    ///
    /// A duplicate proxy port rejects the whole set before anything is bound.
    /// Any other per-service failure (validation, bind) is recorded and the
    /// remaining services still start.
    pub async fn start(
        configs: Vec<ServiceConfig>,
        policy: ShutdownPolicy,
    ) -> Result<Self, ProxyError> {
        check_unique_ports(&configs)?;

        let mut services = Vec::with_capacity(configs.len());
        let mut failed = Vec::new();

        for config in configs {
            let name = config.name.clone();
            let proxy_port = config.proxy_port;

            match ServiceProxy::start(config, policy).await {
                Ok(service) => services.push(service),
                Err(e) => {
                    error!(
                        service = %name,
                        proxy_port,
                        reason = e.reason_code(),
                        error = %e,
                        "service failed to start"
                    );
                    failed.push(FailedService {
                        name,
                        proxy_port,
                        error: e,
                    });
                }
            }
        }

        info!(
            running = services.len(),
            failed = failed.len(),
            "proxy manager started"
        );

        Ok(Self { services, failed })
    }

    /// Services that are running.
    pub fn services(&self) -> &[ServiceProxy] {
        &self.services
    }

    /// Services that failed to start.
    pub fn failed(&self) -> &[FailedService] {
        &self.failed
    }

    pub fn service(&self, name: &str) -> Option<&ServiceProxy> {
        self.services.iter().find(|s| s.name() == name)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.services.iter().map(ServiceProxy::local_addr).collect()
    }

    /// True when no service is running.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Stop all services concurrently and wait for each to finish.
    pub async fn stop(self) {
        info!(services = self.services.len(), "stopping proxy manager");
        join_all(self.services.iter().map(|service| service.stop())).await;
        info!("proxy manager stopped");
    }
}
