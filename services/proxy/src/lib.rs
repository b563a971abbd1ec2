//! Wake-on-LAN proxy.
//!
//! Listens on a local port per configured service, wakes the sleeping target
//! with a magic packet on first connection, and forwards traffic once the
//! target answers.
//!
//! ## Architecture
//!
//! - **LivenessChecker**: single bounded-time reachability probe
//! - **WakeSignaler**: magic packet broadcast
//! - **HealthMonitor**: background liveness loop per service
//! - **WakeCoordinator**: one wake episode per service, shared by all waiting clients
//! - **ServiceProxy**: listener, admission and forwarding for one service
//! - **ProxyManager**: starts and stops all services together

pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod liveness;
pub mod logging;
pub mod manager;
pub mod proxy;
pub mod stats;
pub mod wake;

pub use config::{Config, Protocol, ServiceConfig};
pub use coordinator::{WakeCoordinator, WakeOutcome};
pub use error::{ConfigError, ProxyError};
pub use health::{HealthMonitor, LivenessState, LivenessStatus};
pub use liveness::{Liveness, LivenessChecker};
pub use manager::{FailedService, ProxyManager};
pub use proxy::{DatagramForwarder, ServiceProxy, ShutdownPolicy, StreamForwarder};
pub use stats::{ServiceStats, StatsSnapshot};
pub use wake::WakeSignaler;
pub use wolp_networking::{MacAddress, MagicPacket};
