//! Per-service proxying.
//!
//! This module provides:
//! - The service runtime (listener, accept loop, shutdown)
//! - Stream forwarding with half-close propagation
//! - Datagram forwarding with per-client associations
//!
//! ## Architecture
//!
//! ```text
//! Client -> ServiceProxy -> (target down?) WakeCoordinator -> magic packet + polling
//!                 |
//!                 +-> StreamForwarder / DatagramForwarder -> Target
//! ```

mod datagram;
mod service;
mod stream;

pub use datagram::{DatagramForwarder, Delivery};
pub use service::{ServiceProxy, ShutdownPolicy, DEFAULT_DRAIN_GRACE};
pub use stream::{relay, StreamForwarder, Transfer};
