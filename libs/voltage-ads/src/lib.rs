//! Voltage ADS Client Library
//!
//! Resilient client layer for Beckhoff TwinCAT controllers speaking ADS over
//! AMS/TCP.
//!
//! # Architecture
//!
//! This library provides:
//! - **Hub**: one logical connection per controller, with operation timeouts,
//!   failure accounting, circuit breaking and exponential-backoff reconnects
//! - **Notifications**: on-change subscriptions that survive reconnects,
//!   delivered through a bounded channel and decoded off the transport task
//! - **Coordinator**: batched concurrent polling with stale-value fallback and
//!   per-address availability
//! - **Transports**: a native AMS/TCP client and an in-memory virtual
//!   controller (feature-gated)
//!
//! # Features
//!
//! - `virt` - Simulated controller for tests and offline runs (default)

pub mod ams;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod diagnostics;
pub mod error;
pub mod hub;
pub mod reconnect;
pub mod registry;
pub mod scaling;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(feature = "virt")]
pub mod virt;

// Re-export core types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{load_config, AddressConfig, AdsOptions, EndpointConfig, SessionConfig};
pub use coordinator::{CoordinatorStatus, PollSnapshot, PollingCoordinator};
pub use diagnostics::SessionDiagnostics;
pub use error::{AdsError, Result};
pub use hub::{AdsHub, HubEvent, HubStatus};
pub use scaling::Scaling;
pub use session::AdsSession;
pub use transport::{AdsTransport, NotificationSink, TransportFactory};
pub use types::{
    ConnectionState, DeviceState, NotificationCallback, PlcValue, ProtocolType, SubscriptionId,
};
