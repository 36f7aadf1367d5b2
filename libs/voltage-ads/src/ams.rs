//! AMS/TCP transport
//!
//! Native implementation of the ADS wire protocol over TCP:
//! - `constants`: command ids, index groups and framing sizes
//! - `frame`: AMS headers, the length-prefixed frame codec and payload helpers
//! - `connection`: request/response correlation and the [`AdsTransport`] impl
//!
//! [`AdsTransport`]: crate::transport::AdsTransport

pub mod connection;
pub mod constants;
pub mod frame;

pub use connection::{AmsTcpConfig, AmsTcpFactory, AmsTcpTransport};
pub use frame::{AmsAddr, AmsCodec, AmsFrame, AmsHeader, AmsNetId};
