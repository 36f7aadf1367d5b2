//! ADS Client Error Types
//!
//! Core error types for the connection hub, transports and polling coordinator.

use thiserror::Error;

/// Result type for voltage-ads operations
pub type Result<T> = std::result::Result<T, AdsError>;

/// ADS error code: target port not found
pub const ADSERR_TARGET_PORT_NOT_FOUND: u32 = 0x06;
/// ADS error code: target machine not found
pub const ADSERR_TARGET_MACHINE_NOT_FOUND: u32 = 0x07;
/// ADS error code: symbol not found
pub const ADSERR_DEVICE_SYMBOLNOTFOUND: u32 = 0x710;
/// ADS error code: symbol handle invalid
pub const ADSERR_DEVICE_INVALIDSYMBOL: u32 = 0x711;
/// ADS error code: client sync timeout
pub const ADSERR_CLIENT_SYNCTIMEOUT: u32 = 0x745;

/// ADS client errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdsError {
    /// No live transport, no attempt was made
    #[error("Not connected")]
    NotConnected,

    /// Circuit breaker denied the operation, no attempt was made
    #[error("Circuit breaker open - too many failures")]
    CircuitOpen,

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote or protocol level failure other than timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// The controller answered with a non-zero ADS result code
    #[error("ADS device error 0x{code:X}: {message}")]
    Device { code: u32, message: String },

    /// Invalid setup parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be decoded or encoded for the declared type
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A refresh cycle where every read failed and nothing could be substituted
    #[error("Poll failed: {0}")]
    PollFailed(String),
}

impl From<std::io::Error> for AdsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => AdsError::Timeout(err.to_string()),
            _ => AdsError::Transport(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AdsError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AdsError::Timeout(err.to_string())
    }
}

// Helper methods for creating errors
impl AdsError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        AdsError::Timeout(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        AdsError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AdsError::Config(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AdsError::InvalidData(msg.into())
    }

    /// Build an error from an ADS result code.
    ///
    /// The client sync timeout code is reported as a timeout so that the hub
    /// accounts it against the timeout budget.
    pub fn from_ads_code(code: u32) -> Self {
        if code == ADSERR_CLIENT_SYNCTIMEOUT {
            return AdsError::Timeout(format!("device reported sync timeout (0x{code:X})"));
        }
        AdsError::Device {
            code,
            message: ads_code_message(code).to_string(),
        }
    }

    /// Whether this error counts against the consecutive-timeout budget
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdsError::Timeout(_))
    }

    /// Whether this error was produced by an actual attempt against the transport
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            AdsError::Timeout(_)
                | AdsError::Transport(_)
                | AdsError::Device { .. }
                | AdsError::InvalidData(_)
        )
    }

    /// Format this error for a log line about `address`
    pub fn describe_for(&self, address: &str) -> String {
        match self {
            AdsError::Timeout(_) => format!("Timeout accessing {address}"),
            AdsError::Device {
                code: ADSERR_DEVICE_SYMBOLNOTFOUND,
                ..
            } => format!("Variable {address} not found in PLC"),
            AdsError::Device {
                code: ADSERR_DEVICE_INVALIDSYMBOL,
                ..
            } => format!("Invalid handle for {address} - variable may not exist"),
            AdsError::NotConnected | AdsError::Transport(_) => {
                format!("Connection lost while accessing {address}")
            },
            other => format!("Error accessing {address}: {other}"),
        }
    }
}

/// Short description of well-known ADS result codes
pub fn ads_code_message(code: u32) -> &'static str {
    match code {
        ADSERR_TARGET_PORT_NOT_FOUND => "target port not found",
        ADSERR_TARGET_MACHINE_NOT_FOUND => "target machine not found (missing route?)",
        0x701 => "service not supported by server",
        0x702 => "invalid index group",
        0x703 => "invalid index offset",
        0x705 => "parameter size not correct",
        0x706 => "invalid data values",
        ADSERR_DEVICE_SYMBOLNOTFOUND => "symbol not found",
        ADSERR_DEVICE_INVALIDSYMBOL => "symbol handle invalid",
        0x714 => "notification handle invalid",
        ADSERR_CLIENT_SYNCTIMEOUT => "client sync timeout",
        _ => "unknown ADS error",
    }
}
