//! Session configuration
//!
//! Options are loaded from a YAML file and overlaid with `ADS_` prefixed
//! environment variables (`ADS_OPTIONS__SCAN_INTERVAL_SECS=2`).

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ams::AmsNetId;
use crate::error::{AdsError, Result};
use crate::types::ProtocolType;

/// Default ADS runtime port (TwinCAT 3 PLC runtime 1)
pub const DEFAULT_ADS_PORT: u16 = 851;
/// Default AMS/TCP router port
pub const DEFAULT_TCP_PORT: u16 = 48898;
/// Default local AMS source port
pub const DEFAULT_SOURCE_PORT: u16 = 32905;
/// Default per-operation deadline in seconds
pub const DEFAULT_OPERATION_TIMEOUT: u64 = 5;
/// Default breaker failure threshold
pub const DEFAULT_MAX_FAILURES: u32 = 3;
/// Default reconnect delay ceiling in seconds
pub const DEFAULT_RECONNECT_MAX_DELAY: u64 = 60;
/// Default polling interval in seconds
pub const DEFAULT_SCAN_INTERVAL: u64 = 5;
/// Default notification queue capacity
pub const DEFAULT_NOTIFICATION_QUEUE: usize = 256;

fn default_ads_port() -> u16 {
    DEFAULT_ADS_PORT
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_source_port() -> u16 {
    DEFAULT_SOURCE_PORT
}

fn default_operation_timeout() -> u64 {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_FAILURES
}

fn default_reconnect_max_delay() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL
}

fn default_notification_queue() -> usize {
    DEFAULT_NOTIFICATION_QUEUE
}

fn default_true() -> bool {
    true
}

/// Where the controller lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    /// ADS port of the target runtime
    #[serde(default = "default_ads_port")]
    pub port: u16,
    pub ams_net_id: String,
    /// Local AMS net id; derived from the local socket address when absent
    #[serde(default)]
    pub local_ams_net_id: Option<String>,
    #[serde(default = "default_source_port")]
    pub source_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, ams_net_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_ADS_PORT,
            ams_net_id: ams_net_id.into(),
            local_ams_net_id: None,
            source_port: DEFAULT_SOURCE_PORT,
            tcp_port: DEFAULT_TCP_PORT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AdsError::config("host must not be empty"));
        }
        self.ams_net_id.parse::<AmsNetId>()?;
        if let Some(local) = &self.local_ams_net_id {
            local.parse::<AmsNetId>()?;
        }
        if self.port == 0 {
            return Err(AdsError::config("port must be between 1 and 65535"));
        }
        Ok(())
    }
}

/// Tunables shared by hub and coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdsOptions {
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_connection_failures: u32,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_true")]
    pub use_notifications: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_notification_queue")]
    pub notification_queue_capacity: usize,
}

impl Default for AdsOptions {
    fn default() -> Self {
        Self {
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT,
            max_connection_failures: DEFAULT_MAX_FAILURES,
            reconnect_max_delay_secs: DEFAULT_RECONNECT_MAX_DELAY,
            use_notifications: true,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL,
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE,
        }
    }
}

impl AdsOptions {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Check every option against its accepted range
    pub fn validate(&self) -> Result<()> {
        if !(1..=30).contains(&self.operation_timeout_secs) {
            return Err(AdsError::config(format!(
                "operation_timeout_secs must be 1-30, got {}",
                self.operation_timeout_secs
            )));
        }
        if !(1..=10).contains(&self.max_connection_failures) {
            return Err(AdsError::config(format!(
                "max_connection_failures must be 1-10, got {}",
                self.max_connection_failures
            )));
        }
        if !(10..=300).contains(&self.reconnect_max_delay_secs) {
            return Err(AdsError::config(format!(
                "reconnect_max_delay_secs must be 10-300, got {}",
                self.reconnect_max_delay_secs
            )));
        }
        if self.scan_interval_secs == 0 {
            return Err(AdsError::config("scan_interval_secs must be at least 1"));
        }
        if self.notification_queue_capacity == 0 {
            return Err(AdsError::config("notification_queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// One polled PLC variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressConfig {
    pub address: String,
    #[serde(default)]
    pub plc_type: ProtocolType,
    /// Per-address opt-out from notifications
    #[serde(default = "default_true")]
    pub use_notifications: bool,
}

impl AddressConfig {
    pub fn new(address: impl Into<String>, plc_type: ProtocolType) -> Self {
        Self {
            address: address.into(),
            plc_type,
            use_notifications: true,
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub options: AdsOptions,
    #[serde(default)]
    pub addresses: Vec<AddressConfig>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        self.options.validate()?;
        validate_addresses(&self.addresses)
    }
}

/// Reject empty or duplicated address entries
pub fn validate_addresses(addresses: &[AddressConfig]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in addresses {
        if entry.address.trim().is_empty() {
            return Err(AdsError::config("address entries must not be empty"));
        }
        if !seen.insert(entry.address.as_str()) {
            return Err(AdsError::config(format!(
                "address {} is configured more than once",
                entry.address
            )));
        }
    }
    Ok(())
}

/// Load and validate a session configuration file
///
/// The format follows the file extension (`.yaml`, `.yml`, `.toml`, `.json`);
/// environment variables prefixed `ADS_` override file values, with `__`
/// separating nested keys.
pub fn load_config(path: impl AsRef<Path>) -> Result<SessionConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdsError::config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        _ => Figment::new().merge(Yaml::file(path)),
    };

    let config: SessionConfig = figment
        .merge(Env::prefixed("ADS_").split("__"))
        .extract()
        .map_err(|e| {
            AdsError::config(format!(
                "Failed to load configuration from {}: {e}",
                path.display()
            ))
        })?;

    config.validate()?;
    Ok(config)
}
