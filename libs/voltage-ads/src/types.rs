//! Core value and state types shared by the hub, registry and coordinator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::AdsError;

/// Default declared size of a PLC `STRING` (80 characters + terminator)
pub const PLC_STRING_SIZE: u32 = 81;

// ============================================================================
// Protocol Type
// ============================================================================

/// Declared PLC data type of a remote variable
///
/// The set is closed; `Raw` stands for any type this layer does not
/// interpret and carries the byte size to transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProtocolType {
    Bool,
    Byte,
    Sint,
    Usint,
    Int,
    Uint,
    Word,
    Dint,
    Udint,
    Dword,
    #[default]
    Real,
    Lreal,
    String,
    Time,
    Date,
    Dt,
    Tod,
    /// Unsupported type, delivered as raw bytes
    Raw(u32),
}

impl ProtocolType {
    /// Number of bytes the controller transfers for this type
    pub fn byte_size(&self) -> u32 {
        match self {
            ProtocolType::Bool | ProtocolType::Byte | ProtocolType::Sint | ProtocolType::Usint => 1,
            ProtocolType::Int | ProtocolType::Uint | ProtocolType::Word => 2,
            ProtocolType::Dint
            | ProtocolType::Udint
            | ProtocolType::Dword
            | ProtocolType::Real
            | ProtocolType::Time
            | ProtocolType::Date
            | ProtocolType::Dt
            | ProtocolType::Tod => 4,
            ProtocolType::Lreal => 8,
            ProtocolType::String => PLC_STRING_SIZE,
            ProtocolType::Raw(size) => *size,
        }
    }

    /// PLC type name as written in configuration files
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolType::Bool => "BOOL",
            ProtocolType::Byte => "BYTE",
            ProtocolType::Sint => "SINT",
            ProtocolType::Usint => "USINT",
            ProtocolType::Int => "INT",
            ProtocolType::Uint => "UINT",
            ProtocolType::Word => "WORD",
            ProtocolType::Dint => "DINT",
            ProtocolType::Udint => "UDINT",
            ProtocolType::Dword => "DWORD",
            ProtocolType::Real => "REAL",
            ProtocolType::Lreal => "LREAL",
            ProtocolType::String => "STRING",
            ProtocolType::Time => "TIME",
            ProtocolType::Date => "DATE",
            ProtocolType::Dt => "DT",
            ProtocolType::Tod => "TOD",
            ProtocolType::Raw(_) => "RAW",
        }
    }

    /// Whether notification payloads of this type are decoded
    pub fn is_supported(&self) -> bool {
        !matches!(self, ProtocolType::Raw(_))
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Raw(size) => write!(f, "RAW({size})"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for ProtocolType {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.trim().to_ascii_uppercase().as_str() {
            "BOOL" => ProtocolType::Bool,
            "BYTE" => ProtocolType::Byte,
            "SINT" => ProtocolType::Sint,
            "USINT" => ProtocolType::Usint,
            "INT" => ProtocolType::Int,
            "UINT" => ProtocolType::Uint,
            "WORD" => ProtocolType::Word,
            "DINT" => ProtocolType::Dint,
            "UDINT" => ProtocolType::Udint,
            "DWORD" => ProtocolType::Dword,
            "REAL" => ProtocolType::Real,
            "LREAL" => ProtocolType::Lreal,
            "STRING" => ProtocolType::String,
            "TIME" => ProtocolType::Time,
            "DATE" => ProtocolType::Date,
            "DT" => ProtocolType::Dt,
            "TOD" => ProtocolType::Tod,
            other => {
                return Err(AdsError::config(format!("unsupported PLC type: {other}")));
            },
        };
        Ok(ty)
    }
}

impl TryFrom<String> for ProtocolType {
    type Error = AdsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolType> for String {
    fn from(value: ProtocolType) -> Self {
        value.to_string()
    }
}

// ============================================================================
// PLC Value
// ============================================================================

/// Decoded value of a remote variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Payload of an unsupported type, left unparsed
    Bytes(Vec<u8>),
}

impl From<bool> for PlcValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PlcValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for PlcValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for PlcValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PlcValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PlcValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl PlcValue {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bytes(_) => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => Some(f.round() as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bytes(_) => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            Self::Bytes(_) => None,
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(b) => write!(f, "{b}"),
            PlcValue::Integer(i) => write!(f, "{i}"),
            PlcValue::Float(v) => write!(f, "{v}"),
            PlcValue::String(s) => f.write_str(s),
            PlcValue::Bytes(bytes) => {
                for (i, byte) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            },
        }
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Connection state of the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Result of a ReadState request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub ads_state: u16,
    pub device_state: u16,
}

impl DeviceState {
    /// ADSSTATE_RUN
    pub const RUN: u16 = 5;

    pub fn is_running(&self) -> bool {
        self.ads_state == Self::RUN
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Stable identifier of a notification subscription
///
/// Assigned by the hub; stays valid across reconnects even though the
/// transport-side handle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Transport-side notification handle
pub type NotificationHandle = u32;

/// Callback invoked with `(address, decoded value)` for every notification
pub type NotificationCallback = Arc<dyn Fn(&str, &PlcValue) + Send + Sync>;
