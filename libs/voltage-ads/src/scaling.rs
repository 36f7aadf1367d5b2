//! Linear scaling between raw controller values and engineering units
//!
//! `scaled = raw * factor + offset`, optionally rounded to a fixed number of
//! decimals. Writes go the other way and are converted back to the declared
//! PLC type of the variable.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::types::{PlcValue, ProtocolType};

fn scale_one() -> f64 {
    1.0
}

/// Scaling parameters attached to one address
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    #[serde(default = "scale_one")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    /// Decimal places to round scaled values to
    #[serde(default)]
    pub precision: Option<u32>,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            precision: None,
        }
    }
}

impl Scaling {
    pub fn new(factor: f64, offset: f64) -> Self {
        Self {
            factor,
            offset,
            precision: None,
        }
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Scale a raw value; `None` if it is not numeric
    pub fn apply(&self, raw: &PlcValue) -> Option<f64> {
        let Some(value) = raw.as_f64() else {
            warn!("Could not scale value {}", raw);
            return None;
        };
        let scaled = value * self.factor + self.offset;
        Some(match self.precision {
            Some(places) => round_to(scaled, places),
            None => scaled,
        })
    }

    /// Undo the scaling and convert to the representation of `target`
    pub fn reverse(&self, scaled: f64, target: ProtocolType) -> PlcValue {
        if self.factor == 0.0 {
            error!("Cannot reverse scale with factor of 0");
            return PlcValue::Float(scaled);
        }
        let raw = (scaled - self.offset) / self.factor;

        match target {
            ProtocolType::Bool => PlcValue::Bool(raw != 0.0),
            ProtocolType::Sint
            | ProtocolType::Int
            | ProtocolType::Dint
            | ProtocolType::Time
            | ProtocolType::Date
            | ProtocolType::Dt
            | ProtocolType::Tod => PlcValue::Integer(raw.trunc() as i64),
            ProtocolType::Byte
            | ProtocolType::Usint
            | ProtocolType::Uint
            | ProtocolType::Word
            | ProtocolType::Udint
            | ProtocolType::Dword => PlcValue::Integer(raw.max(0.0).trunc() as i64),
            ProtocolType::Real | ProtocolType::Lreal | ProtocolType::String | ProtocolType::Raw(_) => {
                PlcValue::Float(raw)
            },
        }
    }

    pub fn is_identity(&self) -> bool {
        self.factor == 1.0 && self.offset == 0.0 && self.precision.is_none()
    }
}

fn round_to(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}
