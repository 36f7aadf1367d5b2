//! Payload codec for PLC values
//!
//! Fixed mapping from [`ProtocolType`] to a little-endian byte layout. Used
//! for notification payloads and for by-name reads/writes.
//!
//! | Type | Bytes | Rule |
//! |------|-------|------|
//! | BOOL | 1 | nonzero = true |
//! | BYTE/USINT, SINT | 1 | u8 / i8 |
//! | WORD/UINT, INT | 2 | u16 / i16 |
//! | DWORD/UDINT, DINT | 4 | u32 / i32 |
//! | REAL, LREAL | 4, 8 | IEEE 754 |
//! | STRING | n | truncated at first NUL, lossy UTF-8 |
//! | TIME, DATE, DT, TOD | 4 | opaque i32 |

use tracing::debug;

use crate::error::{AdsError, Result};
use crate::types::{PlcValue, ProtocolType, PLC_STRING_SIZE};

fn take<const N: usize>(data: &[u8], ty: ProtocolType) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            AdsError::invalid_data(format!(
                "{ty} needs {N} bytes, payload has {}",
                data.len()
            ))
        })
}

/// Decode a raw payload as `ty`
///
/// Unsupported types yield the unparsed bytes.
pub fn decode(ty: ProtocolType, data: &[u8]) -> Result<PlcValue> {
    let value = match ty {
        ProtocolType::Bool => PlcValue::Bool(take::<1>(data, ty)?[0] != 0),
        ProtocolType::Byte | ProtocolType::Usint => {
            PlcValue::Integer(i64::from(u8::from_le_bytes(take(data, ty)?)))
        },
        ProtocolType::Sint => PlcValue::Integer(i64::from(i8::from_le_bytes(take(data, ty)?))),
        ProtocolType::Word | ProtocolType::Uint => {
            PlcValue::Integer(i64::from(u16::from_le_bytes(take(data, ty)?)))
        },
        ProtocolType::Int => PlcValue::Integer(i64::from(i16::from_le_bytes(take(data, ty)?))),
        ProtocolType::Dword | ProtocolType::Udint => {
            PlcValue::Integer(i64::from(u32::from_le_bytes(take(data, ty)?)))
        },
        ProtocolType::Dint
        | ProtocolType::Time
        | ProtocolType::Date
        | ProtocolType::Dt
        | ProtocolType::Tod => PlcValue::Integer(i64::from(i32::from_le_bytes(take(data, ty)?))),
        ProtocolType::Real => PlcValue::Float(f64::from(f32::from_le_bytes(take(data, ty)?))),
        ProtocolType::Lreal => PlcValue::Float(f64::from_le_bytes(take(data, ty)?)),
        ProtocolType::String => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            PlcValue::String(String::from_utf8_lossy(&data[..end]).into_owned())
        },
        ProtocolType::Raw(_) => {
            debug!("Unsupported datatype for decode, passing {} raw bytes", data.len());
            PlcValue::Bytes(data.to_vec())
        },
    };
    Ok(value)
}

fn integer_in<T>(value: &PlcValue, ty: ProtocolType) -> Result<T>
where
    T: TryFrom<i64>,
{
    let raw = value
        .as_i64()
        .ok_or_else(|| AdsError::invalid_data(format!("{value:?} is not a valid {ty}")))?;
    T::try_from(raw).map_err(|_| AdsError::invalid_data(format!("{raw} out of range for {ty}")))
}

/// Encode `value` into the wire layout of `ty`
pub fn encode(value: &PlcValue, ty: ProtocolType) -> Result<Vec<u8>> {
    let bytes = match ty {
        ProtocolType::Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| AdsError::invalid_data(format!("{value:?} is not a BOOL")))?;
            vec![u8::from(b)]
        },
        ProtocolType::Byte | ProtocolType::Usint => integer_in::<u8>(value, ty)?.to_le_bytes().to_vec(),
        ProtocolType::Sint => integer_in::<i8>(value, ty)?.to_le_bytes().to_vec(),
        ProtocolType::Word | ProtocolType::Uint => integer_in::<u16>(value, ty)?.to_le_bytes().to_vec(),
        ProtocolType::Int => integer_in::<i16>(value, ty)?.to_le_bytes().to_vec(),
        ProtocolType::Dword | ProtocolType::Udint => {
            integer_in::<u32>(value, ty)?.to_le_bytes().to_vec()
        },
        ProtocolType::Dint
        | ProtocolType::Time
        | ProtocolType::Date
        | ProtocolType::Dt
        | ProtocolType::Tod => integer_in::<i32>(value, ty)?.to_le_bytes().to_vec(),
        ProtocolType::Real => {
            let f = value
                .as_f64()
                .ok_or_else(|| AdsError::invalid_data(format!("{value:?} is not a REAL")))?;
            (f as f32).to_le_bytes().to_vec()
        },
        ProtocolType::Lreal => {
            let f = value
                .as_f64()
                .ok_or_else(|| AdsError::invalid_data(format!("{value:?} is not a LREAL")))?;
            f.to_le_bytes().to_vec()
        },
        ProtocolType::String => {
            let PlcValue::String(s) = value else {
                return Err(AdsError::invalid_data(format!("{value:?} is not a STRING")));
            };
            if s.len() >= PLC_STRING_SIZE as usize {
                return Err(AdsError::invalid_data(format!(
                    "string of {} bytes exceeds STRING capacity",
                    s.len()
                )));
            }
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            bytes
        },
        ProtocolType::Raw(size) => {
            let PlcValue::Bytes(bytes) = value else {
                return Err(AdsError::invalid_data(format!("{ty} accepts raw bytes only")));
            };
            if bytes.len() != size as usize {
                return Err(AdsError::invalid_data(format!(
                    "{ty} expects {size} bytes, got {}",
                    bytes.len()
                )));
            }
            bytes.clone()
        },
    };
    Ok(bytes)
}
