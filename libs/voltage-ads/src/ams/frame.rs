//! AMS frame layout and codec
//!
//! ```text
//! AMS/TCP header (6)   reserved u16 | length u32
//! AMS header (32)      target netid [6] | target port u16
//!                      source netid [6] | source port u16
//!                      command u16 | state flags u16 | data length u32
//!                      error code u32 | invoke id u32
//! data (data length)
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use crate::error::{AdsError, Result};
use crate::types::{DeviceState, NotificationHandle};

// ============================================================================
// Addressing
// ============================================================================

/// Six-octet AMS network id, written `a.b.c.d.e.f`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// The conventional net id for a host: its IPv4 address plus `.1.1`
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([a, b, c, d, 1, 1])
    }
}

impl FromStr for AmsNetId {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split('.');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| AdsError::config(format!("AMS net id '{s}' needs 6 octets")))?;
            *octet = part
                .parse()
                .map_err(|_| AdsError::config(format!("Invalid octet '{part}' in AMS net id '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(AdsError::config(format!("AMS net id '{s}' has more than 6 octets")));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}

/// Net id plus ADS port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AmsAddr {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl AmsAddr {
    pub fn new(net_id: AmsNetId, port: u16) -> Self {
        Self { net_id, port }
    }
}

impl fmt::Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

// ============================================================================
// Header and frame
// ============================================================================

/// The 32-byte AMS header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub command: u16,
    pub state_flags: u16,
    pub data_length: u32,
    pub error_code: u32,
    pub invoke_id: u32,
}

impl AmsHeader {
    fn parse(buf: &mut BytesMut) -> Self {
        let mut target = [0u8; 6];
        buf.copy_to_slice(&mut target);
        let target_port = buf.get_u16_le();
        let mut source = [0u8; 6];
        buf.copy_to_slice(&mut source);
        let source_port = buf.get_u16_le();
        Self {
            target: AmsAddr::new(AmsNetId(target), target_port),
            source: AmsAddr::new(AmsNetId(source), source_port),
            command: buf.get_u16_le(),
            state_flags: buf.get_u16_le(),
            data_length: buf.get_u32_le(),
            error_code: buf.get_u32_le(),
            invoke_id: buf.get_u32_le(),
        }
    }

    fn write(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.target.net_id.0);
        dst.put_u16_le(self.target.port);
        dst.put_slice(&self.source.net_id.0);
        dst.put_u16_le(self.source.port);
        dst.put_u16_le(self.command);
        dst.put_u16_le(self.state_flags);
        dst.put_u32_le(self.data_length);
        dst.put_u32_le(self.error_code);
        dst.put_u32_le(self.invoke_id);
    }
}

/// One AMS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmsFrame {
    pub header: AmsHeader,
    pub data: Bytes,
}

impl AmsFrame {
    /// Build a request frame
    pub fn request(
        target: AmsAddr,
        source: AmsAddr,
        command: u16,
        invoke_id: u32,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            header: AmsHeader {
                target,
                source,
                command,
                state_flags: STATE_FLAG_REQUEST,
                data_length: data.len() as u32,
                error_code: 0,
                invoke_id,
            },
            data,
        }
    }

    /// Build the response to `request`, swapping source and target
    pub fn response_to(request: &AmsHeader, error_code: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            header: AmsHeader {
                target: request.source,
                source: request.target,
                command: request.command,
                state_flags: STATE_FLAG_RESPONSE,
                data_length: data.len() as u32,
                error_code,
                invoke_id: request.invoke_id,
            },
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        self.header.state_flags & 0x0001 != 0
    }
}

/// Length-prefixed AMS/TCP codec for `Framed` streams
#[derive(Debug, Default, Clone, Copy)]
pub struct AmsCodec;

impl Decoder for AmsCodec {
    type Item = AmsFrame;
    type Error = AdsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AmsFrame>> {
        if src.len() < AMS_TCP_HEADER_SIZE {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if !(AMS_HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
            return Err(AdsError::transport(format!(
                "Invalid AMS/TCP frame length {length}"
            )));
        }

        let total = AMS_TCP_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(AMS_TCP_HEADER_SIZE);
        let header = AmsHeader::parse(&mut frame);
        let declared = header.data_length as usize;
        if declared > frame.len() {
            return Err(AdsError::transport(format!(
                "AMS header declares {declared} data bytes, frame carries {}",
                frame.len()
            )));
        }
        let data = frame.split_to(declared).freeze();
        Ok(Some(AmsFrame { header, data }))
    }
}

impl Encoder<AmsFrame> for AmsCodec {
    type Error = AdsError;

    fn encode(&mut self, frame: AmsFrame, dst: &mut BytesMut) -> Result<()> {
        let header = AmsHeader {
            data_length: frame.data.len() as u32,
            ..frame.header
        };
        dst.reserve(AMS_TCP_HEADER_SIZE + AMS_HEADER_SIZE + frame.data.len());
        dst.put_u16_le(0);
        dst.put_u32_le((AMS_HEADER_SIZE + frame.data.len()) as u32);
        header.write(dst);
        dst.put_slice(&frame.data);
        Ok(())
    }
}

// ============================================================================
// Request payloads
// ============================================================================

pub fn read_request(index_group: u32, index_offset: u32, length: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.put_u32_le(index_group);
    buf.put_u32_le(index_offset);
    buf.put_u32_le(length);
    buf
}

pub fn write_request(index_group: u32, index_offset: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + data.len());
    buf.put_u32_le(index_group);
    buf.put_u32_le(index_offset);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf
}

pub fn read_write_request(
    index_group: u32,
    index_offset: u32,
    read_length: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + data.len());
    buf.put_u32_le(index_group);
    buf.put_u32_le(index_offset);
    buf.put_u32_le(read_length);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf
}

/// On-change notification of `length` bytes
pub fn add_notification_request(index_group: u32, index_offset: u32, length: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.put_u32_le(index_group);
    buf.put_u32_le(index_offset);
    buf.put_u32_le(length);
    buf.put_u32_le(ADSTRANS_SERVERONCHA);
    buf.put_u32_le(NOTIFICATION_MAX_DELAY);
    buf.put_u32_le(NOTIFICATION_CYCLE_TIME);
    buf.put_bytes(0, 16);
    buf
}

pub fn del_notification_request(handle: NotificationHandle) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

// ============================================================================
// Response payloads
// ============================================================================

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(AdsError::invalid_data(format!(
            "{what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Consume the leading ADS result code, failing on non-zero
fn take_result(buf: &mut &[u8]) -> Result<()> {
    need(*buf, 4, "ADS result")?;
    match buf.get_u32_le() {
        0 => Ok(()),
        code => Err(AdsError::from_ads_code(code)),
    }
}

/// Response carrying only a result code (Write, DelNotification)
pub fn parse_result(data: &[u8]) -> Result<()> {
    let mut buf = data;
    take_result(&mut buf)
}

/// Read and ReadWrite responses: result, length, data
pub fn parse_read_response(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data;
    take_result(&mut buf)?;
    need(buf, 4, "read length")?;
    let length = buf.get_u32_le() as usize;
    need(buf, length, "read data")?;
    Ok(buf[..length].to_vec())
}

pub fn parse_read_state_response(data: &[u8]) -> Result<DeviceState> {
    let mut buf = data;
    take_result(&mut buf)?;
    need(buf, 4, "device state")?;
    Ok(DeviceState {
        ads_state: buf.get_u16_le(),
        device_state: buf.get_u16_le(),
    })
}

/// AddNotification response: result, notification handle
pub fn parse_handle_response(data: &[u8]) -> Result<u32> {
    let mut buf = data;
    take_result(&mut buf)?;
    need(buf, 4, "handle")?;
    Ok(buf.get_u32_le())
}

/// Flatten an inbound DeviceNotification into `(handle, data)` samples
pub fn parse_device_notification(data: &[u8]) -> Result<Vec<(NotificationHandle, Vec<u8>)>> {
    let mut buf = data;
    need(buf, 8, "notification header")?;
    let _length = buf.get_u32_le();
    let stamps = buf.get_u32_le();

    let mut samples = Vec::new();
    for _ in 0..stamps {
        need(buf, 12, "stamp header")?;
        let _timestamp = buf.get_u64_le();
        let count = buf.get_u32_le();
        for _ in 0..count {
            need(buf, 8, "sample header")?;
            let handle = buf.get_u32_le();
            let size = buf.get_u32_le() as usize;
            need(buf, size, "sample data")?;
            samples.push((handle, buf[..size].to_vec()));
            buf.advance(size);
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> AmsAddr {
        AmsAddr::new(AmsNetId([10, 0, 0, last, 1, 1]), port)
    }

    #[test]
    fn test_net_id_parse_and_display() {
        let id: AmsNetId = "5.1.204.160.1.1".parse().unwrap();
        assert_eq!(id.0, [5, 1, 204, 160, 1, 1]);
        assert_eq!(id.to_string(), "5.1.204.160.1.1");
        assert!("5.1.2.3.1".parse::<AmsNetId>().is_err());
        assert!("5.1.2.3.1.1.1".parse::<AmsNetId>().is_err());
        assert!("5.1.2.300.1.1".parse::<AmsNetId>().is_err());
        assert_eq!(
            AmsNetId::from_ipv4(Ipv4Addr::new(192, 168, 0, 7)).to_string(),
            "192.168.0.7.1.1"
        );
    }

    #[test]
    fn test_encode_layout() {
        let frame = AmsFrame::request(addr(2, 851), addr(1, 32905), CMD_READ, 0x0102_0304, vec![0xAA]);
        let mut dst = BytesMut::new();
        AmsCodec.encode(frame, &mut dst).unwrap();

        assert_eq!(dst.len(), 6 + 32 + 1);
        assert_eq!(&dst[0..2], &[0, 0]);
        assert_eq!(&dst[2..6], &33u32.to_le_bytes());
        assert_eq!(&dst[6..12], &[10, 0, 0, 2, 1, 1]);
        assert_eq!(&dst[12..14], &851u16.to_le_bytes());
        assert_eq!(&dst[22..24], &CMD_READ.to_le_bytes());
        assert_eq!(&dst[24..26], &STATE_FLAG_REQUEST.to_le_bytes());
        assert_eq!(&dst[26..30], &1u32.to_le_bytes());
        assert_eq!(&dst[34..38], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(dst[38], 0xAA);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let request = AmsFrame::request(addr(2, 851), addr(1, 32905), CMD_WRITE, 9, vec![1, 2, 3]);
        let response = AmsFrame::response_to(&request.header, 0, vec![0, 0, 0, 0]);
        let mut wire = BytesMut::new();
        AmsCodec.encode(response.clone(), &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..20]);
        assert!(AmsCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[20..]);
        let decoded = AmsCodec.decode(&mut partial).unwrap().unwrap();

        assert_eq!(decoded, response);
        assert!(decoded.is_response());
        assert_eq!(decoded.header.target, addr(1, 32905));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut src = BytesMut::from(&[0u8, 0, 4, 0, 0, 0][..]);
        assert!(AmsCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_request_payloads() {
        assert_eq!(read_request(0xF005, 7, 4).len(), 12);
        let rw = read_write_request(ADSIGRP_SYM_HNDBYNAME, 0, 4, b"MAIN.x");
        assert_eq!(&rw[8..12], &4u32.to_le_bytes());
        assert_eq!(&rw[12..16], &6u32.to_le_bytes());
        assert_eq!(&rw[16..], b"MAIN.x");
        let add = add_notification_request(ADSIGRP_SYM_VALBYHND, 3, 2);
        assert_eq!(add.len(), 40);
        assert_eq!(&add[12..16], &ADSTRANS_SERVERONCHA.to_le_bytes());
    }

    #[test]
    fn test_parse_responses() {
        let mut ok = vec![0, 0, 0, 0];
        ok.extend_from_slice(&2u32.to_le_bytes());
        ok.extend_from_slice(&[0x34, 0x12]);
        assert_eq!(parse_read_response(&ok).unwrap(), vec![0x34, 0x12]);

        let err = parse_read_response(&0x710u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, AdsError::Device { code: 0x710, .. }));

        let state = parse_read_state_response(&[0, 0, 0, 0, 5, 0, 0, 0]).unwrap();
        assert!(state.is_running());

        assert!(parse_read_response(&[0, 0, 0, 0, 9, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_parse_device_notification() {
        let mut data = Vec::new();
        data.put_u32_le(0);
        data.put_u32_le(2);
        // stamp 1: two samples
        data.put_u64_le(133_000_000_000_000_000);
        data.put_u32_le(2);
        data.put_u32_le(11);
        data.put_u32_le(1);
        data.put_u8(1);
        data.put_u32_le(12);
        data.put_u32_le(2);
        data.put_slice(&[0xFE, 0xFF]);
        // stamp 2: one sample
        data.put_u64_le(133_000_000_000_000_001);
        data.put_u32_le(1);
        data.put_u32_le(11);
        data.put_u32_le(1);
        data.put_u8(0);

        let samples = parse_device_notification(&data).unwrap();
        assert_eq!(
            samples,
            vec![(11, vec![1]), (12, vec![0xFE, 0xFF]), (11, vec![0])]
        );

        assert!(parse_device_notification(&data[..data.len() - 1]).is_err());
    }
}
