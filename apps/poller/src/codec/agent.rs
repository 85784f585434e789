//! Agent protocol framing and reply decoding.
//!
//! A frame is `ZBXD`, a flags byte, the payload length and a reserved field
//! (both 4-byte little-endian, or 8-byte with the large-packet flag), then
//! the payload. Old agents may reply without a header, in which case the
//! whole stream up to EOF is the payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::CheckValue;
use crate::error::CheckError;
use crate::item::ValueType;

pub const PROTOCOL_SIGNATURE: &[u8; 4] = b"ZBXD";
pub const FLAG_PROTOCOL: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;
pub const FLAG_LARGE: u8 = 0x04;

/// Replies larger than this are refused
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

const NOTSUPPORTED: &str = "ZBX_NOTSUPPORTED";
const ERROR: &str = "ZBX_ERROR";

/// Frame a key for a passive check request
pub fn encode_request(key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(13 + key.len());
    buf.put_slice(PROTOCOL_SIGNATURE);
    buf.put_u8(FLAG_PROTOCOL);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(0);
    buf.put_slice(key.as_bytes());
    buf.freeze()
}

/// Progress of parsing a buffered reply
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// More bytes are needed before anything can be said
    Incomplete,
    /// A full frame is buffered; holds its payload
    Complete(&'a [u8]),
    /// No protocol header, the reply runs until the peer closes
    Unframed,
}

/// Inspect the bytes received so far
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, CheckError> {
    let probe = buf.len().min(PROTOCOL_SIGNATURE.len());
    if buf[..probe] != PROTOCOL_SIGNATURE[..probe] {
        return Ok(Frame::Unframed);
    }
    if buf.len() < 5 {
        return Ok(Frame::Incomplete);
    }

    let flags = buf[4];
    if flags & FLAG_PROTOCOL == 0 {
        return Err(CheckError::network(format!("unknown protocol flags 0x{flags:02x} in reply")));
    }
    if flags & FLAG_COMPRESSED != 0 {
        return Err(CheckError::network("compressed replies are not supported"));
    }

    let (header_len, len_size) = if flags & FLAG_LARGE != 0 { (21, 8) } else { (13, 4) };
    if buf.len() < header_len {
        return Ok(Frame::Incomplete);
    }

    let mut raw = [0u8; 8];
    raw[..len_size].copy_from_slice(&buf[5..5 + len_size]);
    let payload_len = u64::from_le_bytes(raw);

    if payload_len > MAX_RESPONSE_SIZE as u64 {
        return Err(CheckError::network(format!(
            "message size {payload_len} exceeds the maximum size {MAX_RESPONSE_SIZE} bytes"
        )));
    }

    let total = header_len + payload_len as usize;
    if buf.len() < total {
        return Ok(Frame::Incomplete);
    }

    Ok(Frame::Complete(&buf[header_len..total]))
}

/// Interpret an agent reply payload
pub fn decode_response(payload: &[u8], value_type: ValueType, addr: &str) -> Result<CheckValue, CheckError> {
    if payload.is_empty() {
        return Err(CheckError::network(format!(
            "Received empty response from agent at [{addr}]. Assuming that agent dropped connection \
             because of access permissions."
        )));
    }

    let text = String::from_utf8_lossy(payload);

    if let Some(rest) = text.strip_prefix(NOTSUPPORTED) {
        let message = rest
            .strip_prefix('\0')
            .map(|msg| msg.trim_end_matches('\0'))
            .filter(|msg| !msg.is_empty())
            .unwrap_or("Not supported by agent");
        return Err(CheckError::not_supported(message));
    }

    if text.starts_with(ERROR) {
        return Err(CheckError::agent("Agent non-critical error"));
    }

    typed_value(text.trim_end_matches(['\0', '\r', '\n', ' ']), value_type)
}

fn typed_value(text: &str, value_type: ValueType) -> Result<CheckValue, CheckError> {
    let unsuitable = || {
        CheckError::not_supported(format!("Value of type \"{value_type}\" is not suitable for value \"{text}\""))
    };

    match value_type {
        ValueType::Unsigned => text.trim().parse().map(CheckValue::Unsigned).map_err(|_| unsuitable()),
        ValueType::Float => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(CheckValue::Float)
            .ok_or_else(unsuitable),
        ValueType::Str | ValueType::Log | ValueType::Text => Ok(CheckValue::Text(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::from(&PROTOCOL_SIGNATURE[..]);
        buf.push(FLAG_PROTOCOL);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn request_has_header_and_key() {
        let request = encode_request("agent.ping");
        assert_eq!(&request[..4], b"ZBXD");
        assert_eq!(request[4], FLAG_PROTOCOL);
        assert_eq!(u32::from_le_bytes(request[5..9].try_into().unwrap()), 10);
        assert_eq!(&request[13..], b"agent.ping");
    }

    #[test]
    fn parses_partial_and_complete_frames() {
        let full = frame(b"1");
        assert_eq!(parse_frame(&full[..3]).unwrap(), Frame::Incomplete);
        assert_eq!(parse_frame(&full[..10]).unwrap(), Frame::Incomplete);
        assert_eq!(parse_frame(&full[..13]).unwrap(), Frame::Incomplete);
        assert_eq!(parse_frame(&full).unwrap(), Frame::Complete(b"1"));
        assert_eq!(parse_frame(b"1\n").unwrap(), Frame::Unframed);
    }

    #[test]
    fn rejects_compressed_and_oversized_frames() {
        let mut compressed = frame(b"x");
        compressed[4] |= FLAG_COMPRESSED;
        assert_eq!(parse_frame(&compressed).unwrap_err().code, ResultCode::NetworkError);

        let mut huge = frame(b"");
        huge[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(parse_frame(&huge).unwrap_err().code, ResultCode::NetworkError);
    }

    #[test]
    fn decodes_typed_values() {
        assert_eq!(decode_response(b"1", ValueType::Unsigned, "a").unwrap(), CheckValue::Unsigned(1));
        assert_eq!(decode_response(b"0.25\n", ValueType::Float, "a").unwrap(), CheckValue::Float(0.25));
        assert_eq!(
            decode_response(b"Linux web01", ValueType::Str, "a").unwrap(),
            CheckValue::Text("Linux web01".into())
        );

        let err = decode_response(b"abc", ValueType::Unsigned, "a").unwrap_err();
        assert_eq!(err.code, ResultCode::NotSupported);
        assert!(err.message.contains("abc"));
    }

    #[test]
    fn decodes_agent_errors() {
        let err = decode_response(b"ZBX_NOTSUPPORTED\0Unsupported item key.", ValueType::Text, "a").unwrap_err();
        assert_eq!(err.code, ResultCode::NotSupported);
        assert_eq!(err.message, "Unsupported item key.");

        let err = decode_response(b"ZBX_NOTSUPPORTED", ValueType::Text, "a").unwrap_err();
        assert_eq!(err.message, "Not supported by agent");

        let err = decode_response(b"ZBX_ERROR", ValueType::Text, "a").unwrap_err();
        assert_eq!(err.code, ResultCode::AgentError);

        let err = decode_response(b"", ValueType::Text, "192.0.2.1").unwrap_err();
        assert_eq!(err.code, ResultCode::NetworkError);
        assert!(err.message.contains("[192.0.2.1]"));
    }
}
