//! apcupsd NIS wire codec
//!
//! Every message is a sequence of records, each a 2-byte big-endian length
//! followed by that many bytes of text payload. A zero length terminates
//! a multi-record response. Status records carry `KEY      : VALUE`.
//! Payload bytes that are not valid UTF-8 decode to U+FFFD.
//!
//! The codec performs no I/O.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Length and shape checks on every record

use crate::error::{Result, UpssyncError};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Command requesting the full status record set
pub const STATUS_COMMAND: &str = "status";

/// Lightweight liveness command. apcupsd answers unknown commands with one
/// text record plus the terminator, which is all a probe needs.
pub const PING_COMMAND: &str = "ping";

/// Encode a command as a single length-prefixed record
pub fn encode_request(command: &str) -> Result<Vec<u8>> {
    let len = u16::try_from(command.len()).map_err(|_| {
        UpssyncError::MalformedFrame(format!(
            "command of {} bytes exceeds the 65535 byte record limit",
            command.len()
        ))
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + command.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(command.as_bytes());
    Ok(buf)
}

/// Encode the zero-length terminator record
pub fn encode_terminator() -> [u8; LENGTH_PREFIX_LEN] {
    0u16.to_be_bytes()
}

/// Decode raw record payloads up to the terminator (or end of buffer)
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<String>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < LENGTH_PREFIX_LEN {
            return Err(UpssyncError::MalformedFrame(format!(
                "truncated length prefix at offset {}",
                offset
            )));
        }

        let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += LENGTH_PREFIX_LEN;

        if len == 0 {
            break;
        }

        if len > bytes.len() - offset {
            return Err(UpssyncError::MalformedFrame(format!(
                "declared length {} exceeds remaining {} bytes",
                len,
                bytes.len() - offset
            )));
        }

        let payload = &bytes[offset..offset + len];
        offset += len;

        frames.push(String::from_utf8_lossy(payload).into_owned());
    }

    Ok(frames)
}

/// Split one status payload into a canonical (KEY, value) pair
pub fn parse_status_line(payload: &str) -> Result<(String, String)> {
    let (key, value) = payload.split_once(':').ok_or_else(|| {
        UpssyncError::MalformedFrame(format!("status record without colon: {:?}", payload.trim()))
    })?;

    Ok((key.trim().to_ascii_uppercase(), value.trim().to_string()))
}

/// Decode a status response into ordered key/value records
pub fn decode_records(bytes: &[u8]) -> Result<Vec<(String, String)>> {
    decode_frames(bytes)?
        .iter()
        .map(|frame| parse_status_line(frame))
        .collect()
}
