//! Netstring framing: `<decimal-length>:<payload>,`.
//!
//! At most 5 decimal digits are accepted for the length, matching the
//! `sscanf("%5zu%n", ...)` limit in the upstream implementation - a frame
//! cannot declare a payload longer than 99999 bytes.

use thiserror::Error;

const MAX_DIGITS: usize = 5;
const MAX_LENGTH: usize = 99_999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetstringError {
    #[error("expected a decimal length prefix")]
    MissingLength,
    #[error("length prefix exceeds 5 digits")]
    LengthTooLong,
    #[error("missing ':' after length prefix")]
    MissingColon,
    #[error("missing trailing ','")]
    MissingComma,
    #[error("not enough bytes buffered yet")]
    Incomplete,
}

/// Encodes `data` as a single netstring frame.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + MAX_DIGITS + 2);
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(data);
    out.push(b',');
    out
}

/// Decodes one netstring frame from the front of `buf`.
///
/// On success returns the payload slice and the total number of bytes of
/// `buf` the frame occupied (including the length prefix, the colon and the
/// trailing comma), so the caller can advance past exactly that many bytes
/// and keep the remainder for the next frame.
pub fn decode(buf: &[u8]) -> Result<(&[u8], usize), NetstringError> {
    let mut digits_end = 0;
    while digits_end < buf.len() && buf[digits_end].is_ascii_digit() {
        digits_end += 1;
        if digits_end > MAX_DIGITS {
            return Err(NetstringError::LengthTooLong);
        }
    }
    if digits_end == 0 {
        return if buf.is_empty() {
            Err(NetstringError::Incomplete)
        } else {
            Err(NetstringError::MissingLength)
        };
    }
    if digits_end == buf.len() {
        return Err(NetstringError::Incomplete);
    }
    // SAFETY of the parse: every byte up to `digits_end` was checked ASCII digit above.
    let length: usize = std::str::from_utf8(&buf[..digits_end])
        .unwrap()
        .parse()
        .map_err(|_| NetstringError::LengthTooLong)?;
    if length > MAX_LENGTH {
        return Err(NetstringError::LengthTooLong);
    }
    if buf[digits_end] != b':' {
        return Err(NetstringError::MissingColon);
    }
    let payload_start = digits_end + 1;
    let payload_end = payload_start + length;
    if buf.len() <= payload_end {
        return Err(NetstringError::Incomplete);
    }
    if buf[payload_end] != b',' {
        return Err(NetstringError::MissingComma);
    }
    Ok((&buf[payload_start..payload_end], payload_end + 1))
}
