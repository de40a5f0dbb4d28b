//! Codec for encoding and decoding murmur events.
//!
//! Events are JSON objects tagged by `kind`. Over Server-Sent Events each
//! event becomes one record:
//!
//! ```text
//! event: new_message
//! data: {"kind":"new_message","room_id":"3_7","message":{...}}
//!
//! ```
//!
//! Records are separated by a blank line. Lines starting with `:` are
//! comments (keep-alives) and are skipped by the decoder.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

use crate::event::{ChatEvent, EventKind};

/// Maximum encoded event size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// SSE record terminator written by the encoder.
const RECORD_SEPARATOR: &[u8] = b"\n\n";

/// Record terminator of CRLF streams.
const CRLF_RECORD_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed event with a kind this build does not know.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

#[derive(Deserialize)]
struct KindTag {
    kind: String,
}

/// Encode an event as a JSON string.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_text(event: &ChatEvent) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Encode an event as JSON bytes.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode(event: &ChatEvent) -> Result<Bytes, ProtocolError> {
    encode_text(event).map(Bytes::from)
}

/// Decode an event from JSON bytes.
///
/// A record whose `kind` is not one this build understands yields
/// [`ProtocolError::UnknownKind`] so older consumers can skip it.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, or not an event.
pub fn decode(data: &[u8]) -> Result<ChatEvent, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    match serde_json::from_slice::<ChatEvent>(data) {
        Ok(event) => Ok(event),
        Err(err) => match serde_json::from_slice::<KindTag>(data) {
            Ok(tag) if tag.kind.parse::<EventKind>().is_err() => {
                Err(ProtocolError::UnknownKind(tag.kind))
            }
            _ => Err(ProtocolError::Json(err)),
        },
    }
}

/// Encode an event as a complete SSE record.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_sse(event: &ChatEvent) -> Result<Bytes, ProtocolError> {
    let data = encode_text(event)?;
    let kind = event.kind().as_str();

    let mut buf = BytesMut::with_capacity(kind.len() + data.len() + 16);
    buf.put_slice(b"event: ");
    buf.put_slice(kind.as_bytes());
    buf.put_slice(b"\ndata: ");
    buf.put_slice(data.as_bytes());
    buf.put_slice(RECORD_SEPARATOR);

    Ok(buf.freeze())
}

/// Try to decode the next event from a buffer of SSE bytes, advancing it.
///
/// Returns `Ok(Some(event))` if a complete record was decoded, `Ok(None)`
/// if more data is needed. Records may end in LF or CRLF line breaks.
/// Comment-only records and records of unknown kinds are consumed and
/// skipped.
///
/// # Errors
///
/// Returns an error if a record is oversized or malformed.
pub fn decode_sse_from(buf: &mut BytesMut) -> Result<Option<ChatEvent>, ProtocolError> {
    loop {
        let Some((end, separator_len)) = find_separator(buf) else {
            if buf.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(buf.len()));
            }
            return Ok(None);
        };

        let raw = buf.split_to(end + separator_len);
        let record = std::str::from_utf8(&raw[..end])
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;

        let mut name: Option<&str> = None;
        let mut data = String::new();

        for line in record.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => name = Some(value),
                "data" => {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value);
                }
                _ => {}
            }
        }

        if data.is_empty() {
            continue;
        }

        let event = match decode(data.as_bytes()) {
            Ok(event) => event,
            Err(ProtocolError::UnknownKind(_)) => continue,
            Err(e) => return Err(e),
        };

        if let Some(name) = name {
            if name != event.kind().as_str() {
                return Err(ProtocolError::Invalid(format!(
                    "event name {name} does not match kind {}",
                    event.kind()
                )));
            }
        }

        return Ok(Some(event));
    }
}

/// Position and length of the first record terminator, LF or CRLF.
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let find = |separator: &[u8]| {
        buf.windows(separator.len())
            .position(|window| window == separator)
            .map(|pos| (pos, separator.len()))
    };

    match (find(RECORD_SEPARATOR), find(CRLF_RECORD_SEPARATOR)) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}
