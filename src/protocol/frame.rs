//! Fixed-size wire frame codec.
//!
//! Every frame is exactly [`FRAME_SIZE`] bytes:
//!
//! ```text
//! EEE_SSS_FFF_LLLLL_<TID: 255 bytes, space padded><chunk payload><NUL fill>
//! ```
//!
//! - `EEE`: error number, 3 decimal digits (`999` = connection severed)
//! - `SSS`: service code, 3 decimal digits
//! - `FFF`: payload format code, 3 decimal digits
//! - `LLLLL`: length of TID + chunk payload, 5 decimal digits
//!
//! Encoding and decoding are pure; no I/O happens here.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 1024;

/// Width of the `EEE_SSS_FFF_LLLLL_` header.
pub const HEADER_LEN: usize = 18;

/// Width of the space-padded transaction id field.
pub const TID_LEN: usize = 255;

/// Largest chunk payload a single frame carries.
pub const MAX_CHUNK_LEN: usize = FRAME_SIZE - HEADER_LEN - TID_LEN;

/// Error number reserved for "connection severed".
pub const SEVERED_ERR_NO: u16 = 999;

const MAX_ERR_NO: usize = 999;
const SEVERED_PAYLOAD: &str = "Connection no longer valid.";

/// Requested operation carried in the service field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Unrecognised,
    Ready,
    Close,
    Shutdown,
    More,
    Discard,
    Consume,
    ConsumeRespond,
    /// Defined for wire compatibility; never dispatched.
    Refuse,
}

impl Service {
    /// Wire number for this service.
    pub fn as_number(self) -> u16 {
        match self {
            Service::Unrecognised => 0,
            Service::Ready => 1,
            Service::Close => 2,
            Service::Shutdown => 3,
            Service::More => 4,
            Service::Discard => 5,
            Service::Consume => 6,
            Service::ConsumeRespond => 7,
            Service::Refuse => 8,
        }
    }

    /// Map a wire number to a service; unknown numbers are `Unrecognised`.
    pub fn from_number(value: u16) -> Self {
        match value {
            1 => Service::Ready,
            2 => Service::Close,
            3 => Service::Shutdown,
            4 => Service::More,
            5 => Service::Discard,
            6 => Service::Consume,
            7 => Service::ConsumeRespond,
            8 => Service::Refuse,
            _ => Service::Unrecognised,
        }
    }
}

/// Payload format carried in the format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unrecognised,
    Xml,
}

impl Format {
    /// Wire number for this format.
    pub fn as_number(self) -> u16 {
        match self {
            Format::Unrecognised => 0,
            Format::Xml => 1,
        }
    }

    /// Map a wire number to a format; unknown numbers are `Unrecognised`.
    pub fn from_number(value: u16) -> Self {
        match value {
            1 => Format::Xml,
            _ => Format::Unrecognised,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub err_no: u16,
    pub service: Service,
    pub format: Format,
    /// Declared length of the TID + chunk region.
    pub data_length: usize,
    /// Trimmed transaction id; empty means no transaction context.
    pub tid: String,
    /// Trimmed chunk payload.
    pub payload: String,
}

impl Frame {
    /// The sentinel reported when the peer has gone away.
    pub fn severed() -> Self {
        Frame {
            err_no: SEVERED_ERR_NO,
            service: Service::Unrecognised,
            format: Format::Unrecognised,
            data_length: SEVERED_PAYLOAD.len(),
            tid: String::new(),
            payload: SEVERED_PAYLOAD.to_string(),
        }
    }

    /// Whether this frame signals a severed connection.
    pub fn is_severed(&self) -> bool {
        self.err_no == SEVERED_ERR_NO
    }
}

/// Encode one chunk into a full frame.
///
/// The TID is cut to [`TID_LEN`] bytes and space padded. An empty chunk is
/// sent as a single space so the payload region is never empty.
pub fn encode(
    err_no: u16,
    tid: &str,
    service: Service,
    format: Format,
    chunk: &str,
) -> Result<Bytes> {
    if err_no as usize > MAX_ERR_NO {
        return Err(ProtocolError::OutOfRange {
            field: "errNo",
            value: err_no as usize,
            max: MAX_ERR_NO,
        });
    }
    if chunk.len() > MAX_CHUNK_LEN {
        return Err(ProtocolError::OutOfRange {
            field: "chunk payload",
            value: chunk.len(),
            max: MAX_CHUNK_LEN,
        });
    }

    let tid = floor_boundary(tid, TID_LEN);
    let chunk = if chunk.is_empty() { " " } else { chunk };
    let data_length = TID_LEN + chunk.len();

    let header = format!(
        "{:03}_{:03}_{:03}_{:05}_",
        err_no,
        service.as_number(),
        format.as_number(),
        data_length
    );

    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_slice(header.as_bytes());
    buf.put_slice(tid.as_bytes());
    buf.put_bytes(b' ', TID_LEN - tid.len());
    buf.put_slice(chunk.as_bytes());
    buf.resize(FRAME_SIZE, 0);

    debug_assert_eq!(buf.len(), FRAME_SIZE);
    Ok(buf.freeze())
}

/// Decode a full frame.
///
/// A leading `999` short-circuits to [`Frame::severed`] without looking at
/// the rest of the bytes.
pub fn decode(raw: &[u8; FRAME_SIZE]) -> Result<Frame> {
    if raw[0..3] == *b"999" {
        return Ok(Frame::severed());
    }

    let err_no = parse_field(&raw[0..3], "errNo")? as u16;
    let service = Service::from_number(parse_field(&raw[4..7], "service")? as u16);
    let format = Format::from_number(parse_field(&raw[8..11], "format")? as u16);
    let data_length = parse_field(&raw[12..17], "dataLength")?;

    if data_length < TID_LEN || HEADER_LEN + data_length > FRAME_SIZE {
        return Err(ProtocolError::InvalidDataLength(data_length));
    }

    let tid_end = HEADER_LEN + TID_LEN;
    let tid = std::str::from_utf8(&raw[HEADER_LEN..tid_end])
        .map_err(|_| ProtocolError::InvalidUtf8("transaction id"))?;
    let payload = std::str::from_utf8(&raw[tid_end..HEADER_LEN + data_length])
        .map_err(|_| ProtocolError::InvalidUtf8("payload"))?;

    Ok(Frame {
        err_no,
        service,
        format,
        data_length,
        tid: trim_text(tid).to_string(),
        payload: trim_text(payload).to_string(),
    })
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary.
pub(crate) fn floor_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Strip whitespace and control bytes (NUL fill included) from both ends.
fn trim_text(s: &str) -> &str {
    s.trim_matches(|c: char| c <= ' ')
}

fn parse_field(bytes: &[u8], field: &'static str) -> Result<usize> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::MalformedField {
            field,
            found: String::from_utf8_lossy(bytes).into_owned(),
        });
    }
    Ok(bytes
        .iter()
        .fold(0usize, |acc, b| acc * 10 + (b - b'0') as usize))
}
