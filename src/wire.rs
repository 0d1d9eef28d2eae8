//! Frame wire format.
//!
//! Every accepted frame is written to the sensor's TCP connection as a fixed
//! header followed by the payload. There is no length prefix beyond the
//! header fields; the receiver sizes its payload read from
//! `payload_byte_length`.
//!
//! ```text
//! u64  absolute_timestamp
//! i32  width
//! i32  height
//! i32  bytes_per_pixel
//! i32  row_stride
//! i32  payload_byte_length
//! [color video only: f32 fx, f32 fy]
//! 16 x f32 pose (row-major, m11..m44)
//! payload_byte_length bytes
//! ```
//!
//! All integers and floats are little-endian.
//!
//! Control direction: one UDP datagram per requested frame, payload exactly
//! `b"1\n"`.

use std::io::Read;

use crate::frame::{FocalLength, Pose4x4};

/// The only datagram payload that requests a frame.
pub const REQUEST_TOKEN: &[u8] = b"1\n";

/// Header bytes for depth and VLC sinks.
pub const RESEARCH_MODE_HEADER_LEN: usize = 8 + 5 * 4 + 16 * 4;

/// Header bytes for the color video sink (adds fx, fy).
pub const VIDEO_HEADER_LEN: usize = RESEARCH_MODE_HEADER_LEN + 2 * 4;

/// Upper bound accepted by the decoder for a single payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("header truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("negative header field {field}: {value}")]
    NegativeField { field: &'static str, value: i32 },

    #[error("payload length {0} exceeds limit")]
    PayloadTooLarge(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which header shape a sensor uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderKind {
    ResearchMode,
    ColorVideo,
}

impl HeaderKind {
    pub fn header_len(self) -> usize {
        match self {
            HeaderKind::ResearchMode => RESEARCH_MODE_HEADER_LEN,
            HeaderKind::ColorVideo => VIDEO_HEADER_LEN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WireHeader {
    pub absolute_timestamp: u64,
    pub width: i32,
    pub height: i32,
    pub bytes_per_pixel: i32,
    pub row_stride: i32,
    pub payload_byte_length: i32,
    /// Present exactly for color video.
    pub focal_length: Option<FocalLength>,
    pub pose: Pose4x4,
}

impl WireHeader {
    pub fn kind(&self) -> HeaderKind {
        if self.focal_length.is_some() {
            HeaderKind::ColorVideo
        } else {
            HeaderKind::ResearchMode
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.kind().header_len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.absolute_timestamp.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.bytes_per_pixel.to_le_bytes());
        out.extend_from_slice(&self.row_stride.to_le_bytes());
        out.extend_from_slice(&self.payload_byte_length.to_le_bytes());
        if let Some(focal) = self.focal_length {
            out.extend_from_slice(&focal.fx.to_le_bytes());
            out.extend_from_slice(&focal.fy.to_le_bytes());
        }
        for value in self.pose.to_row_major() {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn decode(bytes: &[u8], kind: HeaderKind) -> Result<Self, WireError> {
        let expected = kind.header_len();
        if bytes.len() < expected {
            return Err(WireError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        let mut cursor = Cursor { bytes, offset: 0 };
        let absolute_timestamp = u64::from_le_bytes(cursor.take());
        let width = non_negative("width", i32::from_le_bytes(cursor.take()))?;
        let height = non_negative("height", i32::from_le_bytes(cursor.take()))?;
        let bytes_per_pixel =
            non_negative("bytes_per_pixel", i32::from_le_bytes(cursor.take()))?;
        let row_stride = non_negative("row_stride", i32::from_le_bytes(cursor.take()))?;
        let payload_byte_length =
            non_negative("payload_byte_length", i32::from_le_bytes(cursor.take()))?;
        let focal_length = match kind {
            HeaderKind::ColorVideo => Some(FocalLength {
                fx: f32::from_le_bytes(cursor.take()),
                fy: f32::from_le_bytes(cursor.take()),
            }),
            HeaderKind::ResearchMode => None,
        };
        let mut pose = [0.0f32; 16];
        for value in pose.iter_mut() {
            *value = f32::from_le_bytes(cursor.take());
        }
        Ok(Self {
            absolute_timestamp,
            width,
            height,
            bytes_per_pixel,
            row_stride,
            payload_byte_length,
            focal_length,
            pose: Pose4x4::from_row_major(pose),
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    // Length is checked up front against the header size.
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        out
    }
}

fn non_negative(field: &'static str, value: i32) -> Result<i32, WireError> {
    if value < 0 {
        return Err(WireError::NegativeField { field, value });
    }
    Ok(value)
}

/// One framed message: header plus payload bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub header: WireHeader,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.encoded_len() + self.payload.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Read exactly one message of the given header shape.
pub fn read_message<R: Read>(reader: &mut R, kind: HeaderKind) -> Result<WireMessage, WireError> {
    let mut header_bytes = vec![0u8; kind.header_len()];
    reader.read_exact(&mut header_bytes)?;
    let header = WireHeader::decode(&header_bytes, kind)?;
    let len = header.payload_byte_length as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(WireMessage { header, payload })
}
