//! Color video encoder: BGRA8 to packed BGR, plus focal lengths.

use super::{check_plane, EncodeError, EncodedPayload, PayloadEncoder};
use crate::frame::{FramePayload, RawFrame};
use crate::wire::HeaderKind;

/// Largest capture profile the color camera offers.
pub const MAX_VIDEO_WIDTH: u32 = 1952;
pub const MAX_VIDEO_HEIGHT: u32 = 1100;

const BGR_BYTES_PER_PIXEL: u32 = 3;

#[derive(Clone, Copy, Debug, Default)]
pub struct ColorVideoEncoder;

impl PayloadEncoder for ColorVideoEncoder {
    fn header_kind(&self) -> HeaderKind {
        HeaderKind::ColorVideo
    }

    fn encode(&self, frame: &RawFrame) -> Result<EncodedPayload, EncodeError> {
        let FramePayload::Color(buf) = &frame.payload else {
            return Err(EncodeError::WrongPayload {
                expected: "color",
                actual: frame.payload.kind(),
            });
        };
        let res = frame.resolution;
        if res.width > MAX_VIDEO_WIDTH || res.height > MAX_VIDEO_HEIGHT {
            return Err(EncodeError::CanvasOverflow {
                width: res.width,
                height: res.height,
                max_width: MAX_VIDEO_WIDTH,
                max_height: MAX_VIDEO_HEIGHT,
            });
        }
        check_plane("bgra", res.pixel_count() * 4, buf.bgra.len())?;

        let mut bytes = Vec::with_capacity(res.pixel_count() * BGR_BYTES_PER_PIXEL as usize);
        for pixel in buf.bgra.chunks_exact(4) {
            bytes.extend_from_slice(&pixel[..3]);
        }
        Ok(EncodedPayload {
            width: res.width,
            height: res.height,
            bytes_per_pixel: BGR_BYTES_PER_PIXEL,
            row_stride: res.width * BGR_BYTES_PER_PIXEL,
            focal_length: Some(buf.focal_length),
            bytes,
        })
    }
}
