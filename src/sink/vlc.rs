use super::{check_plane, EncodeError, EncodedPayload, PayloadEncoder};
use crate::frame::{FramePayload, RawFrame, VLC_BYTES_PER_PIXEL, VLC_HEIGHT, VLC_WIDTH};
use crate::wire::HeaderKind;

/// Front grayscale cameras: raw copy of `width * height * bytes_per_pixel`
/// bytes, no filtering.
#[derive(Clone, Copy, Debug, Default)]
pub struct VlcEncoder;

impl PayloadEncoder for VlcEncoder {
    fn header_kind(&self) -> HeaderKind {
        HeaderKind::ResearchMode
    }

    fn encode(&self, frame: &RawFrame) -> Result<EncodedPayload, EncodeError> {
        let FramePayload::Vlc(pixels) = &frame.payload else {
            return Err(EncodeError::WrongPayload {
                expected: "vlc",
                actual: frame.payload.kind(),
            });
        };
        let res = frame.resolution;
        if res.width > VLC_WIDTH
            || res.height > VLC_HEIGHT
            || res.bytes_per_pixel > VLC_BYTES_PER_PIXEL
        {
            return Err(EncodeError::CanvasOverflow {
                width: res.width,
                height: res.height,
                max_width: VLC_WIDTH,
                max_height: VLC_HEIGHT,
            });
        }
        let size = res.pixel_count() * res.bytes_per_pixel as usize;
        check_plane("vlc", size, pixels.len())?;
        Ok(EncodedPayload {
            width: res.width,
            height: res.height,
            bytes_per_pixel: res.bytes_per_pixel,
            row_stride: res.row_stride(),
            focal_length: None,
            bytes: pixels.clone(),
        })
    }
}
