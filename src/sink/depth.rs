//! Depth payload encoders.
//!
//! Both families emit the depth plane followed by the active-brightness plane,
//! two bytes per sample, `2 * samples * 2` bytes in total. They differ in
//! validation and byte order:
//!
//! - AHAT zeroes any sample at or above the saturation sentinel, in both
//!   planes, and writes the high byte first.
//! - Long throw zeroes depth samples whose sigma byte carries the invalid
//!   flag, copies active brightness through unfiltered, and writes the low
//!   byte first.
//!
//! Receivers in the field depend on this asymmetry, so it is kept as is even
//! though it looks accidental.

use super::{check_plane, EncodeError, EncodedPayload, PayloadEncoder};
use crate::frame::{
    DepthBuffer, FramePayload, RawFrame, AHAT_HEIGHT, AHAT_WIDTH, LONG_THROW_HEIGHT,
    LONG_THROW_WIDTH,
};
use crate::wire::HeaderKind;

/// AHAT samples at or above this value are saturated.
pub const AHAT_INVALID_THRESHOLD: u16 = 4090;

/// Sigma bit marking an invalid long-throw depth sample.
pub const SIGMA_INVALID_MASK: u8 = 0x80;

fn depth_planes<'a>(
    frame: &'a RawFrame,
    max_width: u32,
    max_height: u32,
) -> Result<&'a DepthBuffer, EncodeError> {
    let FramePayload::Depth(buf) = &frame.payload else {
        return Err(EncodeError::WrongPayload {
            expected: "depth",
            actual: frame.payload.kind(),
        });
    };
    let res = frame.resolution;
    if res.width > max_width || res.height > max_height {
        return Err(EncodeError::CanvasOverflow {
            width: res.width,
            height: res.height,
            max_width,
            max_height,
        });
    }
    check_plane("depth", res.pixel_count(), buf.depth.len())?;
    check_plane("active brightness", res.pixel_count(), buf.active_brightness.len())?;
    Ok(buf)
}

fn layout(frame: &RawFrame, bytes: Vec<u8>) -> EncodedPayload {
    let res = frame.resolution;
    EncodedPayload {
        width: res.width,
        height: res.height,
        bytes_per_pixel: res.bytes_per_pixel,
        row_stride: res.row_stride(),
        focal_length: None,
        bytes,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AhatEncoder;

impl AhatEncoder {
    fn filter(sample: u16) -> u16 {
        if sample >= AHAT_INVALID_THRESHOLD {
            0
        } else {
            sample
        }
    }
}

impl PayloadEncoder for AhatEncoder {
    fn header_kind(&self) -> HeaderKind {
        HeaderKind::ResearchMode
    }

    fn encode(&self, frame: &RawFrame) -> Result<EncodedPayload, EncodeError> {
        let buf = depth_planes(frame, AHAT_WIDTH, AHAT_HEIGHT)?;
        let mut bytes = Vec::with_capacity(2 * buf.depth.len() * 2);
        for sample in buf.depth.iter().chain(buf.active_brightness.iter()) {
            bytes.extend_from_slice(&Self::filter(*sample).to_be_bytes());
        }
        Ok(layout(frame, bytes))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LongThrowEncoder;

impl PayloadEncoder for LongThrowEncoder {
    fn header_kind(&self) -> HeaderKind {
        HeaderKind::ResearchMode
    }

    fn encode(&self, frame: &RawFrame) -> Result<EncodedPayload, EncodeError> {
        let buf = depth_planes(frame, LONG_THROW_WIDTH, LONG_THROW_HEIGHT)?;
        let sigma = buf.sigma.as_ref().ok_or(EncodeError::MissingSigma)?;
        check_plane("sigma", buf.depth.len(), sigma.len())?;

        let mut bytes = Vec::with_capacity(2 * buf.depth.len() * 2);
        for (sample, flags) in buf.depth.iter().zip(sigma) {
            let value = if flags & SIGMA_INVALID_MASK != 0 {
                0
            } else {
                *sample
            };
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for sample in &buf.active_brightness {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(layout(frame, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;

    fn depth_frame(width: u32, depth: Vec<u16>, ab: Vec<u16>, sigma: Option<Vec<u8>>) -> RawFrame {
        let height = depth.len() as u32 / width;
        RawFrame::new(
            7,
            Resolution::new(width, height, 2),
            FramePayload::Depth(DepthBuffer {
                depth,
                active_brightness: ab,
                sigma,
            }),
        )
    }

    #[test]
    fn ahat_zeroes_saturated_samples_in_both_planes() {
        let frame = depth_frame(2, vec![4090, 4089], vec![65535, 12], None);
        let out = AhatEncoder.encode(&frame).unwrap();
        assert_eq!(out.bytes.len(), 2 * 2 * 2);
        assert_eq!(&out.bytes[0..2], &[0x00, 0x00]);
        assert_eq!(&out.bytes[2..4], &4089u16.to_be_bytes());
        assert_eq!(&out.bytes[4..6], &[0x00, 0x00]);
        assert_eq!(&out.bytes[6..8], &[0x00, 12]);
    }

    #[test]
    fn ahat_header_geometry_follows_frame() {
        let frame = depth_frame(4, vec![1; 8], vec![1; 8], None);
        let out = AhatEncoder.encode(&frame).unwrap();
        assert_eq!((out.width, out.height), (4, 2));
        assert_eq!(out.bytes_per_pixel, 2);
        assert_eq!(out.row_stride, 8);
        assert!(out.focal_length.is_none());
    }

    #[test]
    fn long_throw_sigma_flag_wins_over_depth_value() {
        let frame = depth_frame(
            4,
            vec![1000, 1000, 0x1234, 300],
            vec![0x0102, 5000, 7, 8],
            Some(vec![0x80, 0xFF, 0x7F, 0x00]),
        );
        let out = LongThrowEncoder.encode(&frame).unwrap();
        assert_eq!(&out.bytes[0..2], &[0x00, 0x00]);
        assert_eq!(&out.bytes[2..4], &[0x00, 0x00]);
        // Other sigma bits leave the sample alone; low byte first.
        assert_eq!(&out.bytes[4..6], &[0x34, 0x12]);
        assert_eq!(&out.bytes[6..8], &300u16.to_le_bytes());
        // Active brightness is copied through, even above the AHAT threshold.
        assert_eq!(&out.bytes[8..10], &[0x02, 0x01]);
        assert_eq!(&out.bytes[10..12], &5000u16.to_le_bytes());
    }

    #[test]
    fn long_throw_requires_sigma() {
        let frame = depth_frame(1, vec![1], vec![1], None);
        assert!(matches!(
            LongThrowEncoder.encode(&frame),
            Err(EncodeError::MissingSigma)
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = RawFrame::new(
            1,
            Resolution::new(LONG_THROW_WIDTH + 1, 1, 2),
            FramePayload::Depth(DepthBuffer {
                depth: vec![0; 321],
                active_brightness: vec![0; 321],
                sigma: Some(vec![0; 321]),
            }),
        );
        assert!(matches!(
            LongThrowEncoder.encode(&frame),
            Err(EncodeError::CanvasOverflow { .. })
        ));
    }

    #[test]
    fn short_plane_is_rejected() {
        let frame = RawFrame::new(
            1,
            Resolution::new(2, 1, 2),
            FramePayload::Depth(DepthBuffer {
                depth: vec![0; 2],
                active_brightness: vec![0; 1],
                sigma: None,
            }),
        );
        assert!(matches!(
            AhatEncoder.encode(&frame),
            Err(EncodeError::PlaneSize {
                plane: "active brightness",
                ..
            })
        ));
    }
}
