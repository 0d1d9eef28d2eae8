//! Frame sinks: per-family payload encoding onto the wire.
//!
//! A `FrameSink` is chosen once per sensor when its processor is built. Every
//! sink shares the same header framing (`crate::wire`) and differs only in how
//! the payload is produced and where the pose comes from:
//!
//! | family          | encoder             | pose                         |
//! |-----------------|---------------------|------------------------------|
//! | AHAT depth      | `AhatEncoder`       | rig locator                  |
//! | long-throw      | `LongThrowEncoder`  | rig locator                  |
//! | front VLC       | `VlcEncoder`        | rig locator                  |
//! | color video     | `ColorVideoEncoder` | frame's own `frame_to_world` |
//!
//! Sends never block: the writer accepts at most one outstanding message and
//! a send attempted while it is busy drops the frame.

mod depth;
mod video;
mod vlc;

pub use depth::{AhatEncoder, LongThrowEncoder, AHAT_INVALID_THRESHOLD, SIGMA_INVALID_MASK};
pub use video::{ColorVideoEncoder, MAX_VIDEO_HEIGHT, MAX_VIDEO_WIDTH};
pub use vlc::VlcEncoder;

use serde::Serialize;
use std::sync::Arc;

use crate::clock::TickConverter;
use crate::frame::{FocalLength, FramePayload, Pose4x4, RawFrame};
use crate::sensor::PoseLocator;
use crate::wire::{HeaderKind, WireHeader, WireMessage};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("expected a {expected} payload, got {actual}")]
    WrongPayload {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("depth frame has no sigma buffer")]
    MissingSigma,

    #[error("{plane} plane holds {actual} samples, frame needs {expected}")]
    PlaneSize {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("frame {width}x{height} exceeds the {max_width}x{max_height} canvas")]
    CanvasOverflow {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
}

/// Encoded payload plus the geometry written into its header.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPayload {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub row_stride: u32,
    pub focal_length: Option<FocalLength>,
    pub bytes: Vec<u8>,
}

pub trait PayloadEncoder: Send {
    fn header_kind(&self) -> HeaderKind;

    fn encode(&self, frame: &RawFrame) -> Result<EncodedPayload, EncodeError>;
}

/// Where a sink takes the frame's world pose from.
#[derive(Clone)]
pub enum PoseSource {
    /// Shared rig locator, queried at the frame timestamp.
    Rig(Arc<dyn PoseLocator>),
    /// The frame's own coordinate system (color video).
    FrameOwn,
}

impl PoseSource {
    pub fn resolve(&self, frame: &RawFrame) -> Option<Pose4x4> {
        match self {
            PoseSource::Rig(locator) => locator.locate(frame.timestamp_ticks),
            PoseSource::FrameOwn => match &frame.payload {
                FramePayload::Color(buf) => buf.frame_to_world,
                _ => None,
            },
        }
    }
}

/// Readiness of the outbound connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Busy,
    Idle,
}

/// Outbound byte writer owned by a frame server.
pub trait MessageWriter: Send {
    fn state(&self) -> LinkState;

    /// Hand one complete message to the writer. Never blocks on the network.
    fn try_write(&self, message: Vec<u8>) -> LinkState;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    NotConnected,
    Busy,
    PoseUnavailable,
    EncodeFailed,
}

pub trait FrameSink: Send {
    fn send(&mut self, frame: &RawFrame) -> SendOutcome;
}

/// Encodes frames with `E` and hands them to `W`.
pub struct WireSink<E, W> {
    label: String,
    encoder: E,
    poses: PoseSource,
    clock: TickConverter,
    writer: W,
}

impl<E: PayloadEncoder, W: MessageWriter> WireSink<E, W> {
    pub fn new(
        label: impl Into<String>,
        encoder: E,
        poses: PoseSource,
        clock: TickConverter,
        writer: W,
    ) -> Self {
        Self {
            label: label.into(),
            encoder,
            poses,
            clock,
            writer,
        }
    }

    fn build_message(&self, frame: &RawFrame, pose: Pose4x4) -> Result<Vec<u8>, EncodeError> {
        let payload = self.encoder.encode(frame)?;
        let header = WireHeader {
            absolute_timestamp: self.clock.to_absolute(frame.timestamp_ticks),
            width: payload.width as i32,
            height: payload.height as i32,
            bytes_per_pixel: payload.bytes_per_pixel as i32,
            row_stride: payload.row_stride as i32,
            payload_byte_length: payload.bytes.len() as i32,
            focal_length: match self.encoder.header_kind() {
                HeaderKind::ColorVideo => Some(
                    payload
                        .focal_length
                        .unwrap_or(FocalLength { fx: 0.0, fy: 0.0 }),
                ),
                HeaderKind::ResearchMode => None,
            },
            pose,
        };
        Ok(WireMessage {
            header,
            payload: payload.bytes,
        }
        .to_bytes())
    }
}

impl<E: PayloadEncoder, W: MessageWriter> FrameSink for WireSink<E, W> {
    fn send(&mut self, frame: &RawFrame) -> SendOutcome {
        match self.writer.state() {
            LinkState::Disconnected => return SendOutcome::NotConnected,
            LinkState::Busy => {
                log::trace!("{}: write already in progress", self.label);
                return SendOutcome::Busy;
            }
            LinkState::Idle => {}
        }

        let Some(pose) = self.poses.resolve(frame) else {
            log::trace!(
                "{}: no pose at {}, dropping frame",
                self.label,
                frame.timestamp_ticks
            );
            return SendOutcome::PoseUnavailable;
        };

        let message = match self.build_message(frame, pose) {
            Ok(message) => message,
            Err(err) => {
                log::error!("{}: cannot encode frame: {}", self.label, err);
                return SendOutcome::EncodeFailed;
            }
        };

        match self.writer.try_write(message) {
            LinkState::Idle => SendOutcome::Sent,
            LinkState::Busy => SendOutcome::Busy,
            LinkState::Disconnected => SendOutcome::NotConnected,
        }
    }
}

fn check_plane(plane: &'static str, expected: usize, actual: usize) -> Result<(), EncodeError> {
    if expected != actual {
        return Err(EncodeError::PlaneSize {
            plane,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records written messages; state is scripted by the test.
    pub struct RecordingWriter {
        pub state: Mutex<LinkState>,
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingWriter {
        pub fn new(state: LinkState) -> Self {
            Self {
                state: Mutex::new(state),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl MessageWriter for RecordingWriter {
        fn state(&self) -> LinkState {
            *self.state.lock().unwrap()
        }

        fn try_write(&self, message: Vec<u8>) -> LinkState {
            let state = self.state();
            if state == LinkState::Idle {
                self.written.lock().unwrap().push(message);
            }
            state
        }
    }

    pub struct FixedLocator(pub Option<Pose4x4>);

    impl PoseLocator for FixedLocator {
        fn locate(&self, _timestamp_ticks: u64) -> Option<Pose4x4> {
            self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FixedLocator, RecordingWriter};
    use super::*;
    use crate::frame::Resolution;
    use crate::wire::read_message;

    fn vlc_frame(ts: u64) -> RawFrame {
        RawFrame::new(
            ts,
            Resolution::new(4, 3, 1),
            FramePayload::Vlc((0..12).collect()),
        )
    }

    fn sink(
        state: LinkState,
        pose: Option<Pose4x4>,
    ) -> (
        WireSink<VlcEncoder, RecordingWriter>,
        Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    ) {
        let writer = RecordingWriter::new(state);
        let written = writer.written.clone();
        let sink = WireSink::new(
            "test",
            VlcEncoder,
            PoseSource::Rig(Arc::new(FixedLocator(pose))),
            TickConverter::with_offset(1_000),
            writer,
        );
        (sink, written)
    }

    #[test]
    fn send_without_client_is_noop() {
        let (mut sink, written) = sink(LinkState::Disconnected, Some(Pose4x4::identity()));
        assert_eq!(sink.send(&vlc_frame(1)), SendOutcome::NotConnected);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn busy_writer_drops_frame() {
        let (mut sink, written) = sink(LinkState::Busy, Some(Pose4x4::identity()));
        assert_eq!(sink.send(&vlc_frame(1)), SendOutcome::Busy);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn unresolvable_pose_drops_frame() {
        let (mut sink, written) = sink(LinkState::Idle, None);
        assert_eq!(sink.send(&vlc_frame(1)), SendOutcome::PoseUnavailable);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn sent_message_decodes_to_original_frame() {
        let mut pose = Pose4x4::identity();
        pose.0[3] = [0.5, 1.5, -2.5, 1.0];
        let (mut sink, written) = sink(LinkState::Idle, Some(pose));
        assert_eq!(sink.send(&vlc_frame(42)), SendOutcome::Sent);

        let written = written.lock().unwrap();
        let decoded = read_message(&mut written[0].as_slice(), HeaderKind::ResearchMode).unwrap();
        assert_eq!(decoded.header.absolute_timestamp, 1_042);
        assert_eq!((decoded.header.width, decoded.header.height), (4, 3));
        assert_eq!(decoded.header.row_stride, 4);
        assert_eq!(decoded.header.pose, pose);
        assert_eq!(decoded.payload, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn wrong_payload_family_fails_encoding() {
        let (mut sink, written) = sink(LinkState::Idle, Some(Pose4x4::identity()));
        let frame = RawFrame::new(
            1,
            Resolution::new(1, 1, 2),
            FramePayload::Depth(crate::frame::DepthBuffer {
                depth: vec![1],
                active_brightness: vec![1],
                sigma: None,
            }),
        );
        assert_eq!(sink.send(&frame), SendOutcome::EncodeFailed);
        assert!(written.lock().unwrap().is_empty());
    }
}
