//! Sensor backends.
//!
//! A backend is the boundary to the platform: it enumerates sensors, opens
//! hardware streams, reports the color camera's capture profiles and locates
//! the sensor rig in world space. Everything past this boundary is
//! platform-independent.
//!
//! Backends are selected by URL scheme:
//! - `stub://` synthetic sensors (development and tests)

pub mod synthetic;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::frame::{Pose4x4, RawFrame, SensorDescriptor};

pub use synthetic::{SyntheticBackend, SyntheticConfig, SyntheticLocator};

/// Open hardware stream for one sensor.
pub trait SensorStream: Send {
    /// Poll for the next frame. `Ok(None)` means nothing new is available yet;
    /// `Err` is a transient read failure.
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Release the hardware stream.
    fn close(&mut self);
}

/// Resolves the rig pose at a sensor timestamp.
pub trait PoseLocator: Send + Sync {
    fn locate(&self, timestamp_ticks: u64) -> Option<Pose4x4>;
}

pub trait SensorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn enumerate_sensors(&self) -> Vec<SensorDescriptor>;

    fn open_stream(&self, descriptor: &SensorDescriptor) -> Result<Box<dyn SensorStream>>;

    /// Capture profiles supported by the color camera.
    fn video_profiles(&self) -> Vec<VideoProfile>;

    /// Fix the color camera's profile before its stream is opened.
    fn apply_video_profile(&self, profile: &VideoProfile) -> Result<()>;

    fn rig_locator(&self) -> Arc<dyn PoseLocator>;
}

/// Build the backend named by `url`.
pub fn backend_from_url(url: &str, config: SyntheticConfig) -> Result<Arc<dyn SensorBackend>> {
    if url.starts_with("stub://") {
        return Ok(Arc::new(SyntheticBackend::new(url, config)));
    }
    Err(anyhow!(
        "unsupported sensor backend '{}'; expected stub://",
        url
    ))
}

// ----------------------------------------------------------------------------
// StreamGuard
// ----------------------------------------------------------------------------

/// Owns an open stream and closes it exactly once, on `close()` or drop.
pub struct StreamGuard {
    stream: Option<Box<dyn SensorStream>>,
    label: String,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn SensorStream>, label: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next_frame(),
            None => Err(anyhow!("{} stream already closed", self.label)),
        }
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            log::info!("{}: closing the stream", self.label);
            stream.close();
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Video profiles
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl VideoProfile {
    pub fn new(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }
}

/// Pick the capture profile for the color camera.
///
/// Prefers `width == target_width` at a frame rate rounding to `target_fps`,
/// then any profile with the target width.
pub fn select_video_profile(
    profiles: &[VideoProfile],
    target_width: u32,
    target_fps: u32,
) -> Option<VideoProfile> {
    profiles
        .iter()
        .find(|p| p.width == target_width && p.frame_rate.round() as u32 == target_fps)
        .or_else(|| profiles.iter().find(|p| p.width == target_width))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStream {
        closes: Arc<AtomicUsize>,
    }

    impl SensorStream for CountingStream {
        fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            Ok(None)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = StreamGuard::new(
            Box::new(CountingStream {
                closes: closes.clone(),
            }),
            "test",
        );
        guard.close();
        drop(guard);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_closes_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _guard = StreamGuard::new(
                Box::new(CountingStream {
                    closes: closes.clone(),
                }),
                "test",
            );
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_guard_reports_error() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = StreamGuard::new(Box::new(CountingStream { closes }), "test");
        guard.close();
        assert!(guard.next_frame().is_err());
    }

    #[test]
    fn profile_selection_prefers_width_and_rate() {
        let profiles = [
            VideoProfile::new(1280, 720, 30.0),
            VideoProfile::new(1920, 1080, 15.0),
            VideoProfile::new(1280, 720, 14.99),
        ];
        let selected = select_video_profile(&profiles, 1280, 15).unwrap();
        assert_eq!(selected, VideoProfile::new(1280, 720, 14.99));
    }

    #[test]
    fn profile_selection_falls_back_to_width() {
        let profiles = [
            VideoProfile::new(640, 360, 15.0),
            VideoProfile::new(1280, 720, 30.0),
        ];
        let selected = select_video_profile(&profiles, 1280, 15).unwrap();
        assert_eq!(selected.frame_rate, 30.0);
        assert!(select_video_profile(&profiles, 960, 15).is_none());
    }

    #[test]
    fn unknown_backend_scheme_is_rejected() {
        let err = backend_from_url("rm://device", SyntheticConfig::default()).err();
        assert!(err.is_some());
    }
}
