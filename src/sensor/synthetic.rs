//! Synthetic sensor backend (`stub://`).
//!
//! Produces plausible frames for every sensor role at a fixed rate so the
//! full pipeline can run without sensor hardware:
//! - depth planes with a sprinkling of saturated samples (AHAT) or
//!   sigma-invalidated samples (long throw)
//! - moving grayscale gradients for the front cameras
//! - BGRA color frames at the applied capture profile
//!
//! The rig locator slowly orbits the origin so streamed poses change.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{PoseLocator, SensorBackend, SensorStream, VideoProfile};
use crate::clock::{monotonic_ticks, TICKS_PER_SECOND};
use crate::frame::{
    ColorBuffer, DepthBuffer, FocalLength, FramePayload, Pose4x4, RawFrame, Resolution,
    SensorDescriptor, SensorRole, AHAT_HEIGHT, AHAT_WIDTH, LONG_THROW_HEIGHT, LONG_THROW_WIDTH,
    VLC_BYTES_PER_PIXEL, VLC_HEIGHT, VLC_WIDTH,
};

const AHAT_SATURATION: u16 = 4090;
const SIGMA_INVALID: u8 = 0x80;
const ORBIT_PERIOD_SECS: f32 = 20.0;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Frame rate of the research-mode sensors.
    pub frame_rate: u32,
    /// Probability that a poll reports a transient read failure.
    pub dropout_rate: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            dropout_rate: 0.0,
        }
    }
}

pub struct SyntheticBackend {
    url: String,
    config: SyntheticConfig,
    video_profile: Mutex<Option<VideoProfile>>,
    locator: Arc<SyntheticLocator>,
}

impl SyntheticBackend {
    pub fn new(url: &str, config: SyntheticConfig) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            config,
            video_profile: Mutex::new(None),
            locator: Arc::new(SyntheticLocator::default()),
        }
    }

    fn interval(frame_rate: f64) -> Duration {
        if frame_rate <= 0.0 {
            Duration::from_millis(100)
        } else {
            Duration::from_secs_f64(1.0 / frame_rate)
        }
    }
}

impl SensorBackend for SyntheticBackend {
    fn name(&self) -> &str {
        &self.url
    }

    fn enumerate_sensors(&self) -> Vec<SensorDescriptor> {
        SensorRole::ALL
            .iter()
            .map(|role| SensorDescriptor::new(*role, format!("{}/{}", self.url, role)))
            .collect()
    }

    fn open_stream(&self, descriptor: &SensorDescriptor) -> Result<Box<dyn SensorStream>> {
        let (resolution, interval) = match descriptor.role {
            SensorRole::DepthAhat => (
                Resolution::new(AHAT_WIDTH, AHAT_HEIGHT, 2),
                Self::interval(f64::from(self.config.frame_rate)),
            ),
            SensorRole::DepthLongThrow => (
                Resolution::new(LONG_THROW_WIDTH, LONG_THROW_HEIGHT, 2),
                Self::interval(f64::from(self.config.frame_rate)),
            ),
            SensorRole::LeftFront | SensorRole::RightFront => (
                Resolution::new(VLC_WIDTH, VLC_HEIGHT, VLC_BYTES_PER_PIXEL),
                Self::interval(f64::from(self.config.frame_rate)),
            ),
            SensorRole::ColorVideo => {
                let applied = *self
                    .video_profile
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let profile = applied
                    .ok_or_else(|| anyhow!("video profile not applied before opening stream"))?;
                (
                    Resolution::new(profile.width, profile.height, 4),
                    Self::interval(profile.frame_rate),
                )
            }
        };
        log::info!(
            "{}: opened synthetic stream {}x{} every {:?}",
            descriptor.handle,
            resolution.width,
            resolution.height,
            interval
        );
        Ok(Box::new(SyntheticStream {
            role: descriptor.role,
            resolution,
            interval,
            dropout_rate: self.config.dropout_rate,
            last_frame_at: None,
            frame_count: 0,
            rng: StdRng::from_entropy(),
            locator: self.locator.clone(),
            open: true,
        }))
    }

    fn video_profiles(&self) -> Vec<VideoProfile> {
        vec![
            VideoProfile::new(1952, 1100, 30.0),
            VideoProfile::new(1952, 1100, 15.0),
            VideoProfile::new(1504, 846, 15.0),
            VideoProfile::new(1280, 720, 30.0),
            VideoProfile::new(1280, 720, 15.0),
            VideoProfile::new(960, 540, 15.0),
            VideoProfile::new(640, 360, 15.0),
        ]
    }

    fn apply_video_profile(&self, profile: &VideoProfile) -> Result<()> {
        *self
            .video_profile
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(*profile);
        Ok(())
    }

    fn rig_locator(&self) -> Arc<dyn PoseLocator> {
        self.locator.clone()
    }
}

struct SyntheticStream {
    role: SensorRole,
    resolution: Resolution,
    interval: Duration,
    dropout_rate: f64,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    rng: StdRng,
    locator: Arc<SyntheticLocator>,
    open: bool,
}

impl SensorStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.open {
            return Err(anyhow!("synthetic {} stream is closed", self.role));
        }
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            if now.duration_since(last) < self.interval {
                return Ok(None);
            }
        }
        if self.dropout_rate > 0.0 && self.rng.gen_bool(self.dropout_rate.min(1.0)) {
            self.last_frame_at = Some(now);
            return Err(anyhow!("synthetic {} read failure", self.role));
        }
        self.last_frame_at = Some(now);
        self.frame_count += 1;

        let timestamp = monotonic_ticks();
        let payload = match self.role {
            SensorRole::DepthAhat => FramePayload::Depth(self.ahat_planes()),
            SensorRole::DepthLongThrow => FramePayload::Depth(self.long_throw_planes()),
            SensorRole::LeftFront | SensorRole::RightFront => {
                FramePayload::Vlc(self.gradient())
            }
            SensorRole::ColorVideo => FramePayload::Color(self.color(timestamp)),
        };
        Ok(Some(RawFrame::new(timestamp, self.resolution, payload)))
    }

    fn close(&mut self) {
        self.open = false;
    }
}

impl SyntheticStream {
    fn depth_ramp(&self) -> Vec<u16> {
        let w = self.resolution.width as usize;
        let shift = self.frame_count as usize;
        (0..self.resolution.pixel_count())
            .map(|i| (200 + ((i % w + shift) % 800)) as u16)
            .collect()
    }

    fn ahat_planes(&mut self) -> DepthBuffer {
        let mut depth = self.depth_ramp();
        let mut active_brightness: Vec<u16> = depth.iter().map(|d| d / 2).collect();
        for _ in 0..depth.len() / 100 {
            let i = self.rng.gen_range(0..depth.len());
            depth[i] = self.rng.gen_range(AHAT_SATURATION..=u16::MAX);
            active_brightness[i] = AHAT_SATURATION;
        }
        DepthBuffer {
            depth,
            active_brightness,
            sigma: None,
        }
    }

    fn long_throw_planes(&mut self) -> DepthBuffer {
        let depth = self.depth_ramp();
        let active_brightness: Vec<u16> = depth.iter().map(|d| d / 3).collect();
        let mut sigma = vec![0u8; depth.len()];
        for _ in 0..depth.len() / 50 {
            let i = self.rng.gen_range(0..sigma.len());
            sigma[i] = SIGMA_INVALID | self.rng.gen_range(0..0x80u8);
        }
        DepthBuffer {
            depth,
            active_brightness,
            sigma: Some(sigma),
        }
    }

    fn gradient(&self) -> Vec<u8> {
        let w = self.resolution.width as usize;
        let shift = self.frame_count as usize;
        (0..self.resolution.pixel_count())
            .map(|i| ((i % w + i / w + shift) % 256) as u8)
            .collect()
    }

    fn color(&mut self, timestamp: u64) -> ColorBuffer {
        let w = self.resolution.width as usize;
        let shift = self.frame_count as usize;
        let mut bgra = Vec::with_capacity(self.resolution.pixel_count() * 4);
        for i in 0..self.resolution.pixel_count() {
            let (x, y) = (i % w, i / w);
            bgra.extend_from_slice(&[
                ((x + shift) % 256) as u8,
                (y % 256) as u8,
                ((x + y) % 256) as u8,
                0xFF,
            ]);
        }
        let noise = self.rng.gen_range(-0.5f32..0.5);
        let frame_to_world = self.locator.locate(timestamp).map(|rig| {
            let mut camera_offset = Pose4x4::identity();
            camera_offset.0[3] = [0.0, 0.02, -0.08, 1.0];
            camera_offset.multiply(&rig)
        });
        ColorBuffer {
            bgra,
            focal_length: FocalLength {
                fx: self.resolution.width as f32 * 0.78 + noise,
                fy: self.resolution.width as f32 * 0.78 - noise,
            },
            frame_to_world,
        }
    }
}

/// Rig orbiting the origin at 1.5 m radius, facing the center.
#[derive(Clone, Debug)]
pub struct SyntheticLocator {
    radius: f32,
}

impl Default for SyntheticLocator {
    fn default() -> Self {
        Self { radius: 1.5 }
    }
}

impl PoseLocator for SyntheticLocator {
    fn locate(&self, timestamp_ticks: u64) -> Option<Pose4x4> {
        let secs = timestamp_ticks as f32 / TICKS_PER_SECOND as f32;
        let angle = (secs / ORBIT_PERIOD_SECS) * std::f32::consts::TAU;
        let half = angle / 2.0;
        let orientation = [0.0, half.sin(), 0.0, half.cos()];
        let position = [self.radius * angle.sin(), 0.0, self.radius * angle.cos()];
        Some(Pose4x4::from_orientation_position(orientation, position))
    }
}
