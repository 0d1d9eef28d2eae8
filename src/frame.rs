//! Sensor frame model and the latest-frame hand-off slot.
//!
//! - `SensorRole` / `SensorDescriptor`: which sensor a pipeline serves.
//! - `RawFrame`: one hardware read, immutable after it is published.
//! - `Pose4x4`: row-major rigid transform into world space.
//! - `FrameSlot`: single-latest-value mailbox between acquisition and dispatch.
//!
//! A `RawFrame` is created by the acquisition thread on each successful read,
//! published into the sensor's `FrameSlot`, and dropped once the dispatch side
//! has encoded it (or once a newer frame replaces it). Frames are never queued.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Fixed AHAT canvas (short-throw depth).
pub const AHAT_WIDTH: u32 = 512;
pub const AHAT_HEIGHT: u32 = 512;

/// Fixed long-throw depth canvas.
pub const LONG_THROW_WIDTH: u32 = 320;
pub const LONG_THROW_HEIGHT: u32 = 288;

/// Front grayscale camera canvas, one byte per pixel.
pub const VLC_WIDTH: u32 = 640;
pub const VLC_HEIGHT: u32 = 480;
pub const VLC_BYTES_PER_PIXEL: u32 = 1;

// ----------------------------------------------------------------------------
// Sensor identity
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    DepthAhat,
    DepthLongThrow,
    LeftFront,
    RightFront,
    ColorVideo,
}

impl SensorRole {
    pub const ALL: [SensorRole; 5] = [
        SensorRole::DepthAhat,
        SensorRole::DepthLongThrow,
        SensorRole::LeftFront,
        SensorRole::RightFront,
        SensorRole::ColorVideo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SensorRole::DepthAhat => "depth_ahat",
            SensorRole::DepthLongThrow => "depth_long_throw",
            SensorRole::LeftFront => "left_front",
            SensorRole::RightFront => "right_front",
            SensorRole::ColorVideo => "color_video",
        }
    }

}

impl fmt::Display for SensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SensorRole {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        SensorRole::ALL
            .into_iter()
            .find(|role| role.name() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown sensor role '{}'", value))
    }
}

/// Identifies one enumerated sensor. Immutable once enumerated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub role: SensorRole,
    /// Backend-specific handle (device id, node name, ...).
    pub handle: String,
}

impl SensorDescriptor {
    pub fn new(role: SensorRole, handle: impl Into<String>) -> Self {
        Self {
            role,
            handle: handle.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn row_stride(&self) -> u32 {
        self.width.saturating_mul(self.bytes_per_pixel)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FocalLength {
    pub fx: f32,
    pub fy: f32,
}

/// Two depth planes plus the optional per-pixel sigma/flag buffer.
///
/// AHAT frames validate by threshold and carry no sigma buffer.
/// Long-throw frames validate the depth plane through `sigma`.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthBuffer {
    pub depth: Vec<u16>,
    pub active_brightness: Vec<u16>,
    pub sigma: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColorBuffer {
    /// Row-major BGRA8 pixels.
    pub bgra: Vec<u8>,
    pub focal_length: FocalLength,
    /// Transform from this frame's own coordinate system into world space.
    pub frame_to_world: Option<Pose4x4>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FramePayload {
    Depth(DepthBuffer),
    Vlc(Vec<u8>),
    Color(ColorBuffer),
}

impl FramePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            FramePayload::Depth(_) => "depth",
            FramePayload::Vlc(_) => "vlc",
            FramePayload::Color(_) => "color",
        }
    }
}

/// One hardware read.
///
/// Owned by the `FrameSlot` between publish and consume and never mutated in
/// place; a newer frame replaces it wholesale.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    /// Monotonic sensor clock, 100 ns ticks.
    pub timestamp_ticks: u64,
    pub resolution: Resolution,
    pub payload: FramePayload,
}

impl RawFrame {
    pub fn new(timestamp_ticks: u64, resolution: Resolution, payload: FramePayload) -> Self {
        Self {
            timestamp_ticks,
            resolution,
            payload,
        }
    }
}

// ----------------------------------------------------------------------------
// Pose4x4
// ----------------------------------------------------------------------------

/// 4x4 row-major rigid transform (m11..m44), row-vector convention:
/// rotation in the upper 3x3 block, translation in row 4.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose4x4(pub [[f32; 4]; 4]);

impl Pose4x4 {
    pub fn identity() -> Self {
        Pose4x4([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Rig-to-world transform from an orientation quaternion `[x, y, z, w]`
    /// and a position, composed as rotation followed by translation.
    pub fn from_orientation_position(q: [f32; 4], p: [f32; 3]) -> Self {
        let [x, y, z, w] = q;
        let (xx, yy, zz) = (x * x, y * y, z * z);
        let (xy, xz, yz) = (x * y, x * z, y * z);
        let (wx, wy, wz) = (w * x, w * y, w * z);
        let rotation = Pose4x4([
            [1.0 - 2.0 * (yy + zz), 2.0 * (xy + wz), 2.0 * (xz - wy), 0.0],
            [2.0 * (xy - wz), 1.0 - 2.0 * (xx + zz), 2.0 * (yz + wx), 0.0],
            [2.0 * (xz + wy), 2.0 * (yz - wx), 1.0 - 2.0 * (xx + yy), 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let mut translation = Pose4x4::identity();
        translation.0[3] = [p[0], p[1], p[2], 1.0];
        rotation.multiply(&translation)
    }

    /// `self * rhs`. With row vectors this applies `self` first.
    pub fn multiply(&self, rhs: &Pose4x4) -> Pose4x4 {
        let mut out = [[0.0f32; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.0[i][k] * rhs.0[k][j]).sum();
            }
        }
        Pose4x4(out)
    }

    /// Row-major element order, m11 first.
    pub fn to_row_major(&self) -> [f32; 16] {
        let mut out = [0.0f32; 16];
        for (i, row) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(row);
        }
        out
    }

    pub fn from_row_major(values: [f32; 16]) -> Self {
        let mut m = [[0.0f32; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row.copy_from_slice(&values[i * 4..i * 4 + 4]);
        }
        Pose4x4(m)
    }

    pub fn translation(&self) -> [f32; 3] {
        [self.0[3][0], self.0[3][1], self.0[3][2]]
    }
}

impl Default for Pose4x4 {
    fn default() -> Self {
        Self::identity()
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-frame mailbox
// ----------------------------------------------------------------------------

/// Holds only the most recently published value.
///
/// The acquisition thread is the single writer. `peek` clones the `Arc` under
/// the lock and returns immediately, so encoding never holds the lock and the
/// writer is never blocked by a slow sink.
#[derive(Debug)]
pub struct FrameSlot<T = RawFrame> {
    latest: Mutex<Option<Arc<T>>>,
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
        }
    }

    /// Replace the held value. The previous one is dropped once the last
    /// reader releases its snapshot.
    pub fn publish(&self, value: T) {
        let value = Arc::new(value);
        let mut guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(value);
    }

    pub fn peek(&self) -> Option<Arc<T>> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_empty(&self) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
