use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::consent::ConsentState;
use crate::frame::SensorRole;

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_BACKEND: &str = "stub://hl2";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_VIDEO_WIDTH: u32 = 1280;
const DEFAULT_VIDEO_FPS: u32 = 15;
const DEFAULT_STUB_CONSENT_DELAY_MS: u64 = 50;
const DEFAULT_STUB_FRAME_RATE: u32 = 30;

const DEFAULT_VIDEO_PORTS: (u16, u16) = (23940, 21110);
const DEFAULT_DEPTH_PORTS: (u16, u16) = (23941, 21111);
const DEFAULT_LEFT_FRONT_PORTS: (u16, u16) = (23942, 21112);
const DEFAULT_RIGHT_FRONT_PORTS: (u16, u16) = (23943, 21113);

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    bind_host: Option<String>,
    backend: Option<String>,
    depth_mode: Option<DepthMode>,
    poll_interval_ms: Option<u64>,
    video: Option<VideoConfigFile>,
    depth: Option<SensorConfigFile>,
    left_front: Option<SensorConfigFile>,
    right_front: Option<SensorConfigFile>,
    stub: Option<StubConfigFile>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct SensorConfigFile {
    enabled: Option<bool>,
    stream_port: Option<u16>,
    request_port: Option<u16>,
    min_delta_ticks: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    #[serde(flatten)]
    sensor: SensorConfigFile,
    target_width: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StubConfigFile {
    consent: Option<ConsentState>,
    consent_delay_ms: Option<u64>,
    frame_rate: Option<u32>,
    dropout_rate: Option<f64>,
}

/// Which depth sensor streams. Only one runs at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthMode {
    LongThrow,
    Ahat,
}

impl DepthMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "long_throw" | "longthrow" => Some(DepthMode::LongThrow),
            "ahat" => Some(DepthMode::Ahat),
            _ => None,
        }
    }

    pub fn role(self) -> SensorRole {
        match self {
            DepthMode::LongThrow => SensorRole::DepthLongThrow,
            DepthMode::Ahat => SensorRole::DepthAhat,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub enabled: bool,
    pub stream_port: u16,
    pub request_port: u16,
    pub min_delta_ticks: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSettings {
    pub sensor: SensorSettings,
    pub target_width: u32,
    pub target_fps: u32,
}

/// Knobs for the synthetic `stub://` backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StubSettings {
    pub consent: ConsentState,
    pub consent_delay: Duration,
    pub frame_rate: u32,
    pub dropout_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    pub bind_host: String,
    pub backend: String,
    pub depth_mode: DepthMode,
    pub poll_interval: Duration,
    pub video: VideoSettings,
    pub depth: SensorSettings,
    pub left_front: SensorSettings,
    pub right_front: SensorSettings,
    pub stub: StubSettings,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self::from_file(StreamerConfigFile::default())
    }
}

impl StreamerConfig {
    /// File named by `STREAMER_CONFIG` (if any), then `STREAMER_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamerConfigFile) -> Self {
        let stub = StubSettings {
            consent: file
                .stub
                .as_ref()
                .and_then(|stub| stub.consent)
                .unwrap_or(ConsentState::Allowed),
            consent_delay: Duration::from_millis(
                file.stub
                    .as_ref()
                    .and_then(|stub| stub.consent_delay_ms)
                    .unwrap_or(DEFAULT_STUB_CONSENT_DELAY_MS),
            ),
            frame_rate: file
                .stub
                .as_ref()
                .and_then(|stub| stub.frame_rate)
                .unwrap_or(DEFAULT_STUB_FRAME_RATE),
            dropout_rate: file
                .stub
                .as_ref()
                .and_then(|stub| stub.dropout_rate)
                .unwrap_or(0.0),
        };
        let video = VideoSettings {
            sensor: sensor_settings(
                file.video.as_ref().map(|video| &video.sensor),
                DEFAULT_VIDEO_PORTS,
            ),
            target_width: file
                .video
                .as_ref()
                .and_then(|video| video.target_width)
                .unwrap_or(DEFAULT_VIDEO_WIDTH),
            target_fps: file
                .video
                .as_ref()
                .and_then(|video| video.target_fps)
                .unwrap_or(DEFAULT_VIDEO_FPS),
        };
        Self {
            bind_host: file
                .bind_host
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            backend: file.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            depth_mode: file.depth_mode.unwrap_or(DepthMode::LongThrow),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            video,
            depth: sensor_settings(file.depth.as_ref(), DEFAULT_DEPTH_PORTS),
            left_front: sensor_settings(file.left_front.as_ref(), DEFAULT_LEFT_FRONT_PORTS),
            right_front: sensor_settings(file.right_front.as_ref(), DEFAULT_RIGHT_FRONT_PORTS),
            stub,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("STREAMER_BIND_HOST") {
            if !host.trim().is_empty() {
                self.bind_host = host.trim().to_string();
            }
        }
        if let Ok(backend) = std::env::var("STREAMER_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("STREAMER_DEPTH_MODE") {
            self.depth_mode = DepthMode::parse(&mode)
                .ok_or_else(|| anyhow!("STREAMER_DEPTH_MODE must be 'long_throw' or 'ahat'"))?;
        }
        if let Ok(width) = std::env::var("STREAMER_VIDEO_WIDTH") {
            self.video.target_width = width
                .trim()
                .parse()
                .map_err(|_| anyhow!("STREAMER_VIDEO_WIDTH must be an integer pixel width"))?;
        }
        if let Ok(delta) = std::env::var("STREAMER_MIN_DELTA_TICKS") {
            let ticks: u64 = delta.trim().parse().map_err(|_| {
                anyhow!("STREAMER_MIN_DELTA_TICKS must be an integer number of 100 ns ticks")
            })?;
            for sensor in self.sensors_mut() {
                sensor.min_delta_ticks = ticks;
            }
        }
        if let Ok(disabled) = std::env::var("STREAMER_DISABLED_SENSORS") {
            for name in split_csv(&disabled) {
                let sensor = match name.to_ascii_lowercase().as_str() {
                    "video" | "color_video" => &mut self.video.sensor,
                    "depth" | "depth_ahat" | "depth_long_throw" => &mut self.depth,
                    "left_front" => &mut self.left_front,
                    "right_front" => &mut self.right_front,
                    other => {
                        return Err(anyhow!(
                            "STREAMER_DISABLED_SENSORS: unknown sensor '{}'",
                            other
                        ))
                    }
                };
                sensor.enabled = false;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.bind_ip()?;
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }
        if self.video.target_fps == 0 {
            return Err(anyhow!("video.target_fps must be greater than zero"));
        }
        if self.video.target_width == 0 {
            return Err(anyhow!("video.target_width must be greater than zero"));
        }
        if self.stub.frame_rate == 0 {
            return Err(anyhow!("stub.frame_rate must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.stub.dropout_rate) {
            return Err(anyhow!("stub.dropout_rate must be between 0 and 1"));
        }

        let enabled: Vec<&SensorSettings> =
            self.sensors().into_iter().filter(|s| s.enabled).collect();
        check_distinct("stream", enabled.iter().map(|s| s.stream_port))?;
        check_distinct("request", enabled.iter().map(|s| s.request_port))?;
        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_host
            .parse()
            .map_err(|_| anyhow!("bind_host '{}' is not an IP address", self.bind_host))
    }

    pub fn socket_addr(&self, port: u16) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, port))
    }

    /// Settings for a sensor role. Depth settings apply to the role picked
    /// by `depth_mode` only.
    pub fn sensor(&self, role: SensorRole) -> Option<&SensorSettings> {
        match role {
            SensorRole::ColorVideo => Some(&self.video.sensor),
            SensorRole::LeftFront => Some(&self.left_front),
            SensorRole::RightFront => Some(&self.right_front),
            SensorRole::DepthAhat | SensorRole::DepthLongThrow => {
                (role == self.depth_mode.role()).then_some(&self.depth)
            }
        }
    }

    fn sensors(&self) -> [&SensorSettings; 4] {
        [
            &self.video.sensor,
            &self.depth,
            &self.left_front,
            &self.right_front,
        ]
    }

    fn sensors_mut(&mut self) -> [&mut SensorSettings; 4] {
        [
            &mut self.video.sensor,
            &mut self.depth,
            &mut self.left_front,
            &mut self.right_front,
        ]
    }
}

fn sensor_settings(file: Option<&SensorConfigFile>, ports: (u16, u16)) -> SensorSettings {
    let file = file.cloned().unwrap_or_default();
    SensorSettings {
        enabled: file.enabled.unwrap_or(true),
        stream_port: file.stream_port.unwrap_or(ports.0),
        request_port: file.request_port.unwrap_or(ports.1),
        min_delta_ticks: file.min_delta_ticks.unwrap_or(0),
    }
}

fn check_distinct(kind: &str, ports: impl Iterator<Item = u16>) -> Result<()> {
    let mut seen = HashSet::new();
    for port in ports.filter(|port| *port != 0) {
        if !seen.insert(port) {
            return Err(anyhow!("{} port {} is assigned to more than one sensor", kind, port));
        }
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
