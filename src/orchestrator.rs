//! Top-level composition: one processor per streamed sensor.

use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::clock::TickConverter;
use crate::config::{SensorSettings, StreamerConfig};
use crate::consent::ConsentProvider;
use crate::frame::{SensorDescriptor, SensorRole};
use crate::pipeline::{ProcessorConfig, ProcessorStats, SensorProcessor, SinkFactory};
use crate::sensor::{select_video_profile, PoseLocator, SensorBackend};
use crate::sink::{
    AhatEncoder, ColorVideoEncoder, FrameSink, LongThrowEncoder, PayloadEncoder, PoseSource,
    VlcEncoder, WireSink,
};
use crate::transport::FrameLink;

/// Where a client reaches one sensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SensorEndpoint {
    pub role: SensorRole,
    pub stream_addr: SocketAddr,
    pub request_addr: SocketAddr,
}

pub struct StreamOrchestrator {
    backend_name: String,
    processors: Vec<SensorProcessor>,
    streaming: bool,
}

impl StreamOrchestrator {
    /// Enumerate sensors, fix the color capture profile, and bind every
    /// enabled sensor's endpoints. Nothing streams until `start`.
    pub fn initialize(
        config: &StreamerConfig,
        backend: Arc<dyn SensorBackend>,
        consent: Arc<dyn ConsentProvider>,
    ) -> Result<Self> {
        let descriptors = backend.enumerate_sensors();
        log::info!(
            "{}: {} sensors enumerated",
            backend.name(),
            descriptors.len()
        );
        let clock = TickConverter::from_system_clock();
        let locator = backend.rig_locator();

        let roles = [
            config.depth_mode.role(),
            SensorRole::LeftFront,
            SensorRole::RightFront,
            SensorRole::ColorVideo,
        ];
        let mut processors = Vec::new();
        for role in roles {
            let Some(settings) = config.sensor(role).filter(|s| s.enabled) else {
                log::info!("{}: disabled by configuration", role);
                continue;
            };
            let Some(descriptor) = descriptors.iter().find(|d| d.role == role) else {
                log::warn!("{}: not reported by {}", role, backend.name());
                continue;
            };
            if role == SensorRole::ColorVideo && !prepare_video(config, backend.as_ref()) {
                continue;
            }
            let processor = build_processor(
                config,
                settings,
                descriptor.clone(),
                backend.clone(),
                consent.clone(),
                sink_factory(role, locator.clone(), clock),
            )?;
            processors.push(processor);
        }

        Ok(Self {
            backend_name: backend.name().to_string(),
            processors,
            streaming: false,
        })
    }

    pub fn start(&mut self) {
        if self.streaming {
            return;
        }
        for processor in &mut self.processors {
            if let Err(err) = processor.start() {
                log::error!("{}: failed to start: {:#}", processor.role(), err);
            }
        }
        self.streaming = true;
        log::info!(
            "{}: streaming {} sensors",
            self.backend_name,
            self.processors.len()
        );
    }

    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        for processor in &mut self.processors {
            processor.stop();
        }
        self.streaming = false;
        log::info!("{}: streaming stopped", self.backend_name);
    }

    /// Start if stopped, stop if streaming. Returns the new state.
    pub fn toggle(&mut self) -> bool {
        if self.streaming {
            self.stop();
        } else {
            self.start();
        }
        self.streaming
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn roles(&self) -> Vec<SensorRole> {
        self.processors.iter().map(|p| p.role()).collect()
    }

    pub fn endpoints(&self) -> Vec<SensorEndpoint> {
        self.processors
            .iter()
            .map(|p| SensorEndpoint {
                role: p.role(),
                stream_addr: p.stream_addr(),
                request_addr: p.request_addr(),
            })
            .collect()
    }

    pub fn endpoint(&self, role: SensorRole) -> Option<SensorEndpoint> {
        self.endpoints().into_iter().find(|e| e.role == role)
    }

    pub fn stats(&self) -> Vec<ProcessorStats> {
        self.processors.iter().map(|p| p.stats()).collect()
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prepare_video(config: &StreamerConfig, backend: &dyn SensorBackend) -> bool {
    let profiles = backend.video_profiles();
    let Some(profile) =
        select_video_profile(&profiles, config.video.target_width, config.video.target_fps)
    else {
        log::error!(
            "color_video: no capture profile {} px wide among {} offered",
            config.video.target_width,
            profiles.len()
        );
        return false;
    };
    if let Err(err) = backend.apply_video_profile(&profile) {
        log::error!("color_video: failed to apply capture profile: {:#}", err);
        return false;
    }
    log::info!(
        "color_video: capturing {}x{} at {:.2} fps",
        profile.width,
        profile.height,
        profile.frame_rate
    );
    true
}

fn build_processor(
    config: &StreamerConfig,
    settings: &SensorSettings,
    descriptor: SensorDescriptor,
    backend: Arc<dyn SensorBackend>,
    consent: Arc<dyn ConsentProvider>,
    make_sink: SinkFactory,
) -> Result<SensorProcessor> {
    let role = descriptor.role;
    let processor_config = ProcessorConfig {
        stream_addr: config.socket_addr(settings.stream_port)?,
        request_addr: config.socket_addr(settings.request_port)?,
        min_delta_ticks: settings.min_delta_ticks,
        poll_interval: config.poll_interval,
    };
    SensorProcessor::new(descriptor, backend, consent, processor_config, make_sink)
        .with_context(|| format!("{}: failed to bind endpoints", role))
}

fn sink_factory(role: SensorRole, locator: Arc<dyn PoseLocator>, clock: TickConverter) -> SinkFactory {
    match role {
        SensorRole::DepthAhat => wire_sink(role, AhatEncoder, PoseSource::Rig(locator), clock),
        SensorRole::DepthLongThrow => {
            wire_sink(role, LongThrowEncoder, PoseSource::Rig(locator), clock)
        }
        SensorRole::LeftFront | SensorRole::RightFront => {
            wire_sink(role, VlcEncoder, PoseSource::Rig(locator), clock)
        }
        SensorRole::ColorVideo => wire_sink(role, ColorVideoEncoder, PoseSource::FrameOwn, clock),
    }
}

fn wire_sink<E>(role: SensorRole, encoder: E, poses: PoseSource, clock: TickConverter) -> SinkFactory
where
    E: PayloadEncoder + Clone + Sync + 'static,
{
    Box::new(move |link: FrameLink| -> Box<dyn FrameSink> {
        Box::new(WireSink::new(
            role.name(),
            encoder.clone(),
            poses.clone(),
            clock,
            link,
        ))
    })
}
