use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{AcquisitionLoop, Dispatcher, PipelineCounters, ProcessorStats, StateCell};
use crate::consent::ConsentProvider;
use crate::frame::{FrameSlot, SensorDescriptor, SensorRole};
use crate::sensor::SensorBackend;
use crate::sink::FrameSink;
use crate::transport::{FrameLink, FrameServer, RequestGate, RequestListener};

/// Builds the sink for a processor each time it starts.
pub type SinkFactory = Box<dyn Fn(FrameLink) -> Box<dyn FrameSink> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub stream_addr: SocketAddr,
    pub request_addr: SocketAddr,
    pub min_delta_ticks: u64,
    pub poll_interval: Duration,
}

struct Running {
    stop: Arc<AtomicBool>,
    acquisition: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// One sensor's pipeline: endpoints bound for its whole lifetime, threads
/// running between `start` and `stop`.
pub struct SensorProcessor {
    descriptor: SensorDescriptor,
    backend: Arc<dyn SensorBackend>,
    consent: Arc<dyn ConsentProvider>,
    config: ProcessorConfig,
    slot: Arc<FrameSlot>,
    gate: Arc<RequestGate>,
    state: Arc<StateCell>,
    counters: Arc<PipelineCounters>,
    server: FrameServer,
    listener: RequestListener,
    make_sink: SinkFactory,
    running: Option<Running>,
}

impl SensorProcessor {
    pub fn new(
        descriptor: SensorDescriptor,
        backend: Arc<dyn SensorBackend>,
        consent: Arc<dyn ConsentProvider>,
        config: ProcessorConfig,
        make_sink: SinkFactory,
    ) -> Result<Self> {
        let label = descriptor.role.name();
        let gate = Arc::new(RequestGate::new());
        let server = FrameServer::bind(config.stream_addr, label)?;
        let listener = RequestListener::bind(config.request_addr, gate.clone(), label)?;
        Ok(Self {
            descriptor,
            backend,
            consent,
            config,
            slot: Arc::new(FrameSlot::new()),
            gate,
            state: Arc::new(StateCell::new()),
            counters: Arc::new(PipelineCounters::default()),
            server,
            listener,
            make_sink,
            running: None,
        })
    }

    pub fn role(&self) -> SensorRole {
        self.descriptor.role
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn request_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the acquisition and dispatch threads. Consent is requested anew
    /// on every start.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let label = self.descriptor.role.name();
        self.slot.clear();
        self.gate.take();

        let stop = Arc::new(AtomicBool::new(false));
        let acquisition = AcquisitionLoop {
            descriptor: self.descriptor.clone(),
            backend: self.backend.clone(),
            consent: self.consent.clone(),
            slot: self.slot.clone(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            poll_interval: self.config.poll_interval,
        };
        let acquisition = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("{}-acquire", label))
                .spawn(move || acquisition.run(&stop))
                .with_context(|| format!("{}: spawn acquisition thread", label))?
        };

        let mut dispatcher = Dispatcher::new(
            self.descriptor.role,
            self.slot.clone(),
            self.gate.clone(),
            self.config.min_delta_ticks,
            (self.make_sink)(self.server.link()),
            self.counters.clone(),
        );
        let poll_interval = self.config.poll_interval;
        let dispatch_spawn = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("{}-dispatch", label))
                .spawn(move || dispatcher.run(&stop, poll_interval))
        };
        let dispatch = match dispatch_spawn {
            Ok(join) => join,
            Err(err) => {
                stop.store(true, Ordering::SeqCst);
                let _ = acquisition.join();
                return Err(anyhow!("{}: spawn dispatch thread: {}", label, err));
            }
        };

        log::info!("{}: processor started", label);
        self.running = Some(Running {
            stop,
            acquisition,
            dispatch,
        });
        Ok(())
    }

    /// Raise the stop flag and join both threads. The hardware stream is
    /// closed by the acquisition thread on its way out.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let label = self.descriptor.role.name();
        running.stop.store(true, Ordering::SeqCst);
        if running.acquisition.join().is_err() {
            log::error!("{}: acquisition thread panicked", label);
        }
        if running.dispatch.join().is_err() {
            log::error!("{}: dispatch thread panicked", label);
        }
        log::info!("{}: processor stopped", label);
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            role: self.descriptor.role,
            state: self.state.get(),
            running: self.is_running(),
            client_connected: self.server.is_connected(),
            bytes_written: self.server.link().bytes_written(),
            requests_received: self.gate.requests_received(),
            counters: self.counters.snapshot(),
        }
    }
}

impl Drop for SensorProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TickConverter;
    use crate::consent::{ConsentState, ScriptedConsent};
    use crate::pipeline::AcquisitionState;
    use crate::sensor::{SensorBackend, SyntheticBackend, SyntheticConfig};
    use crate::sink::{PoseSource, VlcEncoder, WireSink};
    use std::time::Instant;

    fn processor(consent: ScriptedConsent) -> SensorProcessor {
        let backend: Arc<dyn SensorBackend> =
            Arc::new(SyntheticBackend::new("stub://test", SyntheticConfig::default()));
        let locator = backend.rig_locator();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        SensorProcessor::new(
            SensorDescriptor::new(SensorRole::LeftFront, "stub://test/left_front"),
            backend,
            Arc::new(consent),
            ProcessorConfig {
                stream_addr: loopback,
                request_addr: loopback,
                min_delta_ticks: 0,
                poll_interval: Duration::from_millis(1),
            },
            Box::new(move |link: FrameLink| -> Box<dyn FrameSink> {
                Box::new(WireSink::new(
                    "left_front",
                    VlcEncoder,
                    PoseSource::Rig(locator.clone()),
                    TickConverter::default(),
                    link,
                ))
            }),
        )
        .unwrap()
    }

    fn wait_for_state(p: &SensorProcessor, state: AcquisitionState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if p.stats().state == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_stop_restart() {
        let mut p = processor(ScriptedConsent::allow_all());
        assert_eq!(p.stats().state, AcquisitionState::Idle);

        p.start().unwrap();
        assert!(p.is_running());
        assert!(wait_for_state(&p, AcquisitionState::Acquiring));
        p.stop();
        assert!(!p.is_running());
        assert_eq!(p.stats().state, AcquisitionState::Stopped);

        p.start().unwrap();
        assert!(wait_for_state(&p, AcquisitionState::Acquiring));
        p.stop();
    }

    #[test]
    fn denied_processor_keeps_endpoints_bound() {
        let mut p = processor(ScriptedConsent::new(
            ConsentState::DeniedBySystem,
            Duration::ZERO,
        ));
        p.start().unwrap();
        assert!(wait_for_state(&p, AcquisitionState::Stopped));
        assert_eq!(p.stats().counters.acquired, 0);
        assert_eq!(p.stats().bytes_written, 0);
        assert_ne!(p.stream_addr().port(), 0);
        assert_ne!(p.request_addr().port(), 0);
        p.stop();
    }
}
