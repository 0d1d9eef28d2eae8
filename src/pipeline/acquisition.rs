use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::PipelineCounters;
use crate::consent::{ConsentKind, ConsentProvider};
use crate::frame::{FrameSlot, SensorDescriptor};
use crate::sensor::{SensorBackend, StreamGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Never started.
    Idle,
    AwaitingConsent,
    StreamOpening,
    Acquiring,
    Closing,
    Stopped,
}

/// Acquisition state observable from other threads.
#[derive(Debug)]
pub struct StateCell(Mutex<AcquisitionState>);

impl StateCell {
    pub fn new() -> Self {
        Self(Mutex::new(AcquisitionState::Idle))
    }

    pub fn get(&self) -> AcquisitionState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: AcquisitionState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture loop for one sensor; the only writer of its `FrameSlot`.
pub struct AcquisitionLoop {
    pub descriptor: SensorDescriptor,
    pub backend: Arc<dyn SensorBackend>,
    pub consent: Arc<dyn ConsentProvider>,
    pub slot: Arc<FrameSlot>,
    pub state: Arc<StateCell>,
    pub counters: Arc<PipelineCounters>,
    pub poll_interval: Duration,
}

impl AcquisitionLoop {
    /// Runs until `stop` is raised or the sensor cannot be opened.
    pub fn run(&self, stop: &AtomicBool) {
        let label = self.descriptor.role.name();

        self.state.set(AcquisitionState::AwaitingConsent);
        let ticket = self.consent.request_access(ConsentKind::Camera);
        match ticket.await_terminal(stop) {
            Some(state) if state.is_allowed() => {
                log::debug!("{}: camera access granted", label);
            }
            Some(state) => {
                log::error!("{}: not streaming, {}", label, state);
                self.state.set(AcquisitionState::Stopped);
                return;
            }
            None => {
                log::info!("{}: stopped while awaiting consent", label);
                self.state.set(AcquisitionState::Stopped);
                return;
            }
        }

        self.state.set(AcquisitionState::StreamOpening);
        let mut stream = match self.backend.open_stream(&self.descriptor) {
            Ok(stream) => StreamGuard::new(stream, label),
            Err(err) => {
                log::error!("{}: failed to open sensor stream: {:#}", label, err);
                self.state.set(AcquisitionState::Stopped);
                return;
            }
        };

        self.state.set(AcquisitionState::Acquiring);
        log::info!("{}: acquiring from {}", label, self.descriptor.handle);
        while !stop.load(Ordering::SeqCst) {
            match stream.next_frame() {
                Ok(Some(frame)) => {
                    self.slot.publish(frame);
                    self.counters.record_acquired();
                }
                Ok(None) => {}
                Err(err) => {
                    self.counters.record_read_failure();
                    log::debug!("{}: frame read failed: {:#}", label, err);
                }
            }
            std::thread::sleep(self.poll_interval);
        }

        self.state.set(AcquisitionState::Closing);
        stream.close();
        self.state.set(AcquisitionState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{ConsentState, ScriptedConsent};
    use crate::frame::{FramePayload, Pose4x4, RawFrame, Resolution, SensorRole};
    use crate::sensor::{PoseLocator, SensorStream, VideoProfile};
    use anyhow::{anyhow, Result};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingBackend {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_open: bool,
    }

    struct TickingStream {
        next_ts: u64,
        closes: Arc<AtomicUsize>,
    }

    impl SensorStream for TickingStream {
        fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            self.next_ts += 1;
            if self.next_ts % 3 == 0 {
                return Err(anyhow!("transient"));
            }
            Ok(Some(RawFrame::new(
                self.next_ts,
                Resolution::new(1, 1, 1),
                FramePayload::Vlc(vec![0]),
            )))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoPose;

    impl PoseLocator for NoPose {
        fn locate(&self, _timestamp_ticks: u64) -> Option<Pose4x4> {
            None
        }
    }

    impl SensorBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn enumerate_sensors(&self) -> Vec<SensorDescriptor> {
            vec![SensorDescriptor::new(SensorRole::LeftFront, "lf")]
        }

        fn open_stream(&self, _descriptor: &SensorDescriptor) -> Result<Box<dyn SensorStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(anyhow!("device busy"));
            }
            Ok(Box::new(TickingStream {
                next_ts: 0,
                closes: self.closes.clone(),
            }))
        }

        fn video_profiles(&self) -> Vec<VideoProfile> {
            Vec::new()
        }

        fn apply_video_profile(&self, _profile: &VideoProfile) -> Result<()> {
            Ok(())
        }

        fn rig_locator(&self) -> Arc<dyn PoseLocator> {
            Arc::new(NoPose)
        }
    }

    fn acquisition(
        backend: Arc<CountingBackend>,
        consent: ScriptedConsent,
    ) -> AcquisitionLoop {
        AcquisitionLoop {
            descriptor: SensorDescriptor::new(SensorRole::LeftFront, "lf"),
            backend,
            consent: Arc::new(consent),
            slot: Arc::new(FrameSlot::new()),
            state: Arc::new(StateCell::new()),
            counters: Arc::new(PipelineCounters::default()),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn denied_consent_never_opens_stream() {
        let backend = Arc::new(CountingBackend::default());
        let acq = acquisition(
            backend.clone(),
            ScriptedConsent::new(ConsentState::DeniedByUser, Duration::from_millis(5)),
        );
        acq.run(&AtomicBool::new(false));

        assert_eq!(acq.state.get(), AcquisitionState::Stopped);
        assert_eq!(backend.opens.load(Ordering::SeqCst), 0);
        assert!(acq.slot.is_empty());
    }

    #[test]
    fn open_failure_stops_pipeline() {
        let backend = Arc::new(CountingBackend {
            fail_open: true,
            ..Default::default()
        });
        let acq = acquisition(backend.clone(), ScriptedConsent::allow_all());
        acq.run(&AtomicBool::new(false));

        assert_eq!(acq.state.get(), AcquisitionState::Stopped);
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert!(acq.slot.is_empty());
    }

    #[test]
    fn publishes_until_stopped_then_closes() {
        let backend = Arc::new(CountingBackend::default());
        let acq = Arc::new(acquisition(backend.clone(), ScriptedConsent::allow_all()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let acq = acq.clone();
            let stop = stop.clone();
            std::thread::spawn(move || acq.run(&stop))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acq.state.get(), AcquisitionState::Acquiring);
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(acq.state.get(), AcquisitionState::Stopped);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        let counters = acq.counters.snapshot();
        assert!(counters.acquired > 0);
        assert!(counters.read_failures > 0);
        assert!(!acq.slot.is_empty());
    }
}
