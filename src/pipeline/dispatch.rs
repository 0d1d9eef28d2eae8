use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::PipelineCounters;
use crate::frame::{FrameSlot, SensorRole};
use crate::sink::{FrameSink, SendOutcome};
use crate::transport::RequestGate;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    Fresh,
    /// Same timestamp as the last frame sent.
    Duplicate,
    /// Closer than `min_delta_ticks` to the last frame sent.
    TooSoon,
    /// Older than the last frame sent.
    OutOfOrder,
}

/// Freshness filter over sensor timestamps.
///
/// `last_sent` only moves on a `Fresh` verdict.
#[derive(Clone, Debug, Default)]
pub struct TimestampFilter {
    min_delta_ticks: u64,
    last_sent: Option<u64>,
}

impl TimestampFilter {
    pub fn new(min_delta_ticks: u64) -> Self {
        Self {
            min_delta_ticks,
            last_sent: None,
        }
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    pub fn admit(&mut self, timestamp: u64) -> FilterVerdict {
        let verdict = match self.last_sent {
            None => FilterVerdict::Fresh,
            Some(last) if timestamp == last => FilterVerdict::Duplicate,
            Some(last) if timestamp < last => FilterVerdict::OutOfOrder,
            Some(last) if timestamp - last < self.min_delta_ticks => FilterVerdict::TooSoon,
            Some(_) => FilterVerdict::Fresh,
        };
        if verdict == FilterVerdict::Fresh {
            self.last_sent = Some(timestamp);
        }
        verdict
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No request pending.
    Idle,
    /// Requested, but nothing has been acquired yet.
    Empty,
    Filtered(FilterVerdict),
    Attempted(SendOutcome),
}

/// Dispatch side of one sensor pipeline.
pub struct Dispatcher {
    role: SensorRole,
    slot: Arc<FrameSlot>,
    gate: Arc<RequestGate>,
    filter: TimestampFilter,
    sink: Box<dyn FrameSink>,
    counters: Arc<PipelineCounters>,
}

impl Dispatcher {
    pub fn new(
        role: SensorRole,
        slot: Arc<FrameSlot>,
        gate: Arc<RequestGate>,
        min_delta_ticks: u64,
        sink: Box<dyn FrameSink>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            role,
            slot,
            gate,
            filter: TimestampFilter::new(min_delta_ticks),
            sink,
            counters,
        }
    }

    pub fn filter(&self) -> &TimestampFilter {
        &self.filter
    }

    /// One dispatch attempt. A pending request is consumed whatever the
    /// outcome, so each frame needs its own request.
    pub fn tick(&mut self) -> DispatchOutcome {
        if !self.gate.take() {
            return DispatchOutcome::Idle;
        }
        let Some(frame) = self.slot.peek() else {
            return DispatchOutcome::Empty;
        };
        let verdict = self.filter.admit(frame.timestamp_ticks);
        if verdict != FilterVerdict::Fresh {
            log::trace!(
                "{}: frame {} filtered ({:?})",
                self.role,
                frame.timestamp_ticks,
                verdict
            );
            self.counters.record_filtered(verdict);
            return DispatchOutcome::Filtered(verdict);
        }
        let outcome = self.sink.send(&frame);
        self.counters.record_send(outcome);
        DispatchOutcome::Attempted(outcome)
    }

    /// Poll until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool, poll_interval: Duration) {
        let mut last_health = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            self.tick();
            if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
                let snapshot = self.counters.snapshot();
                log::info!(
                    "{}: acquired={} sent={} dropped={} read_failures={}",
                    self.role,
                    snapshot.acquired,
                    snapshot.sent,
                    snapshot.dropped(),
                    snapshot.read_failures
                );
                last_health = Instant::now();
            }
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePayload, RawFrame, Resolution};
    use std::sync::Mutex;

    struct RecordingSink(Arc<Mutex<Vec<u64>>>);

    impl FrameSink for RecordingSink {
        fn send(&mut self, frame: &RawFrame) -> SendOutcome {
            self.0.lock().unwrap().push(frame.timestamp_ticks);
            SendOutcome::Sent
        }
    }

    fn frame(ts: u64) -> RawFrame {
        RawFrame::new(ts, Resolution::new(1, 1, 1), FramePayload::Vlc(vec![0]))
    }

    fn dispatcher(min_delta: u64) -> (Dispatcher, Arc<FrameSlot>, Arc<RequestGate>, Arc<Mutex<Vec<u64>>>) {
        let slot = Arc::new(FrameSlot::new());
        let gate = Arc::new(RequestGate::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            SensorRole::RightFront,
            slot.clone(),
            gate.clone(),
            min_delta,
            Box::new(RecordingSink(sent.clone())),
            Arc::new(PipelineCounters::default()),
        );
        (dispatcher, slot, gate, sent)
    }

    #[test]
    fn filter_rejects_duplicates_and_close_frames() {
        let mut filter = TimestampFilter::new(100);
        assert_eq!(filter.admit(1_000), FilterVerdict::Fresh);
        assert_eq!(filter.admit(1_000), FilterVerdict::Duplicate);
        assert_eq!(filter.admit(1_099), FilterVerdict::TooSoon);
        assert_eq!(filter.last_sent(), Some(1_000));
        assert_eq!(filter.admit(1_100), FilterVerdict::Fresh);
        assert_eq!(filter.admit(900), FilterVerdict::OutOfOrder);
        assert_eq!(filter.last_sent(), Some(1_100));
    }

    #[test]
    fn zero_min_delta_only_dedups() {
        let mut filter = TimestampFilter::default();
        assert_eq!(filter.admit(5), FilterVerdict::Fresh);
        assert_eq!(filter.admit(6), FilterVerdict::Fresh);
        assert_eq!(filter.admit(6), FilterVerdict::Duplicate);
    }

    #[test]
    fn nothing_sent_without_request() {
        let (mut d, slot, _gate, sent) = dispatcher(0);
        slot.publish(frame(1));
        assert_eq!(d.tick(), DispatchOutcome::Idle);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn request_on_empty_slot_is_consumed() {
        let (mut d, _slot, gate, _sent) = dispatcher(0);
        gate.set();
        assert_eq!(d.tick(), DispatchOutcome::Empty);
        assert!(!gate.is_set());
    }

    #[test]
    fn back_to_back_requests_send_frame_once() {
        let (mut d, slot, gate, sent) = dispatcher(0);
        slot.publish(frame(10));

        gate.set();
        assert_eq!(d.tick(), DispatchOutcome::Attempted(SendOutcome::Sent));
        gate.set();
        assert_eq!(
            d.tick(),
            DispatchOutcome::Filtered(FilterVerdict::Duplicate)
        );
        assert!(!gate.is_set());
        assert_eq!(d.filter().last_sent(), Some(10));
        assert_eq!(*sent.lock().unwrap(), vec![10]);
    }

    #[test]
    fn throttled_frame_leaves_last_sent_unchanged() {
        let (mut d, slot, gate, sent) = dispatcher(50);
        slot.publish(frame(100));
        gate.set();
        d.tick();

        slot.publish(frame(120));
        gate.set();
        assert_eq!(d.tick(), DispatchOutcome::Filtered(FilterVerdict::TooSoon));
        assert!(!gate.is_set());
        assert_eq!(d.filter().last_sent(), Some(100));

        slot.publish(frame(150));
        gate.set();
        assert_eq!(d.tick(), DispatchOutcome::Attempted(SendOutcome::Sent));
        assert_eq!(*sent.lock().unwrap(), vec![100, 150]);
    }

    #[test]
    fn sent_timestamps_strictly_increase() {
        let (mut d, slot, gate, sent) = dispatcher(0);
        for ts in [3, 3, 4, 4, 4, 9, 12, 12] {
            slot.publish(frame(ts));
            gate.set();
            d.tick();
        }
        let sent = sent.lock().unwrap();
        assert_eq!(*sent, vec![3, 4, 9, 12]);
        assert!(sent.windows(2).all(|w| w[0] < w[1]));
    }
}
