//! Per-sensor acquisition and dispatch pipelines.
//!
//! Every sensor runs two long-lived threads sharing a `FrameSlot`:
//!
//! ```text
//! sensor stream -> AcquisitionLoop -> FrameSlot -> Dispatcher -> FrameSink
//!                                                      ^
//!                                  RequestListener -> RequestGate
//! ```
//!
//! `SensorProcessor` owns both threads plus the sensor's network endpoints and
//! starts or stops them as a unit.

mod acquisition;
mod dispatch;
mod processor;

pub use acquisition::{AcquisitionLoop, AcquisitionState, StateCell};
pub use dispatch::{DispatchOutcome, Dispatcher, FilterVerdict, TimestampFilter};
pub use processor::{ProcessorConfig, SensorProcessor, SinkFactory};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::SensorRole;
use crate::sink::SendOutcome;

/// Counters shared by one sensor's threads.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    acquired: AtomicU64,
    read_failures: AtomicU64,
    sent: AtomicU64,
    duplicate: AtomicU64,
    too_soon: AtomicU64,
    no_client: AtomicU64,
    busy: AtomicU64,
    no_pose: AtomicU64,
    encode_failures: AtomicU64,
}

impl PipelineCounters {
    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self, verdict: FilterVerdict) {
        match verdict {
            FilterVerdict::Fresh => {}
            FilterVerdict::Duplicate => {
                self.duplicate.fetch_add(1, Ordering::Relaxed);
            }
            FilterVerdict::TooSoon | FilterVerdict::OutOfOrder => {
                self.too_soon.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_send(&self, outcome: SendOutcome) {
        let counter = match outcome {
            SendOutcome::Sent => &self.sent,
            SendOutcome::NotConnected => &self.no_client,
            SendOutcome::Busy => &self.busy,
            SendOutcome::PoseUnavailable => &self.no_pose,
            SendOutcome::EncodeFailed => &self.encode_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            acquired: get(&self.acquired),
            read_failures: get(&self.read_failures),
            sent: get(&self.sent),
            dropped_duplicate: get(&self.duplicate),
            dropped_too_soon: get(&self.too_soon),
            dropped_no_client: get(&self.no_client),
            dropped_busy: get(&self.busy),
            dropped_no_pose: get(&self.no_pose),
            encode_failures: get(&self.encode_failures),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub acquired: u64,
    pub read_failures: u64,
    pub sent: u64,
    pub dropped_duplicate: u64,
    pub dropped_too_soon: u64,
    pub dropped_no_client: u64,
    pub dropped_busy: u64,
    pub dropped_no_pose: u64,
    pub encode_failures: u64,
}

impl CounterSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_duplicate
            + self.dropped_too_soon
            + self.dropped_no_client
            + self.dropped_busy
            + self.dropped_no_pose
            + self.encode_failures
    }
}

/// Point-in-time view of one processor.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessorStats {
    pub role: SensorRole,
    pub state: AcquisitionState,
    pub running: bool,
    pub client_connected: bool,
    /// Bytes delivered to clients since the server was bound.
    pub bytes_written: u64,
    pub requests_received: u64,
    pub counters: CounterSnapshot,
}
