//! Sensor Streamer
//!
//! Streams frames from a head-mounted sensor rig (two depth modes, two front
//! grayscale cameras, a color camera) to a remote consumer over per-sensor
//! TCP connections, one frame per UDP request.
//!
//! # Architecture
//!
//! Each sensor runs an independent pipeline:
//!
//! 1. **Consent first**: the acquisition thread waits for its own consent
//!    ticket before any hardware stream is opened.
//! 2. **Latest frame only**: acquisition publishes into a `FrameSlot` that
//!    holds one frame; nothing is ever queued.
//! 3. **Pull, don't push**: a frame is sent only after the client asks for
//!    it, and never twice.
//! 4. **One write in flight**: a sink drops frames rather than queue behind
//!    a slow connection.
//!
//! # Module Structure
//!
//! - `frame`: sensor roles, raw frames, poses, the latest-frame slot
//! - `sensor`: backend boundary and the synthetic `stub://` backend
//! - `consent`: per-request consent tickets
//! - `sink`: per-family payload encoders and the wire sink
//! - `transport`: TCP frame server, UDP request listener
//! - `pipeline`: acquisition, dispatch and the per-sensor processor
//! - `orchestrator`: composition and start/stop for the whole rig
//! - `wire`, `receiver`: protocol framing and the client side

pub mod clock;
pub mod config;
pub mod consent;
pub mod frame;
pub mod orchestrator;
pub mod pipeline;
pub mod receiver;
pub mod sensor;
pub mod sink;
pub mod transport;
pub mod wire;

pub use clock::TickConverter;
pub use config::{DepthMode, StreamerConfig};
pub use consent::{ConsentKind, ConsentProvider, ConsentState, ConsentTicket, ScriptedConsent};
pub use frame::{
    FramePayload, FrameSlot, Pose4x4, RawFrame, Resolution, SensorDescriptor, SensorRole,
};
pub use orchestrator::{SensorEndpoint, StreamOrchestrator};
pub use pipeline::{AcquisitionState, ProcessorStats};
pub use receiver::{FrameReceiver, ReceivedFrame, SampleOrder};
pub use sensor::{backend_from_url, SensorBackend, SyntheticConfig};
pub use sink::{FrameSink, SendOutcome};
pub use wire::{HeaderKind, WireHeader, WireMessage};
