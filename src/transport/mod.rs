//! Network plumbing for the sensor pipelines.
//!
//! Each sensor gets a TCP `FrameServer` (outbound frames, one client at a
//! time) and a UDP `RequestListener` (inbound "send next frame" datagrams
//! latched into a `RequestGate`).

mod request;
mod server;

pub use request::{RequestGate, RequestListener};
pub use server::{FrameLink, FrameServer};
