//! Client side of the streaming protocol.
//!
//! Connects to one sensor's frame server, pulls frames with request
//! datagrams, and splits payloads back into planes.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use crate::frame::SensorRole;
use crate::wire::{read_message, HeaderKind, WireError, WireHeader, REQUEST_TOKEN};

/// Byte order of 16-bit depth samples on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOrder {
    HighByteFirst,
    LowByteFirst,
}

impl SampleOrder {
    pub fn for_role(role: SensorRole) -> Option<Self> {
        match role {
            SensorRole::DepthAhat => Some(SampleOrder::HighByteFirst),
            SensorRole::DepthLongThrow => Some(SampleOrder::LowByteFirst),
            _ => None,
        }
    }

    fn decode(self, pair: &[u8]) -> u16 {
        let bytes = [pair[0], pair[1]];
        match self {
            SampleOrder::HighByteFirst => u16::from_be_bytes(bytes),
            SampleOrder::LowByteFirst => u16::from_le_bytes(bytes),
        }
    }
}

fn header_kind(role: SensorRole) -> HeaderKind {
    match role {
        SensorRole::ColorVideo => HeaderKind::ColorVideo,
        _ => HeaderKind::ResearchMode,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedFrame {
    pub role: SensorRole,
    pub header: WireHeader,
    pub payload: Vec<u8>,
}

/// Depth plane followed by active brightness.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthPlanes {
    pub depth: Vec<u16>,
    pub active_brightness: Vec<u16>,
}

impl ReceivedFrame {
    pub fn depth_planes(&self, order: SampleOrder) -> Result<DepthPlanes> {
        let samples = self.header.width as usize * self.header.height as usize;
        if self.payload.len() != samples * 4 {
            return Err(anyhow!(
                "depth payload is {} bytes, expected {} for {}x{}",
                self.payload.len(),
                samples * 4,
                self.header.width,
                self.header.height
            ));
        }
        let (depth, ab) = self.payload.split_at(samples * 2);
        Ok(DepthPlanes {
            depth: depth.chunks_exact(2).map(|p| order.decode(p)).collect(),
            active_brightness: ab.chunks_exact(2).map(|p| order.decode(p)).collect(),
        })
    }
}

pub struct FrameReceiver {
    role: SensorRole,
    stream: TcpStream,
    requests: UdpSocket,
    request_addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl FrameReceiver {
    pub fn connect(
        role: SensorRole,
        stream_addr: SocketAddr,
        request_addr: SocketAddr,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(stream_addr)
            .with_context(|| format!("connect to {} frame server at {}", role, stream_addr))?;
        stream.set_read_timeout(read_timeout)?;
        let local: SocketAddr = if request_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let requests = UdpSocket::bind(local).context("bind request socket")?;
        log::info!("{}: connected to {}", role, stream_addr);
        Ok(Self {
            role,
            stream,
            requests,
            request_addr,
            read_timeout,
        })
    }

    pub fn role(&self) -> SensorRole {
        self.role
    }

    /// Ask the streamer for one more frame.
    pub fn request_next(&self) -> Result<()> {
        self.requests
            .send_to(REQUEST_TOKEN, self.request_addr)
            .with_context(|| format!("send frame request to {}", self.request_addr))?;
        Ok(())
    }

    /// Block until one complete frame has been read.
    pub fn read_frame(&mut self) -> Result<ReceivedFrame, WireError> {
        let message = read_message(&mut self.stream, header_kind(self.role))?;
        Ok(ReceivedFrame {
            role: self.role,
            header: message.header,
            payload: message.payload,
        })
    }

    /// Request frames until one arrives, re-requesting every `retry_interval`
    /// up to `attempts` times.
    pub fn fetch(&mut self, retry_interval: Duration, attempts: u32) -> Result<ReceivedFrame> {
        for _ in 0..attempts {
            self.request_next()?;
            if self.wait_readable(retry_interval)? {
                return Ok(self.read_frame()?);
            }
        }
        Err(anyhow!(
            "{}: no frame after {} requests",
            self.role,
            attempts
        ))
    }

    // Peeks so a timeout never splits a message.
    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let ready = match self.stream.peek(&mut probe) {
            Ok(0) => Err(anyhow!("{}: server closed the connection", self.role)),
            Ok(_) => Ok(true),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        };
        self.stream.set_read_timeout(self.read_timeout)?;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Pose4x4;

    fn depth_frame(role: SensorRole, payload: Vec<u8>) -> ReceivedFrame {
        ReceivedFrame {
            role,
            header: WireHeader {
                absolute_timestamp: 1,
                width: 2,
                height: 1,
                bytes_per_pixel: 2,
                row_stride: 4,
                payload_byte_length: payload.len() as i32,
                focal_length: None,
                pose: Pose4x4::identity(),
            },
            payload,
        }
    }

    #[test]
    fn splits_planes_with_family_byte_order() {
        let payload = vec![0x01, 0x02, 0x03, 0x04, 0x00, 0x10, 0x00, 0x20];
        let ahat = depth_frame(SensorRole::DepthAhat, payload.clone());
        let planes = ahat
            .depth_planes(SampleOrder::for_role(SensorRole::DepthAhat).unwrap())
            .unwrap();
        assert_eq!(planes.depth, vec![0x0102, 0x0304]);
        assert_eq!(planes.active_brightness, vec![0x0010, 0x0020]);

        let lt = depth_frame(SensorRole::DepthLongThrow, payload);
        let planes = lt.depth_planes(SampleOrder::LowByteFirst).unwrap();
        assert_eq!(planes.depth, vec![0x0201, 0x0403]);
    }

    #[test]
    fn short_depth_payload_is_rejected() {
        let frame = depth_frame(SensorRole::DepthAhat, vec![0; 6]);
        assert!(frame.depth_planes(SampleOrder::HighByteFirst).is_err());
    }

    #[test]
    fn vlc_has_no_sample_order() {
        assert_eq!(SampleOrder::for_role(SensorRole::LeftFront), None);
    }
}
