//! Pull-based flow control: UDP "send next frame" requests.

use anyhow::{Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::wire::REQUEST_TOKEN;

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Latch set by a request datagram and consumed by the dispatch thread.
#[derive(Debug, Default)]
pub struct RequestGate {
    requested: AtomicBool,
    received: AtomicU64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Test-and-clear. Only one caller observes each request.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn requests_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// UDP listener feeding one `RequestGate`.
pub struct RequestListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RequestListener {
    pub fn bind(addr: SocketAddr, gate: Arc<RequestGate>, label: &str) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("{}: bind udp {}", label, addr))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = socket.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let join = {
            let shutdown = shutdown.clone();
            let label = label.to_string();
            std::thread::Builder::new()
                .name(format!("{}-requests", label))
                .spawn(move || run_listener(socket, &gate, &shutdown, &label))
                .context("spawn request listener thread")?
        };

        log::info!("{}: listening for frame requests on udp {}", label, local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("request listener on {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for RequestListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_listener(socket: UdpSocket, gate: &RequestGate, shutdown: &AtomicBool, label: &str) {
    let mut buf = [0u8; 64];
    while !shutdown.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if &buf[..len] == REQUEST_TOKEN {
                    log::trace!("{}: frame requested by {}", label, peer);
                    gate.set();
                } else {
                    log::debug!(
                        "{}: ignoring datagram from {}: {}",
                        label,
                        peer,
                        hex::encode(&buf[..len])
                    );
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                log::debug!("{}: request socket error: {}", label, err);
                std::thread::sleep(RECV_TIMEOUT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn take_clears_the_latch() {
        let gate = RequestGate::new();
        assert!(!gate.take());
        gate.set();
        gate.set();
        assert!(gate.take());
        assert!(!gate.take());
        assert_eq!(gate.requests_received(), 2);
    }

    #[test]
    fn token_datagram_sets_gate() {
        let gate = Arc::new(RequestGate::new());
        let listener =
            RequestListener::bind("127.0.0.1:0".parse().unwrap(), gate.clone(), "test").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();

        client.send_to(b"hello", listener.local_addr()).unwrap();
        client.send_to(b"1", listener.local_addr()).unwrap();
        client.send_to(REQUEST_TOKEN, listener.local_addr()).unwrap();

        assert!(wait_for(|| gate.is_set()));
        // Only the exact token counts.
        assert_eq!(gate.requests_received(), 1);
    }
}
