//! Per-sensor TCP frame server.
//!
//! One listener per sink. The accept thread holds at most one client; a new
//! connection replaces the current one. A writer thread owns the outbound
//! bytes: the sink hands it one message at a time through `FrameLink` and
//! returns immediately. While a message is in flight further messages are
//! refused, so each connection has at most one outstanding write.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sink::{LinkState, MessageWriter};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const WRITER_POLL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    generation: u64,
    peer: SocketAddr,
    stream: TcpStream,
}

struct Outbound {
    generation: u64,
    bytes: Vec<u8>,
}

struct LinkShared {
    label: String,
    client: Mutex<Option<Client>>,
    in_flight: AtomicBool,
    next_generation: AtomicU64,
    bytes_written: AtomicU64,
}

impl LinkShared {
    fn current_generation(&self) -> Option<u64> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.generation)
    }

    fn drop_client(&self, generation: u64, reason: &str) {
        let mut guard = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().map(|c| c.generation) == Some(generation) {
            if let Some(client) = guard.take() {
                log::warn!(
                    "{}: client {} disconnected ({})",
                    self.label,
                    client.peer,
                    reason
                );
                let _ = client.stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Sink-side handle onto a server's current connection.
#[derive(Clone)]
pub struct FrameLink {
    shared: Arc<LinkShared>,
    tx: Sender<Outbound>,
}

impl FrameLink {
    pub fn is_connected(&self) -> bool {
        self.shared.current_generation().is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }
}

impl MessageWriter for FrameLink {
    fn state(&self) -> LinkState {
        if !self.is_connected() {
            LinkState::Disconnected
        } else if self.shared.in_flight.load(Ordering::SeqCst) {
            LinkState::Busy
        } else {
            LinkState::Idle
        }
    }

    fn try_write(&self, message: Vec<u8>) -> LinkState {
        let Some(generation) = self.shared.current_generation() else {
            return LinkState::Disconnected;
        };
        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            return LinkState::Busy;
        }
        let outbound = Outbound {
            generation,
            bytes: message,
        };
        if self.tx.send(outbound).is_err() {
            self.shared.in_flight.store(false, Ordering::SeqCst);
            return LinkState::Disconnected;
        }
        LinkState::Idle
    }
}

pub struct FrameServer {
    local_addr: SocketAddr,
    link: FrameLink,
    shutdown: Arc<AtomicBool>,
    accept_join: Option<JoinHandle<()>>,
    writer_join: Option<JoinHandle<()>>,
}

impl FrameServer {
    pub fn bind(addr: SocketAddr, label: &str) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("{}: bind tcp {}", label, addr))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(LinkShared {
            label: label.to_string(),
            client: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            bytes_written: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_join = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("{}-accept", label))
                .spawn(move || {
                    if let Err(err) = run_accept(listener, &shared, &shutdown) {
                        log::error!("{}: frame server stopped: {}", shared.label, err);
                    }
                })
                .context("spawn accept thread")?
        };

        let writer_spawn = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("{}-writer", label))
                .spawn(move || run_writer(rx, &shared, &shutdown))
        };
        let writer_join = match writer_spawn {
            Ok(join) => join,
            Err(err) => {
                shutdown.store(true, Ordering::SeqCst);
                let _ = accept_join.join();
                return Err(anyhow!("{}: spawn writer thread: {}", label, err));
            }
        };

        log::info!("{}: frame server listening on tcp {}", label, local_addr);
        Ok(Self {
            local_addr,
            link: FrameLink { shared, tx },
            shutdown,
            accept_join: Some(accept_join),
            writer_join: Some(writer_join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn link(&self) -> FrameLink {
        self.link.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Stop both threads and close the client connection.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in [self.accept_join.take(), self.writer_join.take()]
            .into_iter()
            .flatten()
        {
            if join.join().is_err() {
                log::error!("{}: server thread panicked", self.link.shared.label);
            }
        }
        if let Some(client) = self
            .link
            .shared
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FrameServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept(listener: TcpListener, shared: &LinkShared, shutdown: &AtomicBool) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                let generation = shared.next_generation.fetch_add(1, Ordering::SeqCst);
                let previous = shared
                    .client
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(Client {
                        generation,
                        peer,
                        stream,
                    });
                match previous {
                    Some(old) => {
                        log::info!(
                            "{}: client {} replaces {}",
                            shared.label,
                            peer,
                            old.peer
                        );
                        let _ = old.stream.shutdown(Shutdown::Both);
                    }
                    None => log::info!("{}: client {} connected", shared.label, peer),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn run_writer(rx: Receiver<Outbound>, shared: &LinkShared, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let outbound = match rx.recv_timeout(WRITER_POLL) {
            Ok(outbound) => outbound,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        write_one(shared, outbound);
        shared.in_flight.store(false, Ordering::SeqCst);
    }
}

fn write_one(shared: &LinkShared, outbound: Outbound) {
    let stream = {
        let guard = shared.client.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(client) if client.generation == outbound.generation => {
                client.stream.try_clone()
            }
            // The connection this message was meant for is gone.
            _ => return,
        }
    };
    let result = stream.and_then(|mut stream| {
        stream.write_all(&outbound.bytes)?;
        stream.flush()
    });
    match result {
        Ok(()) => {
            shared
                .bytes_written
                .fetch_add(outbound.bytes.len() as u64, Ordering::Relaxed);
        }
        Err(err) => shared.drop_client(outbound.generation, &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn write_without_client_reports_disconnected() {
        let server = FrameServer::bind(loopback(), "test").unwrap();
        let link = server.link();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.try_write(vec![1, 2, 3]), LinkState::Disconnected);
    }

    #[test]
    fn delivers_message_to_client() {
        let server = FrameServer::bind(loopback(), "test").unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        let link = server.link();
        assert!(wait_for(|| link.is_connected()));

        assert_eq!(link.try_write(vec![7, 8, 9]), LinkState::Idle);
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7, 8, 9]);
        assert!(wait_for(|| link.state() == LinkState::Idle));
    }

    #[test]
    fn second_client_replaces_first() {
        let server = FrameServer::bind(loopback(), "test").unwrap();
        let link = server.link();
        let mut first = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| link.is_connected()));
        let first_generation = link.shared.current_generation();

        let mut second = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| link.shared.current_generation() != first_generation));

        assert_eq!(link.try_write(vec![42]), LinkState::Idle);
        let mut buf = [0u8; 1];
        second.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [42]);

        // The replaced client sees its connection closed.
        let mut rest = Vec::new();
        first
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(first.read_to_end(&mut rest).unwrap_or(0), 0);
    }

    #[test]
    fn reset_peer_is_dropped_and_next_client_served() {
        let server = FrameServer::bind(loopback(), "test").unwrap();
        let link = server.link();
        let first = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| link.is_connected()));
        drop(first);

        // Writes into the closed peer fail once the reset comes back.
        let chunk = vec![0u8; 100 * 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        while link.state() != LinkState::Disconnected {
            assert!(Instant::now() < deadline, "reset peer never dropped");
            link.try_write(chunk.clone());
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_connected());

        let mut second = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| link.is_connected()));
        assert!(wait_for(|| link.state() == LinkState::Idle));
        assert_eq!(link.try_write(vec![5, 6]), LinkState::Idle);
        let mut buf = [0u8; 2];
        second.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [5, 6]);
    }

    #[test]
    fn bytes_written_counts_delivered_messages() {
        let server = FrameServer::bind(loopback(), "test").unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        let link = server.link();
        assert!(wait_for(|| link.is_connected()));
        assert_eq!(link.bytes_written(), 0);

        assert_eq!(link.try_write(vec![1; 16]), LinkState::Idle);
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).unwrap();
        assert!(wait_for(|| link.bytes_written() == 16));
    }

    #[test]
    fn shutdown_closes_client() {
        let mut server = FrameServer::bind(loopback(), "test").unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        assert!(wait_for(|| server.is_connected()));
        server.shutdown();
        assert!(!server.is_connected());
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap_or(0), 0);
    }
}
