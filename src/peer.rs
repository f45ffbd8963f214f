//! Echo peer for socket transports.
//!
//! Receives on the endpoint the benchmark sends to and forwards every message
//! unchanged to the endpoint the benchmark listens on.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
#[cfg(unix)]
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{TransportConfig, TransportKind};
use crate::transport::tcp::ACCEPT_POLL_INTERVAL;
use crate::transport::udp::{is_timeout, resolve};
use crate::transport::{MAX_DATAGRAM, RECV_POLL_INTERVAL};

/// Counts from an echo session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStats {
    /// Datagrams forwarded, or stream reads for tcp.
    pub forwarded: u64,
    pub failed: u64,
    pub receive_errors: u64,
}

/// One receive-and-forward hop.
trait EchoSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn forward(&self, data: &[u8]) -> io::Result<()>;
}

enum PeerSocket {
    Udp {
        socket: UdpSocket,
        target: SocketAddr,
    },
    Tcp(TcpRelay),
    #[cfg(unix)]
    Uds {
        socket: UnixDatagram,
        bound: PathBuf,
        target: PathBuf,
    },
}

/// Relays the benchmark's outgoing stream into a stream back to it.
///
/// One inbound stream is served at a time. The return stream is connected on
/// first use and dropped with the inbound stream.
struct TcpRelay {
    listener: TcpListener,
    target: SocketAddr,
    inbound: Mutex<Option<TcpStream>>,
    outbound: Mutex<Option<TcpStream>>,
}

/// Reflects benchmark traffic back to its sender.
pub struct EchoPeer {
    socket: PeerSocket,
}

impl EchoPeer {
    /// Bind the endpoints mirrored from the benchmark's transport config.
    pub fn open(cfg: &TransportConfig) -> Result<Self> {
        cfg.validate()?;

        let socket = match cfg.kind {
            TransportKind::Loopback => {
                bail!("echo peer needs a socket transport; loopback echoes in-process")
            }
            TransportKind::Udp => {
                let target = resolve(&cfg.udp.listen)?;
                let socket = UdpSocket::bind(&cfg.udp.peer)
                    .with_context(|| format!("binding echo socket on {}", cfg.udp.peer))?;
                socket
                    .set_read_timeout(Some(RECV_POLL_INTERVAL))
                    .context("setting echo socket read timeout")?;
                PeerSocket::Udp { socket, target }
            }
            TransportKind::Tcp => {
                let target = resolve(&cfg.tcp.listen)?;
                let listener = TcpListener::bind(&cfg.tcp.peer)
                    .with_context(|| format!("binding echo listener on {}", cfg.tcp.peer))?;
                listener
                    .set_nonblocking(true)
                    .context("setting echo listener non-blocking")?;
                PeerSocket::Tcp(TcpRelay {
                    listener,
                    target,
                    inbound: Mutex::new(None),
                    outbound: Mutex::new(None),
                })
            }
            #[cfg(unix)]
            TransportKind::Uds => {
                let bound = PathBuf::from(&cfg.uds.send_path);
                match std::fs::remove_file(&bound) {
                    Ok(()) => debug!(path = %bound.display(), "removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("removing stale {}", bound.display()))
                    }
                }
                let socket = UnixDatagram::bind(&bound)
                    .with_context(|| format!("binding echo socket on {}", bound.display()))?;
                socket
                    .set_read_timeout(Some(RECV_POLL_INTERVAL))
                    .context("setting echo socket read timeout")?;
                PeerSocket::Uds {
                    socket,
                    bound,
                    target: PathBuf::from(&cfg.uds.recv_path),
                }
            }
            #[cfg(not(unix))]
            TransportKind::Uds => {
                return Err(crate::error::ConfigError::UnsupportedTransport { kind: "uds" }.into())
            }
        };

        Ok(Self { socket })
    }

    /// Address the echo endpoint is bound to, for network peers.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            PeerSocket::Udp { socket, .. } => socket.local_addr().ok(),
            PeerSocket::Tcp(relay) => relay.listener.local_addr().ok(),
            #[cfg(unix)]
            PeerSocket::Uds { .. } => None,
        }
    }

    /// Forward messages until `cancel` fires. Blocks the calling thread.
    pub fn run(&self, cancel: &CancellationToken) -> EchoStats {
        info!(endpoint = %self.describe(), "echo peer started");

        let stats = echo_loop(&self.socket, cancel);

        info!(
            forwarded = stats.forwarded,
            failed = stats.failed,
            receive_errors = stats.receive_errors,
            "echo peer stopped"
        );

        stats
    }

    fn describe(&self) -> String {
        let local = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        match &self.socket {
            PeerSocket::Udp { target, .. } => format!("udp {local} -> {target}"),
            PeerSocket::Tcp(relay) => format!("tcp {local} -> {}", relay.target),
            #[cfg(unix)]
            PeerSocket::Uds { bound, target, .. } => {
                format!("uds {} -> {}", bound.display(), target.display())
            }
        }
    }
}

fn echo_loop(socket: &impl EchoSocket, cancel: &CancellationToken) -> EchoStats {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut stats = EchoStats::default();

    while !cancel.is_cancelled() {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                warn!(error = %e, "echo receive failed");
                stats.receive_errors += 1;
                std::thread::sleep(RECV_POLL_INTERVAL);
                continue;
            }
        };

        match socket.forward(&buf[..n]) {
            Ok(()) => stats.forwarded += 1,
            Err(e) => {
                // The benchmark may not be listening yet; keep going.
                debug!(error = %e, "echo forward failed");
                stats.failed += 1;
            }
        }
    }

    stats
}

impl EchoSocket for PeerSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerSocket::Udp { socket, .. } => socket.recv_from(buf).map(|(n, _)| n),
            PeerSocket::Tcp(relay) => relay.recv(buf),
            #[cfg(unix)]
            PeerSocket::Uds { socket, .. } => socket.recv(buf),
        }
    }

    fn forward(&self, data: &[u8]) -> io::Result<()> {
        match self {
            PeerSocket::Udp { socket, target } => socket.send_to(data, target).map(|_| ()),
            PeerSocket::Tcp(relay) => relay.forward(data),
            #[cfg(unix)]
            PeerSocket::Uds { socket, target, .. } => socket.send_to(data, target).map(|_| ()),
        }
    }
}

impl EchoSocket for TcpRelay {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock();
        if inbound.is_none() {
            *inbound = Some(self.accept()?);
        }
        let result = match inbound.as_mut() {
            Some(stream) => stream.read(buf),
            None => return Err(io::ErrorKind::WouldBlock.into()),
        };
        match result {
            Ok(0) => {
                debug!("inbound tcp stream closed");
                *inbound = None;
                *self.outbound.lock() = None;
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) if !is_timeout(&e) => {
                *inbound = None;
                Err(e)
            }
            other => other,
        }
    }

    fn forward(&self, data: &[u8]) -> io::Result<()> {
        let mut outbound = self.outbound.lock();
        if outbound.is_none() {
            let stream = TcpStream::connect(self.target)?;
            stream.set_nodelay(true)?;
            *outbound = Some(stream);
        }
        let result = match outbound.as_mut() {
            Some(stream) => stream.write_all(data),
            None => return Err(io::ErrorKind::NotConnected.into()),
        };
        if result.is_err() {
            *outbound = None;
        }
        result
    }
}

impl TcpRelay {
    fn accept(&self) -> io::Result<TcpStream> {
        let (stream, from) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if is_timeout(&e) {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                return Err(e);
            }
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        debug!(from = %from, "echo peer accepted tcp stream");
        Ok(stream)
    }
}

impl Drop for EchoPeer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let PeerSocket::Uds { bound, .. } = &self.socket {
                let _ = std::fs::remove_file(bound);
            }
        }
    }
}
