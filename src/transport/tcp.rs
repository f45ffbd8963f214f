use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::udp::{is_timeout, resolve};
use super::{
    dispatch, Notification, NotificationHandler, Subscription, Transport, MAX_DATAGRAM,
    RECV_POLL_INTERVAL,
};
use crate::clock::Clock;
use crate::config::TcpConfig;
use crate::error::TransportError;
use crate::wire::{self, Message, WireError, HEADER_SIZE};

/// How often an idle listener is polled for the returning stream.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// TCP transport: one outgoing stream to `peer`, one returning stream
/// accepted on `listen`.
///
/// Messages keep the datagram layout and are framed by the header's length
/// field.
pub struct TcpTransport {
    sender: Mutex<TcpStream>,
    listener: TcpListener,
    clock: Clock,
}

impl TcpTransport {
    /// Bind the local listener, then connect to the peer.
    pub fn open(cfg: &TcpConfig, clock: Clock) -> Result<Self, TransportError> {
        let peer = resolve(&cfg.peer)?;

        let bind_err = |source| TransportError::Bind {
            endpoint: cfg.listen.clone(),
            source,
        };
        let listener = TcpListener::bind(&cfg.listen).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        let connect_err = |source| TransportError::Connect {
            endpoint: peer.to_string(),
            source,
        };
        let sender = TcpStream::connect(peer).map_err(connect_err)?;
        sender.set_nodelay(true).map_err(connect_err)?;

        let transport = Self {
            sender: Mutex::new(sender),
            listener,
            clock,
        };
        match transport.local_addr() {
            Ok(local) => debug!(listen = %local, peer = %peer, "tcp stream connected"),
            Err(e) => {
                debug!(listen = %cfg.listen, peer = %peer, error = %e, "tcp stream connected")
            }
        }

        Ok(transport)
    }

    /// Local address the returning stream is accepted on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let data = message.encode().map_err(|e| TransportError::Send {
            id: message.id,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        self.sender
            .lock()
            .write_all(&data)
            .map_err(|source| TransportError::Send {
                id: message.id,
                source,
            })
    }

    fn subscribe(&self, handler: NotificationHandler) -> Result<Subscription, TransportError> {
        let endpoint = || {
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp listener".to_string())
        };
        let listener = self
            .listener
            .try_clone()
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint(),
                source,
            })?;

        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let clock = self.clock;

        let thread = std::thread::Builder::new()
            .name("streamprobe-tcp-rx".into())
            .spawn(move || {
                let mut stream: Option<FrameReader> = None;

                while !thread_cancel.is_cancelled() {
                    let Some(reader) = stream.as_mut() else {
                        match accept(&listener) {
                            Ok(reader) => stream = Some(reader),
                            Err(e) if is_timeout(&e) => std::thread::sleep(ACCEPT_POLL_INTERVAL),
                            Err(e) => {
                                warn!(error = %e, "tcp accept failed");
                                handler(Notification::ReceiveFailed);
                                std::thread::sleep(RECV_POLL_INTERVAL);
                            }
                        }
                        continue;
                    };

                    match reader.read_frames(&handler, &clock) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("returning tcp stream closed");
                            stream = None;
                        }
                        Err(e) if is_timeout(&e) => {}
                        Err(e) => {
                            warn!(error = %e, "tcp receive failed");
                            handler(Notification::ReceiveFailed);
                            stream = None;
                        }
                    }
                }

                debug!("tcp receive thread stopped");
            })
            .map_err(TransportError::Spawn)?;

        Ok(Subscription::new(cancel, thread))
    }
}

fn accept(listener: &TcpListener) -> io::Result<FrameReader> {
    let (stream, from) = listener.accept()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    debug!(from = %from, "accepted returning tcp stream");
    Ok(FrameReader::new(stream))
}

/// Splits a byte stream back into messages.
struct FrameReader {
    stream: TcpStream,
    chunk: Vec<u8>,
    pending: Vec<u8>,
}

impl FrameReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            chunk: vec![0u8; MAX_DATAGRAM],
            pending: Vec::with_capacity(MAX_DATAGRAM),
        }
    }

    /// Read once and dispatch every message the read completed. All of them
    /// carry the time the read returned.
    ///
    /// Returns `Ok(false)` when the stream is finished: closed by the peer,
    /// or framing was lost to an oversized length.
    fn read_frames(&mut self, handler: &NotificationHandler, clock: &Clock) -> io::Result<bool> {
        let n = self.stream.read(&mut self.chunk)?;
        if n == 0 {
            return Ok(false);
        }
        let received_ns = clock.now_ns();
        self.pending.extend_from_slice(&self.chunk[..n]);

        let mut consumed = 0;
        while let Some(len) = wire::frame_len(&self.pending[consumed..]) {
            if len > MAX_DATAGRAM {
                warn!(len, "tcp frame exceeds limit, dropping stream");
                handler(Notification::Undecodable {
                    received_ns,
                    error: WireError::PayloadTooLarge {
                        size: len - HEADER_SIZE,
                    },
                });
                return Ok(false);
            }
            if self.pending.len() - consumed < len {
                break;
            }

            dispatch(handler, received_ns, &self.pending[consumed..consumed + len]);
            consumed += len;
        }

        self.pending.drain(..consumed);
        Ok(true)
    }
}
