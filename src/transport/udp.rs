use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    dispatch, Notification, NotificationHandler, Subscription, Transport, MAX_DATAGRAM,
    RECV_POLL_INTERVAL,
};
use crate::clock::Clock;
use crate::config::UdpConfig;
use crate::error::TransportError;
use crate::wire::Message;

/// UDP transport: one socket bound on `listen`, sending to `peer`.
///
/// The socket is left unconnected so ICMP errors from a peer that is not up
/// yet surface as loss instead of aborting the run.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    clock: Clock,
}

impl UdpTransport {
    /// Bind the local endpoint and resolve the peer.
    pub fn open(cfg: &UdpConfig, clock: Clock) -> Result<Self, TransportError> {
        let peer = resolve(&cfg.peer)?;

        let socket = UdpSocket::bind(&cfg.listen).map_err(|source| TransportError::Bind {
            endpoint: cfg.listen.clone(),
            source,
        })?;

        let transport = Self {
            socket,
            peer,
            clock,
        };
        match transport.local_addr() {
            Ok(local) => debug!(listen = %local, peer = %peer, "udp socket bound"),
            Err(e) => debug!(listen = %cfg.listen, peer = %peer, error = %e, "udp socket bound"),
        }

        Ok(transport)
    }

    /// Local address arrivals are received on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let data = message.encode().map_err(|e| TransportError::Send {
            id: message.id,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let written = self
            .socket
            .send_to(&data, self.peer)
            .map_err(|source| TransportError::Send {
                id: message.id,
                source,
            })?;

        if written != data.len() {
            return Err(TransportError::ShortSend {
                id: message.id,
                written,
                expected: data.len(),
            });
        }

        Ok(())
    }

    fn subscribe(&self, handler: NotificationHandler) -> Result<Subscription, TransportError> {
        let socket = self.socket.try_clone().map_err(|source| TransportError::Bind {
            endpoint: self.peer.to_string(),
            source,
        })?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(|source| TransportError::Bind {
                endpoint: self.peer.to_string(),
                source,
            })?;

        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let clock = self.clock;

        let thread = std::thread::Builder::new()
            .name("streamprobe-udp-rx".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];

                while !thread_cancel.is_cancelled() {
                    match socket.recv_from(&mut buf) {
                        Ok((n, _from)) => {
                            let received_ns = clock.now_ns();
                            dispatch(&handler, received_ns, &buf[..n]);
                        }
                        Err(e) if is_timeout(&e) => {}
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                            handler(Notification::ReceiveFailed);
                            std::thread::sleep(RECV_POLL_INTERVAL);
                        }
                    }
                }

                debug!("udp receive thread stopped");
            })
            .map_err(TransportError::Spawn)?;

        Ok(Subscription::new(cancel, thread))
    }
}

/// Resolve `endpoint` to its first socket address.
pub(crate) fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    endpoint
        .to_socket_addrs()
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        })
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_open_rejects_unresolvable_peer() {
        let cfg = UdpConfig {
            listen: "127.0.0.1:0".to_string(),
            peer: "not an address".to_string(),
        };
        let err = UdpTransport::open(&cfg, Clock::new()).err().expect("should fail");
        assert!(matches!(err, TransportError::Connect { .. }), "err={err}");
    }

    #[test]
    fn test_open_rejects_bad_listen_address() {
        let cfg = UdpConfig {
            listen: "256.0.0.1:1".to_string(),
            peer: "127.0.0.1:9".to_string(),
        };
        let err = UdpTransport::open(&cfg, Clock::new()).err().expect("should fail");
        assert!(matches!(err, TransportError::Bind { .. }), "err={err}");
    }

    #[test]
    fn test_send_to_self_arrives() {
        // Bind on an ephemeral port, then point a second transport's peer at it.
        let receiver = UdpTransport::open(
            &UdpConfig {
                listen: "127.0.0.1:0".to_string(),
                peer: "127.0.0.1:9".to_string(),
            },
            Clock::new(),
        )
        .expect("open receiver");
        let addr = receiver.local_addr().expect("local addr");

        let sender = UdpTransport::open(
            &UdpConfig {
                listen: "127.0.0.1:0".to_string(),
                peer: addr.to_string(),
            },
            Clock::new(),
        )
        .expect("open sender");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = receiver
            .subscribe(Arc::new(move |n| {
                if let Notification::Arrival(a) = n {
                    seen_clone.lock().push(a.id);
                }
            }))
            .expect("subscribe");

        for id in 0..3 {
            sender.send(&Message::new(id, vec![1; 48])).expect("send");
        }

        std::thread::sleep(Duration::from_millis(200));
        sub.dispose();

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
