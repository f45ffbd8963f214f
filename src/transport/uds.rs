use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::udp::is_timeout;
use super::{
    dispatch, Notification, NotificationHandler, Subscription, Transport, MAX_DATAGRAM,
    RECV_POLL_INTERVAL,
};
use crate::clock::Clock;
use crate::config::UdsConfig;
use crate::error::TransportError;
use crate::wire::Message;

/// Unix datagram transport.
///
/// Sends go through a socket connected to `send_path`; arrivals are read from
/// a socket bound on `recv_path`. The bound path is removed on drop.
pub struct UdsTransport {
    sender: UnixDatagram,
    receiver: UnixDatagram,
    recv_path: PathBuf,
    clock: Clock,
}

impl UdsTransport {
    /// Bind `recv_path` and connect to `send_path`.
    ///
    /// A stale socket file at `recv_path` is replaced.
    pub fn open(cfg: &UdsConfig, clock: Clock) -> Result<Self, TransportError> {
        let recv_path = PathBuf::from(&cfg.recv_path);

        match std::fs::remove_file(&recv_path) {
            Ok(()) => debug!(path = %recv_path.display(), "removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(TransportError::Bind {
                    endpoint: cfg.recv_path.clone(),
                    source,
                })
            }
        }

        let receiver = UnixDatagram::bind(&recv_path).map_err(|source| TransportError::Bind {
            endpoint: cfg.recv_path.clone(),
            source,
        })?;

        let sender = UnixDatagram::unbound().map_err(|source| TransportError::Connect {
            endpoint: cfg.send_path.clone(),
            source,
        })?;
        if let Err(source) = sender.connect(&cfg.send_path) {
            let _ = std::fs::remove_file(&recv_path);
            return Err(TransportError::Connect {
                endpoint: cfg.send_path.clone(),
                source,
            });
        }

        debug!(
            send_path = %cfg.send_path,
            recv_path = %cfg.recv_path,
            "unix datagram sockets ready"
        );

        Ok(Self {
            sender,
            receiver,
            recv_path,
            clock,
        })
    }
}

impl Transport for UdsTransport {
    fn name(&self) -> &'static str {
        "uds"
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let data = message.encode().map_err(|e| TransportError::Send {
            id: message.id,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let written = self.sender.send(&data).map_err(|source| TransportError::Send {
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
        let endpoint = || self.recv_path.display().to_string();

        let socket = self.receiver.try_clone().map_err(|source| TransportError::Bind {
            endpoint: endpoint(),
            source,
        })?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint(),
                source,
            })?;

        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let clock = self.clock;

        let thread = std::thread::Builder::new()
            .name("streamprobe-uds-rx".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];

                while !thread_cancel.is_cancelled() {
                    match socket.recv(&mut buf) {
                        Ok(n) => {
                            let received_ns = clock.now_ns();
                            dispatch(&handler, received_ns, &buf[..n]);
                        }
                        Err(e) if is_timeout(&e) => {}
                        Err(e) => {
                            warn!(error = %e, "unix datagram receive failed");
                            handler(Notification::ReceiveFailed);
                            std::thread::sleep(RECV_POLL_INTERVAL);
                        }
                    }
                }

                debug!("uds receive thread stopped");
            })
            .map_err(TransportError::Spawn)?;

        Ok(Subscription::new(cancel, thread))
    }
}

impl Drop for UdsTransport {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.recv_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.recv_path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    fn paths(dir: &tempfile::TempDir) -> UdsConfig {
        UdsConfig {
            send_path: dir.path().join("peer.sock").display().to_string(),
            recv_path: dir.path().join("bench.sock").display().to_string(),
        }
    }

    #[test]
    fn test_open_fails_without_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = paths(&dir);

        let err = UdsTransport::open(&cfg, Clock::new()).err().expect("should fail");
        assert!(matches!(err, TransportError::Connect { .. }), "err={err}");
        assert!(!dir.path().join("bench.sock").exists());
    }

    #[test]
    fn test_round_trip_through_peer_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = paths(&dir);

        let peer = UnixDatagram::bind(&cfg.send_path).expect("bind peer");
        let transport = UdsTransport::open(&cfg, Clock::new()).expect("open");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = transport
            .subscribe(Arc::new(move |n| {
                if let Notification::Arrival(a) = n {
                    seen_clone.lock().push(a.id);
                }
            }))
            .expect("subscribe");

        let mut buf = [0u8; 256];
        for id in 0..3 {
            transport.send(&Message::new(id, vec![7; 48])).expect("send");
            let n = peer.recv(&mut buf).expect("peer recv");
            peer.send_to(&buf[..n], &cfg.recv_path).expect("peer echo");
        }

        std::thread::sleep(Duration::from_millis(200));
        sub.dispose();

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_stale_socket_file_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = paths(&dir);
        std::fs::write(&cfg.recv_path, b"stale").expect("write stale file");

        let _peer = UnixDatagram::bind(&cfg.send_path).expect("bind peer");
        let transport = UdsTransport::open(&cfg, Clock::new()).expect("open");
        drop(transport);

        assert!(!dir.path().join("bench.sock").exists());
    }
}
