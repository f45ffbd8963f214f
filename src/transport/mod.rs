//! Transport boundary: fire-and-forget sends plus an arrival subscription.
//!
//! Every transport delivers arrivals from a dedicated receive thread. The
//! arrival timestamp is taken right after the datagram is read, before
//! decoding or handing it to the subscriber, so queueing downstream never
//! inflates measured latency.

pub mod loopback;
pub mod tcp;
pub mod udp;
#[cfg(unix)]
pub mod uds;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{TransportConfig, TransportKind};
use crate::error::TransportError;
use crate::wire::{self, Message, WireError};

/// How often receive loops check for disposal.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest message a receive loop accepts.
pub const MAX_DATAGRAM: usize = 65_536;

/// A decoded arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub id: u64,
    pub received_ns: u64,
    pub payload_len: usize,
}

/// Something observed by a receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Arrival(Arrival),
    Undecodable { received_ns: u64, error: WireError },
    /// The socket read itself failed; the loop keeps polling.
    ReceiveFailed,
}

/// Callback invoked from the receive thread for every notification.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Message transport between the benchmark and its peer.
pub trait Transport: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Hand a message to the transport. No delivery confirmation.
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Start delivering arrivals to `handler` until the returned subscription
    /// is disposed.
    fn subscribe(&self, handler: NotificationHandler) -> Result<Subscription, TransportError>;
}

/// Active arrival subscription backed by a receive thread.
pub struct Subscription {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(cancel: CancellationToken, thread: JoinHandle<()>) -> Self {
        Self {
            cancel,
            thread: Some(thread),
        }
    }

    /// Stop the receive thread and wait for it to exit.
    ///
    /// Returns within one receive poll interval.
    pub fn dispose(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("receive thread panicked");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Open the transport selected by `cfg`.
///
/// Binding and endpoint resolution happen here, so an unreachable endpoint
/// fails before any traffic is generated.
pub fn open(cfg: &TransportConfig, clock: Clock) -> Result<Arc<dyn Transport>, anyhow::Error> {
    cfg.validate()?;

    let transport: Arc<dyn Transport> = match cfg.kind {
        TransportKind::Loopback => Arc::new(loopback::LoopbackTransport::new(
            cfg.loopback.clone(),
            clock,
        )),
        TransportKind::Udp => Arc::new(udp::UdpTransport::open(&cfg.udp, clock)?),
        TransportKind::Tcp => Arc::new(tcp::TcpTransport::open(&cfg.tcp, clock)?),
        #[cfg(unix)]
        TransportKind::Uds => Arc::new(uds::UdsTransport::open(&cfg.uds, clock)?),
        #[cfg(not(unix))]
        TransportKind::Uds => {
            return Err(crate::error::ConfigError::UnsupportedTransport { kind: "uds" }.into())
        }
    };

    tracing::info!(kind = transport.name(), "transport opened");

    Ok(transport)
}

/// Decode a received datagram and pass the result to `handler`.
pub(crate) fn dispatch(handler: &NotificationHandler, received_ns: u64, data: &[u8]) {
    match wire::decode_header(data) {
        Ok(header) => handler(Notification::Arrival(Arrival {
            id: header.id,
            received_ns,
            payload_len: header.payload_len,
        })),
        Err(error) => {
            debug!(error = %error, len = data.len(), "undecodable datagram");
            handler(Notification::Undecodable { received_ns, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_dispatch_arrival() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: NotificationHandler = Arc::new(move |n| seen_clone.lock().push(n));

        let data = Message::new(17, vec![1, 2, 3]).encode().expect("encode");
        dispatch(&handler, 555, &data);
        dispatch(&handler, 556, &[0u8; 4]);

        let seen = seen.lock();
        assert_eq!(
            seen[0],
            Notification::Arrival(Arrival {
                id: 17,
                received_ns: 555,
                payload_len: 3
            })
        );
        assert!(matches!(
            seen[1],
            Notification::Undecodable {
                received_ns: 556,
                error: WireError::Truncated { size: 4 }
            }
        ));
    }

    #[test]
    fn test_subscription_dispose_joins_thread() {
        let cancel = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        let thread_cancel = cancel.clone();
        let thread_exited = Arc::clone(&exited);
        let thread = std::thread::spawn(move || {
            while !thread_cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            thread_exited.store(true, Ordering::SeqCst);
        });

        Subscription::new(cancel, thread).dispose();
        assert!(exited.load(Ordering::SeqCst));
    }
}
