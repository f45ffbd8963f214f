use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{dispatch, NotificationHandler, Subscription, Transport, RECV_POLL_INTERVAL};
use crate::clock::Clock;
use crate::config::LoopbackConfig;
use crate::error::TransportError;
use crate::wire::Message;

/// In-process peer that echoes every message back through a simulated link.
///
/// The link drops a message with `drop_probability`, holds one back behind
/// its successor with `reorder_probability`, and delays delivery by a fixed
/// `delay` measured from the send instant.
pub struct LoopbackTransport {
    cfg: LoopbackConfig,
    clock: Clock,
    state: Mutex<LinkState>,
}

struct LinkState {
    tx: Option<mpsc::Sender<InFlight>>,
    rng: StdRng,
}

struct InFlight {
    sent_at: Instant,
    data: Vec<u8>,
    hold_back: bool,
}

impl LoopbackTransport {
    pub fn new(cfg: LoopbackConfig, clock: Clock) -> Self {
        Self::with_rng(cfg, clock, StdRng::from_entropy())
    }

    /// Loopback link with a fixed seed, for reproducible loss patterns.
    pub fn seeded(cfg: LoopbackConfig, clock: Clock, seed: u64) -> Self {
        Self::with_rng(cfg, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(cfg: LoopbackConfig, clock: Clock, rng: StdRng) -> Self {
        Self {
            cfg,
            clock,
            state: Mutex::new(LinkState { tx: None, rng }),
        }
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        let data = message.encode().map_err(|e| TransportError::Send {
            id: message.id,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let mut state = self.state.lock();

        if self.cfg.drop_probability > 0.0 && state.rng.gen_bool(self.cfg.drop_probability) {
            debug!(id = message.id, "loopback dropped message");
            return Ok(());
        }

        let hold_back =
            self.cfg.reorder_probability > 0.0 && state.rng.gen_bool(self.cfg.reorder_probability);

        // Without a subscriber the message is lost, like on a real link.
        if let Some(tx) = &state.tx {
            let in_flight = InFlight {
                sent_at: Instant::now(),
                data,
                hold_back,
            };
            if tx.send(in_flight).is_err() {
                state.tx = None;
            }
        }

        Ok(())
    }

    fn subscribe(&self, handler: NotificationHandler) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel::<InFlight>();
        self.state.lock().tx = Some(tx);

        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let delay = self.cfg.delay;
        let clock = self.clock;

        let thread = std::thread::Builder::new()
            .name("streamprobe-loopback".into())
            .spawn(move || {
                let mut held: Option<InFlight> = None;

                while !thread_cancel.is_cancelled() {
                    let next = match rx.recv_timeout(RECV_POLL_INTERVAL) {
                        Ok(next) => next,
                        Err(RecvTimeoutError::Timeout) => {
                            // Link went idle; release anything held back.
                            if let Some(late) = held.take() {
                                deliver(&handler, &clock, late, delay);
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    if next.hold_back && held.is_none() {
                        held = Some(next);
                        continue;
                    }

                    deliver(&handler, &clock, next, delay);
                    if let Some(late) = held.take() {
                        deliver(&handler, &clock, late, delay);
                    }
                }

                debug!("loopback delivery thread stopped");
            })
            .map_err(TransportError::Spawn)?;

        Ok(Subscription::new(cancel, thread))
    }
}

fn deliver(
    handler: &NotificationHandler,
    clock: &Clock,
    in_flight: InFlight,
    delay: std::time::Duration,
) {
    let due = in_flight.sent_at + delay;
    let now = Instant::now();
    if due > now {
        std::thread::sleep(due - now);
    }

    dispatch(handler, clock.now_ns(), &in_flight.data);
}
