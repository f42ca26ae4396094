//! Connection topologies over ZMQ.
//!
//! Three variants share one shape: a non-blocking socket behind a mutex, a
//! background receive thread polling with `DONTWAIT`, and exactly one user
//! callback invocation per decoded message. Sends are fire-and-forget;
//! `send_reliable` on the point-to-point variants escalates to a blocking
//! send for paths that must not silently lose data.

pub mod broadcast;
pub mod control;
pub mod duplex;
pub mod hub;
pub mod identity;
pub mod peer;
pub mod stats;

pub use broadcast::{BroadcastPublisher, BroadcastSubscriber};
pub use control::{Ack, Register, Unregister};
pub use duplex::DuplexConnection;
pub use hub::HubConnection;
pub use identity::ConnectionIdentity;
pub use peer::PeerConnection;
pub use stats::{ConnectionStats, StatsSnapshot};

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;

use crate::codec::{CodecError, CodecRegistry};

/// Idle sleep between empty polls of a receive loop.
pub(crate) const POLL_IDLE: Duration = Duration::from_millis(10);
/// Non-blocking retry window before `send_reliable` escalates to a blocking send.
const RELIABLE_RETRY_WINDOW: Duration = Duration::from_millis(100);
const RELIABLE_RETRY_STEP: Duration = Duration::from_millis(5);
/// How often a receive loop logs its connection stats.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum CommsError {
    #[error("ZMQ Error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("receiver already started")]
    ReceiverAlreadyStarted,
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(String),
}

/// One inbound frame, as handed to a receive callback.
///
/// Frames that fail to parse or decode surface as `Raw` rather than as an
/// error raised on the receive thread, since no caller is waiting there.
pub enum Inbound {
    Message(Box<dyn Any + Send>),
    Raw(String),
}

impl Inbound {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Inbound::Message(message) => message.downcast_ref::<T>(),
            Inbound::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Inbound::Raw(_))
    }
}

/// Point-in-time view of a connection's socket and receive thread.
#[derive(Debug, Clone, Serialize)]
pub struct SocketStatus {
    pub name: String,
    pub endpoint: String,
    pub running: bool,
    pub receiver_alive: bool,
}

/// State shared between a connection handle and its receive thread.
pub(crate) struct SocketCore {
    pub name: String,
    pub endpoint: String,
    pub socket: Mutex<zmq::Socket>,
    pub codec: Arc<CodecRegistry>,
    pub stats: ConnectionStats,
    pub running: AtomicBool,
    pub receiver_alive: AtomicBool,
    // Held so the ZMQ context outlives the socket it produced.
    _context: zmq::Context,
}

impl SocketCore {
    pub fn new(
        name: &str,
        endpoint: &str,
        socket: zmq::Socket,
        context: zmq::Context,
        codec: Arc<CodecRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            socket: Mutex::new(socket),
            codec,
            stats: ConnectionStats::new(),
            running: AtomicBool::new(false),
            receiver_alive: AtomicBool::new(false),
            _context: context,
        })
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            running: self.running.load(Ordering::SeqCst),
            receiver_alive: self.receiver_alive.load(Ordering::SeqCst),
        }
    }

    /// Fire-and-forget single-frame send. A would-block is counted and
    /// dropped, never surfaced as an error.
    pub fn send_frame(&self, frame: &[u8], class_name: &str) -> Result<(), CommsError> {
        let socket = self.socket.lock().unwrap();
        match socket.send(frame, zmq::DONTWAIT) {
            Ok(()) => {
                self.stats.record_sent(class_name);
                Ok(())
            }
            Err(zmq::Error::EAGAIN) => {
                self.stats.record_would_block();
                self.stats.record_dropped(class_name);
                debug!("[{}] send would block, dropped {class_name}", self.name);
                Ok(())
            }
            Err(err) => {
                self.stats.record_send_error();
                Err(err.into())
            }
        }
    }

    /// Fire-and-forget multipart send with the same would-block semantics.
    pub fn send_frames(&self, parts: &[&[u8]], class_name: &str) -> Result<(), CommsError> {
        let socket = self.socket.lock().unwrap();
        match socket.send_multipart(parts.iter().copied(), zmq::DONTWAIT) {
            Ok(()) => {
                self.stats.record_sent(class_name);
                Ok(())
            }
            Err(zmq::Error::EAGAIN) => {
                self.stats.record_would_block();
                self.stats.record_dropped(class_name);
                debug!("[{}] send would block, dropped {class_name}", self.name);
                Ok(())
            }
            Err(err) => {
                self.stats.record_send_error();
                Err(err.into())
            }
        }
    }

    /// Send for paths that must not silently lose data: retries non-blocking
    /// within a short window, then escalates to an unbounded blocking send.
    /// The lock is released between attempts so the receive loop keeps making
    /// progress during the retry window.
    pub fn send_frame_reliable(&self, frame: &[u8], class_name: &str) -> Result<(), CommsError> {
        let deadline = Instant::now() + RELIABLE_RETRY_WINDOW;
        loop {
            {
                let socket = self.socket.lock().unwrap();
                match socket.send(frame, zmq::DONTWAIT) {
                    Ok(()) => {
                        self.stats.record_sent(class_name);
                        return Ok(());
                    }
                    Err(zmq::Error::EAGAIN) => {
                        self.stats.record_would_block();
                    }
                    Err(err) => {
                        self.stats.record_send_error();
                        return Err(err.into());
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(RELIABLE_RETRY_STEP);
        }

        error!(
            "[{}] peer persistently slow, escalating {class_name} to a blocking send",
            self.name
        );
        let socket = self.socket.lock().unwrap();
        match socket.send(frame, 0) {
            Ok(()) => {
                self.stats.record_sent(class_name);
                Ok(())
            }
            Err(err) => {
                self.stats.record_send_error();
                Err(err.into())
            }
        }
    }

    pub fn log_stats(&self) {
        self.stats.log(&self.name);
    }
}

/// Parses and decodes one payload, returning the inbound form plus the class
/// name when decoding succeeded (for the stats breakdown).
pub(crate) fn decode_payload(core: &SocketCore, payload: &[u8]) -> (Inbound, Option<String>) {
    let text = String::from_utf8_lossy(payload).into_owned();
    match core.codec.parse_wire(&text) {
        Ok(envelope) => match core.codec.decode(&envelope) {
            Ok(message) => (Inbound::Message(message), Some(envelope.class_name)),
            Err(err) => {
                core.stats.record_receive_error();
                debug!("[{}] undecodable frame ({err}), surfacing raw", core.name);
                (Inbound::Raw(text), None)
            }
        },
        Err(err) => {
            core.stats.record_receive_error();
            debug!("[{}] unparseable frame ({err}), surfacing raw", core.name);
            (Inbound::Raw(text), None)
        }
    }
}

/// Runs one callback invocation on the receive thread, isolating panics so
/// the loop continues.
pub(crate) fn run_callback(core: &SocketCore, invoke: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(invoke)).is_err() {
        error!("[{}] receive callback panicked, continuing", core.name);
    }
}

/// Logs the connection stats when the reporting interval elapsed.
pub(crate) fn maybe_log_stats(core: &SocketCore, last_log: &mut Instant) {
    if last_log.elapsed() >= STATS_LOG_INTERVAL {
        core.log_stats();
        *last_log = Instant::now();
    }
}

/// Spawns a named receive thread, flagging liveness around the loop body.
pub(crate) fn spawn_receiver(
    core: &Arc<SocketCore>,
    body: impl FnOnce(Arc<SocketCore>) + Send + 'static,
) -> Result<std::thread::JoinHandle<()>, CommsError> {
    core.running.store(true, Ordering::SeqCst);
    let shared = Arc::clone(core);
    std::thread::Builder::new()
        .name(format!("{}-recv", core.name))
        .spawn(move || {
            shared.receiver_alive.store(true, Ordering::SeqCst);
            info!("[{}] receive loop started", shared.name);
            body(Arc::clone(&shared));
            shared.receiver_alive.store(false, Ordering::SeqCst);
            info!("[{}] receive loop stopped", shared.name);
        })
        .map_err(|err| CommsError::Spawn(err.to_string()))
}
