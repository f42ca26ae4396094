//! 1:1 point-to-point connection over a ZMQ PAIR socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{error, info};

use crate::codec::{CodecRegistry, Wire};
use crate::comms::{
    decode_payload, maybe_log_stats, run_callback, spawn_receiver, CommsError, Inbound,
    SocketCore, SocketStatus, StatsSnapshot, POLL_IDLE,
};
use crate::thread_util::{join_with_timeout, JOIN_TIMEOUT};

/// One end of a 1:1 connection. Either end may bind; the other connects.
pub struct DuplexConnection {
    core: Arc<SocketCore>,
    receiver: Option<JoinHandle<()>>,
}

impl DuplexConnection {
    /// Creates the binding end.
    pub fn bind(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
    ) -> Result<Self, CommsError> {
        Self::open(name, endpoint, codec, true)
    }

    /// Creates the connecting end.
    pub fn connect(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
    ) -> Result<Self, CommsError> {
        Self::open(name, endpoint, codec, false)
    }

    fn open(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
        bind: bool,
    ) -> Result<Self, CommsError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PAIR)?;
        socket.set_sndhwm(1)?;
        if bind {
            info!("[{name}] binding to {endpoint}");
            socket.bind(endpoint)?;
        } else {
            info!("[{name}] connecting to {endpoint}");
            socket.connect(endpoint)?;
        }
        Ok(Self {
            core: SocketCore::new(name, endpoint, socket, context, codec),
            receiver: None,
        })
    }

    /// Fire-and-forget send; a full peer drops the message and counts it.
    pub fn send<T: Wire>(&self, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.core.send_frame(frame.as_bytes(), T::CLASS_NAME)
    }

    /// Send that must not silently lose data: bounded retries, then an
    /// unbounded blocking send. Meant for the queue processor's outbound
    /// path, never for publish-style traffic.
    pub fn send_reliable<T: Wire>(&self, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.core.send_frame_reliable(frame.as_bytes(), T::CLASS_NAME)
    }

    /// Starts the background receive thread. The callback runs on that
    /// thread, once per message, and must not block.
    pub fn start_receiving(
        &mut self,
        mut callback: impl FnMut(Inbound) + Send + 'static,
    ) -> Result<(), CommsError> {
        if self.receiver.is_some() {
            return Err(CommsError::ReceiverAlreadyStarted);
        }
        let handle = spawn_receiver(&self.core, move |core| {
            let mut last_stats_log = Instant::now();
            while core.running.load(Ordering::SeqCst) {
                let frame = { core.socket.lock().unwrap().recv_bytes(zmq::DONTWAIT) };
                match frame {
                    Ok(payload) => {
                        let started = Instant::now();
                        let (inbound, class_name) = decode_payload(&core, &payload);
                        run_callback(&core, || callback(inbound));
                        if let Some(class_name) = class_name {
                            core.stats.record_received(&class_name, started.elapsed());
                        }
                    }
                    Err(zmq::Error::EAGAIN) => std::thread::sleep(POLL_IDLE),
                    Err(err) => {
                        core.stats.record_receive_error();
                        error!("[{}] receive error: {err}", core.name);
                        std::thread::sleep(POLL_IDLE);
                    }
                }
                maybe_log_stats(&core, &mut last_stats_log);
            }
        })?;
        self.receiver = Some(handle);
        Ok(())
    }

    /// Stops the receive thread, waiting up to the join timeout.
    pub fn stop(&mut self) {
        self.core.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            join_with_timeout(&self.core.name, handle, JOIN_TIMEOUT);
        }
    }

    pub fn get_socket_status(&self) -> SocketStatus {
        self.core.status()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn log_current_stats(&self) {
        self.core.log_stats();
    }
}

impl Drop for DuplexConnection {
    fn drop(&mut self) {
        self.stop();
    }
}
