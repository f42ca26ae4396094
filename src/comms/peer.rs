//! Peer end of the many-to-one topology (ZMQ DEALER).
//!
//! A peer connects to a hub under a stable identity, announces itself with
//! `Register` on the first receive-loop iteration, and retracts itself with
//! `Unregister` at shutdown so the hub stops addressing it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info};

use crate::codec::{CodecRegistry, Wire};
use crate::comms::control::{Ack, Register, Unregister};
use crate::comms::identity::ConnectionIdentity;
use crate::comms::{
    decode_payload, maybe_log_stats, run_callback, spawn_receiver, CommsError, Inbound,
    SocketCore, SocketStatus, StatsSnapshot, POLL_IDLE,
};
use crate::thread_util::{join_with_timeout, JOIN_TIMEOUT};

pub struct PeerConnection {
    core: Arc<SocketCore>,
    identity: ConnectionIdentity,
    receiver: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Connects to a hub. A random identity is generated when none is given.
    pub fn connect(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
        identity: Option<ConnectionIdentity>,
    ) -> Result<Self, CommsError> {
        let identity = identity.unwrap_or_else(ConnectionIdentity::random);

        // The handshake classes must be decodable before the first frame.
        codec.register::<Register>();
        codec.register::<Unregister>();
        codec.register::<Ack>();

        let context = zmq::Context::new();
        let socket = context.socket(zmq::DEALER)?;
        socket.set_sndhwm(1)?;
        socket.set_identity(identity.as_bytes())?;
        info!("[{name}] connecting to {endpoint} as {identity}");
        socket.connect(endpoint)?;

        Ok(Self {
            core: SocketCore::new(name, endpoint, socket, context, codec),
            identity,
            receiver: None,
        })
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Fire-and-forget send to the hub.
    pub fn send<T: Wire>(&self, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.core.send_frame(frame.as_bytes(), T::CLASS_NAME)
    }

    /// Send that escalates to blocking rather than dropping. Queue-processor
    /// outbound path only.
    pub fn send_reliable<T: Wire>(&self, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.core.send_frame_reliable(frame.as_bytes(), T::CLASS_NAME)
    }

    /// Starts the receive thread. Registration with the hub happens on the
    /// first loop iteration; `Ack` frames are logged and still delivered.
    pub fn start_receiving(
        &mut self,
        mut callback: impl FnMut(Inbound) + Send + 'static,
    ) -> Result<(), CommsError> {
        if self.receiver.is_some() {
            return Err(CommsError::ReceiverAlreadyStarted);
        }
        let identity = self.identity.clone();
        let handle = spawn_receiver(&self.core, move |core| {
            let register = Register {
                identity: identity.to_string(),
            };
            match core.codec.to_wire(&register) {
                Ok(frame) => {
                    if let Err(err) = core.send_frame(frame.as_bytes(), Register::CLASS_NAME) {
                        error!("[{}] registration failed: {err}", core.name);
                    }
                }
                Err(err) => error!("[{}] registration failed: {err}", core.name),
            }

            let mut last_stats_log = Instant::now();
            while core.running.load(Ordering::SeqCst) {
                let frame = { core.socket.lock().unwrap().recv_multipart(zmq::DONTWAIT) };
                match frame {
                    Ok(parts) if parts.is_empty() => {}
                    Ok(parts) => {
                        // The hub sends [identity, empty, payload]; the
                        // router strips the identity in transit, so the
                        // payload is the final frame.
                        let payload = &parts[parts.len() - 1];
                        let started = Instant::now();
                        let (inbound, class_name) = decode_payload(&core, payload);
                        if let Some(ack) = inbound.downcast_ref::<Ack>() {
                            debug!(
                                "[{}] registration acknowledged: {}",
                                core.name, ack.status
                            );
                        }
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

    /// Unregisters from the hub and stops the receive thread.
    pub fn stop(&mut self) {
        let unregister = Unregister {
            identity: self.identity.to_string(),
        };
        if let Err(err) = self.send(&unregister) {
            error!("[{}] unregister failed: {err}", self.core.name);
        }
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

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.stop();
        }
    }
}
