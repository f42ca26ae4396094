//! Hub end of the many-to-one topology (ZMQ ROUTER).
//!
//! The hub addresses peers by identity. Peers enter the registry through the
//! `Register` handshake and leave it only through an explicit `Unregister`:
//! a peer that dies without unregistering stays addressed until the hub
//! restarts. `broadcast` sends individually to every registered identity with
//! no delivery acknowledgment.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
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

pub struct HubConnection {
    core: Arc<SocketCore>,
    peers: Arc<Mutex<HashSet<ConnectionIdentity>>>,
    receiver: Option<JoinHandle<()>>,
}

impl HubConnection {
    pub fn bind(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
    ) -> Result<Self, CommsError> {
        codec.register::<Register>();
        codec.register::<Unregister>();
        codec.register::<Ack>();

        let context = zmq::Context::new();
        let socket = context.socket(zmq::ROUTER)?;
        socket.set_sndhwm(1)?;
        info!("[{name}] binding to {endpoint}");
        socket.bind(endpoint)?;

        Ok(Self {
            core: SocketCore::new(name, endpoint, socket, context, codec),
            peers: Arc::new(Mutex::new(HashSet::new())),
            receiver: None,
        })
    }

    /// Fire-and-forget send to one registered (or known) identity.
    pub fn send<T: Wire>(
        &self,
        identity: &ConnectionIdentity,
        message: &T,
    ) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.send_raw(identity, frame.as_bytes(), T::CLASS_NAME)
    }

    /// Sends individually to every currently registered identity. A send
    /// failure on one peer does not skip the rest; the first error is
    /// returned after all peers have been attempted.
    pub fn broadcast<T: Wire>(&self, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        let mut first_err = None;
        for identity in self.registered_peers() {
            if let Err(err) = self.send_raw(&identity, frame.as_bytes(), T::CLASS_NAME) {
                error!("[{}] broadcast to {identity} failed: {err}", self.core.name);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn send_raw(
        &self,
        identity: &ConnectionIdentity,
        frame: &[u8],
        class_name: &str,
    ) -> Result<(), CommsError> {
        self.core
            .send_frames(&[identity.as_bytes(), b"", frame], class_name)
    }

    /// Snapshot of the peer registry.
    pub fn registered_peers(&self) -> Vec<ConnectionIdentity> {
        self.peers.lock().unwrap().iter().cloned().collect()
    }

    /// Starts the receive thread. Handshake frames update the peer registry
    /// and never reach the callback; everything else is delivered with the
    /// sending peer's identity.
    pub fn start_receiving(
        &mut self,
        mut callback: impl FnMut(&ConnectionIdentity, Inbound) + Send + 'static,
    ) -> Result<(), CommsError> {
        if self.receiver.is_some() {
            return Err(CommsError::ReceiverAlreadyStarted);
        }
        let peers = Arc::clone(&self.peers);
        let handle = spawn_receiver(&self.core, move |core| {
            let mut last_stats_log = Instant::now();
            while core.running.load(Ordering::SeqCst) {
                let frame = { core.socket.lock().unwrap().recv_multipart(zmq::DONTWAIT) };
                match frame {
                    Ok(parts) => {
                        // The router prepends the sender identity; the
                        // payload is the final frame either way.
                        if parts.len() < 2 {
                            debug!(
                                "[{}] skipping short multipart frame ({} parts)",
                                core.name,
                                parts.len()
                            );
                            core.stats.record_receive_error();
                            continue;
                        }
                        let identity = ConnectionIdentity::new(parts[0].clone());
                        let payload = &parts[parts.len() - 1];
                        let started = Instant::now();
                        let (inbound, class_name) = decode_payload(&core, payload);

                        if Self::handle_control(&core, &peers, &identity, &inbound) {
                            if let Some(class_name) = class_name {
                                core.stats.record_received(&class_name, started.elapsed());
                            }
                            continue;
                        }

                        run_callback(&core, || callback(&identity, inbound));
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

    /// Intercepts `Register`/`Unregister`. Returns true when the frame was a
    /// control message and must not reach the user callback.
    fn handle_control(
        core: &SocketCore,
        peers: &Mutex<HashSet<ConnectionIdentity>>,
        identity: &ConnectionIdentity,
        inbound: &Inbound,
    ) -> bool {
        if inbound.downcast_ref::<Register>().is_some() {
            peers.lock().unwrap().insert(identity.clone());
            info!("[{}] registered peer {identity}", core.name);
            match core.codec.to_wire(&Ack::registered()) {
                Ok(frame) => {
                    let parts: [&[u8]; 3] = [identity.as_bytes(), b"", frame.as_bytes()];
                    if let Err(err) = core.send_frames(&parts, Ack::CLASS_NAME) {
                        error!("[{}] ack to {identity} failed: {err}", core.name);
                    }
                }
                Err(err) => error!("[{}] ack to {identity} failed: {err}", core.name),
            }
            return true;
        }
        if inbound.downcast_ref::<Unregister>().is_some() {
            peers.lock().unwrap().remove(identity);
            info!("[{}] unregistered peer {identity}", core.name);
            return true;
        }
        false
    }

    /// Stops the receive thread. The peer registry is kept: identities are
    /// pruned only by explicit `Unregister`.
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

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.stop();
    }
}
