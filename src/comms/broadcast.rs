//! 1:N broadcast over ZMQ PUB/SUB.
//!
//! The publisher binds and sends `[topic, payload]` frames; subscribers
//! connect to one or more publishers with an optional exact-prefix topic
//! filter. Delivery is best effort with no acknowledgment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info};

use crate::codec::{CodecRegistry, Wire};
use crate::comms::{
    decode_payload, maybe_log_stats, run_callback, spawn_receiver, CommsError, Inbound,
    SocketCore, SocketStatus, StatsSnapshot, POLL_IDLE,
};
use crate::thread_util::{join_with_timeout, JOIN_TIMEOUT};

/// Publishing end of a broadcast connection.
pub struct BroadcastPublisher {
    core: Arc<SocketCore>,
}

impl BroadcastPublisher {
    pub fn bind(
        name: &str,
        endpoint: &str,
        codec: Arc<CodecRegistry>,
    ) -> Result<Self, CommsError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        info!("[{name}] binding to {endpoint}");
        socket.bind(endpoint)?;
        Ok(Self {
            core: SocketCore::new(name, endpoint, socket, context, codec),
        })
    }

    /// Publishes one message under a topic. Fire and forget: subscribers that
    /// cannot keep up miss frames.
    pub fn publish<T: Wire>(&self, topic: &str, message: &T) -> Result<(), CommsError> {
        let frame = self.core.codec.to_wire(message)?;
        self.core
            .send_frames(&[topic.as_bytes(), frame.as_bytes()], T::CLASS_NAME)
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

/// Subscribing end of a broadcast connection.
pub struct BroadcastSubscriber {
    core: Arc<SocketCore>,
    receiver: Option<JoinHandle<()>>,
}

impl BroadcastSubscriber {
    /// Connects to every endpoint, filtering topics by exact prefix. An empty
    /// filter subscribes to everything.
    pub fn connect(
        name: &str,
        endpoints: &[&str],
        topic_filter: &str,
        codec: Arc<CodecRegistry>,
    ) -> Result<Self, CommsError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        for endpoint in endpoints {
            info!("[{name}] connecting to {endpoint}");
            socket.connect(endpoint)?;
        }
        socket.set_subscribe(topic_filter.as_bytes())?;
        info!("[{name}] subscribed with filter {topic_filter:?}");
        Ok(Self {
            core: SocketCore::new(name, &endpoints.join(","), socket, context, codec),
            receiver: None,
        })
    }

    /// Starts the receive thread; the callback gets the topic alongside the
    /// decoded message.
    pub fn start_receiving(
        &mut self,
        mut callback: impl FnMut(&str, Inbound) + Send + 'static,
    ) -> Result<(), CommsError> {
        if self.receiver.is_some() {
            return Err(CommsError::ReceiverAlreadyStarted);
        }
        let handle = spawn_receiver(&self.core, move |core| {
            let mut last_stats_log = Instant::now();
            while core.running.load(Ordering::SeqCst) {
                let frame = { core.socket.lock().unwrap().recv_multipart(zmq::DONTWAIT) };
                match frame {
                    Ok(parts) => {
                        if parts.len() < 2 {
                            debug!(
                                "[{}] skipping short broadcast frame ({} parts)",
                                core.name,
                                parts.len()
                            );
                            core.stats.record_receive_error();
                            continue;
                        }
                        let topic = String::from_utf8_lossy(&parts[0]).into_owned();
                        let started = Instant::now();
                        let (inbound, class_name) = decode_payload(&core, &parts[1]);
                        run_callback(&core, || callback(&topic, inbound));
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

impl Drop for BroadcastSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}
