//! Handshake messages for the many-to-one topology.
//!
//! A peer announces itself with `Register` on its first receive-loop
//! iteration and retracts itself with `Unregister` at shutdown; the hub
//! answers a registration with `Ack`. Hub and peer constructors register all
//! three with their codec, so the handshake never hits an unknown class.

use crate::wire_message;

wire_message! {
    /// Sent by a peer to enter the hub's peer registry.
    pub struct Register {
        pub identity: String,
    }
}

wire_message! {
    /// Sent by a peer to leave the hub's peer registry.
    pub struct Unregister {
        pub identity: String,
    }
}

wire_message! {
    /// Hub reply to a registration.
    pub struct Ack {
        pub status: String,
    }
}

impl Ack {
    pub fn registered() -> Self {
        Self {
            status: "registered".to_string(),
        }
    }
}
