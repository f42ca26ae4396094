//! Connection identities for the many-to-one topology.

use std::fmt;

use uuid::Uuid;

/// Opaque byte string naming one endpoint of a many-to-one connection. The
/// hub keys its peer registry on this value, which doubles as the ZMQ routing
/// identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity(Vec<u8>);

impl ConnectionIdentity {
    pub fn new(identity: impl Into<Vec<u8>>) -> Self {
        Self(identity.into())
    }

    /// Random identity for peers that do not care about their name.
    pub fn random() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("peer-{}", &uuid[..8]).into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionIdentity({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for ConnectionIdentity {
    fn from(identity: &str) -> Self {
        Self(identity.as_bytes().to_vec())
    }
}
