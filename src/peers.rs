// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::messaging::ProtocolVersion;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// A remote MQTT-SN endpoint, identified by client id and network address.
///
/// `Peer` is a cheap-clone handle: every per-peer table in the crate is keyed
/// by it, so cloning must not copy the client id. The negotiated protocol
/// version rides along but takes no part in identity.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    client_id: String,
    addr: SocketAddr,
    version: ProtocolVersion,
}

impl Peer {
    /// New peer speaking the default protocol revision (v1.2).
    pub fn new(client_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self::with_version(client_id, addr, ProtocolVersion::V1_2)
    }

    /// New peer with an explicitly negotiated protocol revision.
    pub fn with_version(
        client_id: impl Into<String>,
        addr: SocketAddr,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                client_id: client_id.into(),
                addr,
                version,
            }),
        }
    }

    /// The client id the peer presented at CONNECT time.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The peer's network address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// The protocol revision this peer speaks.
    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.client_id == other.inner.client_id && self.inner.addr == other.inner.addr
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.client_id.hash(state);
        self.inner.addr.hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}@{})", self.inner.client_id, self.inner.addr)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.inner.client_id, self.inner.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::Peer;
    use crate::messaging::ProtocolVersion;
    use std::collections::HashSet;

    fn addr(port: u16) -> std::net::SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn identity_ignores_protocol_version() {
        let a = Peer::with_version("sensor-1", addr(2442), ProtocolVersion::V1_2);
        let b = Peer::with_version("sensor-1", addr(2442), ProtocolVersion::V2_0);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        let _ = set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn identity_covers_both_id_and_addr() {
        let a = Peer::new("sensor-1", addr(2442));
        assert_ne!(a, Peer::new("sensor-2", addr(2442)));
        assert_ne!(a, Peer::new("sensor-1", addr(2443)));
    }
}
