use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Canonical address key for a process in the cluster.
///
/// A process is uniquely named by its IPv4 address and port. Identities order
/// by unsigned numeric address first, then port, so every node sorts peers the
/// same way. On the wire this encodes as the 4 address octets followed by the
/// port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Last-known health snapshot for a peer.
///
/// Replaced wholesale every health interval, never mutated field by field, so
/// readers always see one consistent report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    /// Millisecond timestamp of the reporting process's boot. A change here
    /// means the peer restarted and remembers nothing about prior task ids.
    pub boot_millis: u64,
    /// Reported load factor.
    pub load: f32,
    /// How many tasks the peer is willing to run concurrently.
    pub task_capacity: u32,
    /// Late-joining client rather than a full cluster member. Clients may be
    /// intermittently connected by design and get longer timeouts.
    pub client: bool,
}
