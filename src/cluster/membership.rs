//! Cluster Membership Oracle
//!
//! The delivery protocol does not form clusters itself; it only asks two
//! questions of whoever does: is this peer still a member, and what was its
//! last health report. Anything implementing `ClusterMembership` can answer.

use dashmap::DashMap;
use std::sync::Arc;

use super::types::{HeartBeat, NodeIdentity};

/// The two predicates the delivery core needs from the membership layer.
pub trait ClusterMembership: Send + Sync + 'static {
    /// True while the peer is a confirmed cluster member.
    fn is_member(&self, identity: &NodeIdentity) -> bool;

    /// The peer's most recent health snapshot, if any has been observed.
    fn heartbeat_of(&self, identity: &NodeIdentity) -> Option<HeartBeat>;
}

/// A membership view maintained by explicit joins and leaves.
///
/// The binary feeds it from its peer list; tests drive it directly to simulate
/// peers departing or rebooting.
pub struct StaticMembership {
    members: DashMap<NodeIdentity, HeartBeat>,
}

impl StaticMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: DashMap::new(),
        })
    }

    pub fn join(&self, identity: NodeIdentity, heartbeat: HeartBeat) {
        self.members.insert(identity, heartbeat);
    }

    pub fn leave(&self, identity: &NodeIdentity) {
        self.members.remove(identity);
    }

    /// Replace a member's health snapshot wholesale.
    pub fn set_heartbeat(&self, identity: NodeIdentity, heartbeat: HeartBeat) {
        self.members.insert(identity, heartbeat);
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl ClusterMembership for StaticMembership {
    fn is_member(&self, identity: &NodeIdentity) -> bool {
        self.members.contains_key(identity)
    }

    fn heartbeat_of(&self, identity: &NodeIdentity) -> Option<HeartBeat> {
        self.members.get(identity).map(|entry| entry.value().clone())
    }
}
