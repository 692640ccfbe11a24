//! Node Registry
//!
//! Process-wide interning table mapping identities to shared `Node` handles.
//! Every subsystem compares nodes by handle identity (`Arc::ptr_eq`), not by
//! value, so the registry must hand out the same `Arc` for the same identity
//! for its whole lifetime. Each node also gets a dense local index so compact
//! integers can stand in for full addresses inside serialized task metadata.
//!
//! The registry is an explicitly constructed service object, injected into its
//! consumers; tests build a fresh one each time.

use anyhow::{Result, anyhow, bail};
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::config::Config;

use super::node::Node;
use super::types::NodeIdentity;

pub struct NodeRegistry {
    cfg: Arc<Config>,
    interned: DashMap<NodeIdentity, Arc<Node>>,
    /// Dense index array; slot 0 is intentionally never used.
    index: RwLock<Vec<Option<Arc<Node>>>>,
    next_index: AtomicUsize,
    self_node: OnceLock<Arc<Node>>,
}

impl NodeRegistry {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            interned: DashMap::new(),
            index: RwLock::new(vec![None]),
            next_index: AtomicUsize::new(1),
            self_node: OnceLock::new(),
        }
    }

    /// Return the unique shared handle for `identity`, creating it on first
    /// sight. Creation grows the dense index table under a short lock;
    /// repeat lookups are concurrent-map reads.
    pub fn intern(&self, identity: NodeIdentity) -> Arc<Node> {
        if let Some(node) = self.interned.get(&identity) {
            return node.clone();
        }
        use dashmap::mapref::entry::Entry;
        match self.interned.entry(identity) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let idx = self.next_index.fetch_add(1, Ordering::SeqCst);
                assert!(
                    idx < i16::MAX as usize,
                    "local node index space exhausted ({} peers)",
                    idx
                );
                let node = Arc::new(Node::new(identity, idx as u16, &self.cfg));
                slot.insert(node.clone());
                let mut index = self.index.write().unwrap();
                if index.len() <= idx {
                    index.resize(idx + 1, None);
                }
                index[idx] = Some(node.clone());
                node
            }
        }
    }

    /// O(1) lookup by dense local index.
    pub fn by_local_index(&self, idx: u16) -> Option<Arc<Node>> {
        self.index
            .read()
            .unwrap()
            .get(idx as usize)
            .and_then(|slot| slot.clone())
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.interned
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    /// Intern this process's own reachable address. Runs exactly once per
    /// registry; everything downstream assumes one stable self identity.
    pub fn register_self(&self, addr: Ipv4Addr, port: u16) -> Result<Arc<Node>> {
        let node = self.intern(NodeIdentity::new(addr, port));
        self.self_node
            .set(node.clone())
            .map_err(|_| anyhow!("self node already registered"))?;
        Ok(node)
    }

    pub fn self_node(&self) -> Option<Arc<Node>> {
        self.self_node.get().cloned()
    }

    /// Discover this process's reachable IPv4 address.
    ///
    /// Routes a connectionless probe towards well-known anchors and reads the
    /// chosen source address; no packets are actually sent. No candidate at
    /// all is fatal. Multiple distinct candidates (a multi-homed host) pick
    /// the numerically lowest and warn, never hard-fail.
    pub fn discover_local_addr() -> Result<Ipv4Addr> {
        let mut candidates: Vec<Ipv4Addr> = Vec::new();
        for anchor in ["8.8.8.8:53", "1.1.1.1:53"] {
            let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
                continue;
            };
            if socket.connect(anchor).is_err() {
                continue;
            }
            if let Ok(SocketAddr::V4(local)) = socket.local_addr() {
                let ip = *local.ip();
                if !ip.is_unspecified() && !candidates.contains(&ip) {
                    candidates.push(ip);
                }
            }
        }
        match candidates.len() {
            0 => bail!("no usable network interface found"),
            1 => Ok(candidates[0]),
            _ => {
                candidates.sort();
                tracing::warn!(
                    "Found multiple candidate addresses {:?}, using {}",
                    candidates,
                    candidates[0]
                );
                Ok(candidates[0])
            }
        }
    }
}
