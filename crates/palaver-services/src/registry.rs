//! Peer registry — the map of known handles and where to reach them.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;

use palaver_core::wire::PeerInfo;

/// A known peer: the address and data port its text and image traffic goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub handle: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// In-memory peer registry, keyed on handle. At most one record per
/// handle; later writes win unconditionally. Cheap to clone — all clones
/// share state, and each upsert/delete is guarded by the map itself, so
/// the receive loop and the command loop can both apply changes.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<DashMap<String, PeerRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Upsert from a JOIN. Returns whether the registry changed.
    pub fn apply_join(&self, handle: &str, addr: IpAddr, port: u16) -> bool {
        let record = PeerRecord {
            handle: handle.to_string(),
            addr,
            port,
        };
        match self.peers.insert(handle.to_string(), record.clone()) {
            Some(previous) => previous != record,
            None => true,
        }
    }

    /// Remove on LEAVE. Returns whether a record was present.
    pub fn apply_leave(&self, handle: &str) -> bool {
        self.peers.remove(handle).is_some()
    }

    /// Upsert every KNOWNUSERS entry. Returns whether any record changed.
    pub fn apply_known_users(&self, entries: &[PeerInfo]) -> bool {
        let mut changed = false;
        for entry in entries {
            changed |= self.apply_join(&entry.handle, entry.addr, entry.port);
        }
        changed
    }

    pub fn get(&self, handle: &str) -> Option<PeerRecord> {
        self.peers.get(handle).map(|r| r.clone())
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.peers.contains_key(handle)
    }

    /// Ordered copy of the current mapping, for events and WHO replies.
    pub fn snapshot(&self) -> BTreeMap<String, (IpAddr, u16)> {
        self.peers
            .iter()
            .map(|r| (r.handle.clone(), (r.addr, r.port)))
            .collect()
    }

    /// Wire-ready KNOWNUSERS entries, ordered by handle.
    pub fn entries(&self) -> Vec<PeerInfo> {
        self.snapshot()
            .into_iter()
            .map(|(handle, (addr, port))| PeerInfo { handle, addr, port })
            .collect()
    }

    /// All records, for point-to-point propagation.
    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
