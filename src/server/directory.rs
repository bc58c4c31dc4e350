//! Peer directory: every server heard of through `SERVER_ANNOUNCE` gossip.
//!
//! Entries are never removed; servers are assumed not to crash once they
//! have announced themselves.

use std::collections::BTreeMap;

/// Minimum load difference before a login is redirected to a peer.
pub const REDIRECT_THRESHOLD: u32 = 2;

/// Last known state of a peer server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub load: u32,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    /// Keyed by server id; ordered so that tie-breaking is deterministic.
    peers: BTreeMap<String, PeerEntry>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce. Returns true if the peer was previously unknown.
    ///
    /// The address of a known peer is fixed at its first announce; later
    /// announces only refresh the load.
    pub fn upsert(&mut self, id: &str, hostname: &str, port: u16, load: u32) -> bool {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.load = load;
            return false;
        }

        self.peers.insert(
            id.to_owned(),
            PeerEntry {
                id: id.to_owned(),
                hostname: hostname.to_owned(),
                port,
                load,
            },
        );
        true
    }

    pub fn get(&self, id: &str) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    /// Pick the peer a client should be redirected to when this server
    /// carries `local_load` clients.
    ///
    /// A peer qualifies when its load is at least [`REDIRECT_THRESHOLD`] below
    /// ours. The least loaded qualifying peer wins; ties go to the lowest id.
    pub fn redirect_target(&self, local_load: u32) -> Option<&PeerEntry> {
        let mut best: Option<&PeerEntry> = None;
        for peer in self.peers.values() {
            if local_load.saturating_sub(peer.load) < REDIRECT_THRESHOLD {
                continue;
            }
            if best.map_or(true, |b| peer.load < b.load) {
                best = Some(peer);
            }
        }
        best
    }
}
