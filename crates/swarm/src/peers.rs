//! Peer bookkeeping: the live set, removal tombstones, and per-sender
//! last-seen timestamps.
//!
//! The live set is keyed by address (one entry per public key, held
//! structurally rather than by repair); the peer's current URL list is part
//! of the stored value.  Tombstones are the broadcast list of removed peers:
//! they feed the `removed` field of outgoing deltas and block re-adds from
//! `existing` refreshes until consumed or explicitly dropped by a re-add.

use std::collections::HashMap;

use crypto::Address;

use crate::error::SwarmError;
use crate::message::Peer;

#[derive(Clone, Debug)]
struct LiveEntry {
    peer: Peer,
    last_seen: i64,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    live: HashMap<Address, LiveEntry>,
    removed: HashMap<Address, (Peer, i64)>,
    last_seen: HashMap<Address, i64>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership by peer equality: same public key and same URL list.
    pub fn contains(&self, peer: &Peer) -> bool {
        self.live
            .get(&peer.address())
            .is_some_and(|entry| entry.peer == *peer)
    }

    pub fn contains_key(&self, address: &Address) -> bool {
        self.live.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.live.values().map(|entry| entry.peer.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(Peer, i64)> {
        self.live
            .values()
            .map(|entry| (entry.peer.clone(), entry.last_seen))
            .collect()
    }

    pub fn insert(&mut self, peer: Peer, timestamp: i64) {
        self.removed.remove(&peer.address());
        self.live.insert(peer.address(), LiveEntry { peer, last_seen: timestamp });
    }

    /// Drop the peer from the live set and tombstone it for broadcast.
    /// Returns whether a live entry was removed.
    pub fn remove(&mut self, peer: &Peer, timestamp: i64) -> bool {
        let address = peer.address();
        let removed = self.live.remove(&address).is_some();
        self.removed.insert(address, (peer.clone(), timestamp));
        removed
    }

    /// Drop whatever entry holds this public key, without tombstoning.
    pub fn remove_key(&mut self, address: &Address) -> bool {
        self.live.remove(address).is_some()
    }

    pub fn clear(&mut self) {
        self.live.clear();
        self.removed.clear();
        self.last_seen.clear();
    }

    pub fn tombstone(&mut self, peer: Peer, timestamp: i64) {
        self.removed.insert(peer.address(), (peer, timestamp));
    }

    pub fn drop_tombstone(&mut self, address: &Address) {
        self.removed.remove(address);
    }

    pub fn is_tombstoned(&self, address: &Address) -> bool {
        self.removed.contains_key(address)
    }

    /// Snapshot and consume tombstones with a timestamp at or before `now`.
    pub fn take_tombstones(&mut self, now: i64) -> Vec<Peer> {
        let due: Vec<Address> = self
            .removed
            .iter()
            .filter(|(_, (_, ts))| *ts <= now)
            .map(|(address, _)| *address)
            .collect();
        due.iter()
            .filter_map(|address| self.removed.remove(address))
            .map(|(peer, _)| peer)
            .collect()
    }

    /// Live peers whose timestamp falls in `(since, until]`.
    pub fn added_in_window(&self, since: i64, until: i64) -> Vec<Peer> {
        self.live
            .values()
            .filter(|entry| entry.last_seen > since && entry.last_seen <= until)
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// The live set minus the given peers (by address).
    pub fn peers_excluding(&self, excluded: &[Peer]) -> Vec<Peer> {
        self.live
            .values()
            .filter(|entry| {
                !excluded
                    .iter()
                    .any(|peer| peer.address() == entry.peer.address())
            })
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub fn note_last_seen(&mut self, address: Address, timestamp: i64) {
        let slot = self.last_seen.entry(address).or_insert(timestamp);
        *slot = (*slot).max(timestamp);
    }

    /// Copy the live set into `out` starting at `offset`.  A null
    /// destination is unrepresentable here; the remaining argument errors
    /// mirror the collection contract.
    pub fn copy_to(&self, out: &mut [Peer], offset: usize) -> Result<(), SwarmError> {
        if offset > out.len() {
            return Err(SwarmError::Range);
        }
        if out.len() - offset < self.live.len() {
            return Err(SwarmError::Arg);
        }
        for (slot, entry) in out[offset..].iter_mut().zip(self.live.values()) {
            *slot = entry.peer.clone();
        }
        Ok(())
    }
}
