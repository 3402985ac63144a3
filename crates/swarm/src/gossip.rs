//! The membership gossip engine.
//!
//! Every tick the swarm builds a [`PeerSetDelta`] from the peers added since
//! the last distribution and the consumed tombstones, with a full-state
//! refresh every tenth tick, and broadcasts it to every client endpoint.
//! Inbound deltas are applied strictly in arrival order under the receive
//! lock; distributions are serialized by the distribute lock.  The two locks
//! are only ever taken in the order receive → distribute: the one path that
//! needs both, first-encounter redistribution, releases the receive guard
//! before distributing.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crypto::Address;

use crate::error::SwarmError;
use crate::message::{Message, Peer, PeerSetDelta};
use crate::swarm::{Swarm, now_ms};
use crate::transport::{self, ClientEndpoint};

impl Swarm {
    /// Add peers to the live set at `timestamp` (now when absent), dialing
    /// each one while running.  Undialable peers are skipped.  Returns the
    /// peers actually added, in their stored (pruned) form.
    pub async fn add_peers(&self, peers: Vec<Peer>, timestamp: Option<i64>) -> Vec<Peer> {
        self.add_peers_at(peers, timestamp.unwrap_or_else(now_ms))
            .await
    }

    pub(crate) async fn add_peers_at(&self, peers: Vec<Peer>, timestamp: i64) -> Vec<Peer> {
        let mut added = Vec::new();
        for peer in peers {
            let address = peer.address();
            // A re-add always clears the peer's tombstone, even when the
            // peer turns out to be ourselves or already live.
            self.inner.table.write().drop_tombstone(&address);
            if peer.public_key == *self.inner.keys.public_key() {
                continue;
            }
            if self.inner.table.read().contains_key(&address) {
                continue;
            }
            let stored = if self.is_running() {
                match transport::dial(&peer, &self.inner.keys, &self.inner.config).await {
                    Ok((endpoint, pruned)) => {
                        self.inner
                            .endpoints
                            .write()
                            .insert(address, Arc::new(endpoint));
                        pruned
                    }
                    Err(err) => {
                        debug!(peer = %address, error = %err, "skipping undialable peer");
                        continue;
                    }
                }
            } else {
                peer
            };
            self.inner.table.write().insert(stored.clone(), timestamp);
            added.push(stored);
        }
        added
    }

    /// Drive periodic delta distribution until cancelled.  The tick counter
    /// advances unconditionally; every tenth tick refreshes the full state.
    pub(crate) async fn gossip_loop(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SwarmError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let full_state = {
                let mut clock = self.inner.distribute.lock().await;
                clock.ticks += 1;
                clock.ticks % self.inner.config.full_state_every == 0
            };
            self.distribute_delta(full_state).await;
        }
    }

    /// Build and broadcast one delta.  Nothing is sent when there is no
    /// change to report and no full-state refresh is due.
    pub(crate) async fn distribute_delta(&self, full_state: bool) {
        let mut clock = self.inner.distribute.lock().await;
        let now = now_ms();
        let (added, removed, existing) = {
            let mut table = self.inner.table.write();
            let added = table.added_in_window(clock.last_distributed, now);
            let removed = table.take_tombstones(now);
            let existing = full_state.then(|| table.peers_excluding(&added));
            (added, removed, existing)
        };
        if added.is_empty() && removed.is_empty() && !full_state {
            return;
        }
        clock.last_distributed = clock.last_distributed.max(now);
        debug!(
            swarm = %self.address(),
            added = added.len(),
            removed = removed.len(),
            full_state,
            "distributing delta"
        );
        let delta = PeerSetDelta {
            sender: self.local_peer(),
            timestamp: now,
            added,
            removed,
            existing,
        };
        self.broadcast(&Message::PeerSetDelta(delta)).await;
        self.inner.delta_distributed.notify_one();
    }

    /// Apply one inbound delta.  Serialized by the receive lock so deltas
    /// apply in arrival order.
    pub(crate) async fn apply_delta(&self, delta: PeerSetDelta) {
        let receive = self.inner.receive.lock().await;
        let sender_address = delta.sender.address();
        let first_encounter = !self.inner.table.read().contains_key(&sender_address);

        // An unknown sender introduces itself through its own delta.
        let mut working = delta.added.clone();
        if first_encounter
            && !working
                .iter()
                .any(|peer| peer.address() == sender_address)
        {
            working.push(delta.sender.clone());
        }

        for peer in &delta.removed {
            if peer.public_key == *self.inner.keys.public_key() {
                // A remote removing us is remembered for broadcast but never
                // evicts us from our own set.
                self.inner
                    .table
                    .write()
                    .tombstone(peer.clone(), delta.timestamp);
            } else {
                let address = peer.address();
                self.inner.table.write().remove_key(&address);
                self.inner.endpoints.write().remove(&address);
            }
        }

        if let Some(existing) = &delta.existing {
            let table = self.inner.table.read();
            for peer in existing {
                if table.is_tombstoned(&peer.address()) {
                    continue;
                }
                if working.iter().any(|known| known.address() == peer.address()) {
                    continue;
                }
                working.push(peer.clone());
            }
        }
        self.add_peers_at(working, delta.timestamp).await;

        self.inner
            .last_received
            .fetch_max(delta.timestamp, Ordering::SeqCst);
        self.inner
            .table
            .write()
            .note_last_seen(sender_address, delta.timestamp);
        drop(receive);

        if first_encounter {
            // Greet the newcomer with our full state right away instead of
            // waiting for the next refresh tick.
            self.distribute_delta(true).await;
        }
        self.inner.delta_received.notify_one();
    }

    /// Send one signed message to every client endpoint with a short
    /// per-send timeout.  Failures are logged and swallowed; the next tick
    /// retries.
    pub(crate) async fn broadcast(&self, message: &Message) {
        let frames = match crate::message::encode(message, &self.inner.keys) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return;
            }
        };
        let endpoints: Vec<(Address, Arc<ClientEndpoint>)> = self
            .inner
            .endpoints
            .read()
            .iter()
            .map(|(address, endpoint)| (*address, endpoint.clone()))
            .collect();
        for (address, endpoint) in endpoints {
            match timeout(self.inner.config.broadcast_timeout, endpoint.send(&frames)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(peer = %address, kind = message.kind(), error = %err, "broadcast send failed");
                }
                Err(_) => {
                    warn!(peer = %address, kind = message.kind(), "broadcast send timed out");
                }
            }
        }
    }
}
