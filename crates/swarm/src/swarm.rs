//! The swarm handle: peer-set collection operations, lifecycle, broadcast
//! helpers and the observable signals.
//!
//! A [`Swarm`] is a cheap clone over shared state.  `start` binds the server
//! endpoint, dials every known peer, then runs the gossip ticker and the
//! dispatcher concurrently until the caller's cancellation token fires;
//! `stop` is idempotent and sends a farewell delta before tearing the
//! endpoints down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chain::{Block, BlockHash, Chain, Tx, TxId};
use crypto::{Address, Keypair, PublicKey};

use crate::config::SwarmConfig;
use crate::error::SwarmError;
use crate::message::{Message, Peer};
use crate::peers::PeerTable;
use crate::transport::{self, ClientEndpoint, ServerEndpoint};

/// The chain the swarm synchronizes, shared with the rest of the node.
pub type ChainRef = Arc<parking_lot::Mutex<dyn Chain + Send>>;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) struct DistributeClock {
    pub last_distributed: i64,
    pub ticks: u64,
}

pub(crate) struct SwarmInner {
    pub keys: Keypair,
    pub listen_url: String,
    pub config: SwarmConfig,
    pub table: RwLock<PeerTable>,
    pub endpoints: RwLock<HashMap<Address, Arc<ClientEndpoint>>>,
    pub chain: RwLock<Option<ChainRef>>,
    pub running: AtomicBool,
    pub run_cancel: RwLock<CancellationToken>,
    /// Serializes applications of inbound deltas.
    pub receive: Mutex<()>,
    /// Serializes outbound delta distributions and owns the gossip clock.
    pub distribute: Mutex<DistributeClock>,
    pub last_received: AtomicI64,
    pub delta_distributed: Notify,
    pub delta_received: Notify,
    pub tx_received: Notify,
}

impl Drop for SwarmInner {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!(swarm = %self.keys.address(), "swarm dropped while running; best-effort stop");
            self.run_cancel.get_mut().cancel();
            self.endpoints.get_mut().clear();
        }
    }
}

#[derive(Clone)]
pub struct Swarm {
    pub(crate) inner: Arc<SwarmInner>,
}

impl Swarm {
    pub fn new(keys: Keypair, listen_url: impl Into<String>, dial_timeout: Duration) -> Self {
        let config = SwarmConfig {
            dial_timeout,
            ..SwarmConfig::default()
        };
        Self::with_config(keys, listen_url, config)
    }

    pub fn with_config(keys: Keypair, listen_url: impl Into<String>, config: SwarmConfig) -> Self {
        Self {
            inner: Arc::new(SwarmInner {
                keys,
                listen_url: listen_url.into(),
                config,
                table: RwLock::new(PeerTable::new()),
                endpoints: RwLock::new(HashMap::new()),
                chain: RwLock::new(None),
                running: AtomicBool::new(false),
                run_cancel: RwLock::new(CancellationToken::new()),
                receive: Mutex::new(()),
                distribute: Mutex::new(DistributeClock {
                    last_distributed: 0,
                    ticks: 0,
                }),
                last_received: AtomicI64::new(0),
                delta_distributed: Notify::new(),
                delta_received: Notify::new(),
                tx_received: Notify::new(),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.keys.address()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.inner.keys.public_key()
    }

    /// This node as a peer record other swarms can dial.
    pub fn local_peer(&self) -> Peer {
        Peer::new(*self.inner.keys.public_key(), vec![self.inner.listen_url.clone()])
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ── Peer-set collection operations ──────────────────────────────────

    pub fn contains(&self, peer: &Peer) -> bool {
        self.inner.table.read().contains(peer)
    }

    /// Insert a peer without dialing it.  The async [`Swarm::add_peers`]
    /// path is the one that establishes client endpoints while running.
    pub fn add(&self, peer: Peer) -> bool {
        if peer.public_key == *self.inner.keys.public_key() {
            return false;
        }
        let mut table = self.inner.table.write();
        if table.contains_key(&peer.address()) {
            return false;
        }
        table.insert(peer, now_ms());
        true
    }

    /// Unconditionally drop the peer from the live set, tombstoning it so
    /// the removal is gossiped on the next delta.
    pub fn remove(&self, peer: &Peer) -> bool {
        self.inner.endpoints.write().remove(&peer.address());
        self.inner.table.write().remove(peer, now_ms())
    }

    pub fn clear(&self) {
        self.inner.endpoints.write().clear();
        self.inner.table.write().clear();
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.table.read().peers()
    }

    pub fn len(&self) -> usize {
        self.inner.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_to(&self, out: &mut [Peer], offset: usize) -> Result<(), SwarmError> {
        self.inner.table.read().copy_to(out, offset)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Run the swarm against `chain` until `cancel` fires.  Binds the
    /// server endpoint, dials every known peer (storing pruned URL lists),
    /// then drives the gossip ticker and the dispatcher concurrently.
    /// Fails with `AlreadyRunning` on re-entry; catch-up and chain faults
    /// surface here.
    pub async fn start(
        &self,
        chain: ChainRef,
        distribute_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SwarmError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SwarmError::AlreadyRunning);
        }
        *self.inner.chain.write() = Some(chain);
        let run = cancel.child_token();
        *self.inner.run_cancel.write() = run.clone();

        let server = match ServerEndpoint::bind(&self.inner.listen_url, &self.inner.config).await {
            Ok(server) => server,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                *self.inner.chain.write() = None;
                return Err(err);
            }
        };
        info!(addr = %server.local_addr(), swarm = %self.address(), "swarm listening");

        let known = self.inner.table.read().entries();
        for (peer, timestamp) in known {
            match transport::dial(&peer, &self.inner.keys, &self.inner.config).await {
                Ok((endpoint, pruned)) => {
                    self.inner
                        .endpoints
                        .write()
                        .insert(pruned.address(), Arc::new(endpoint));
                    self.inner.table.write().insert(pruned, timestamp);
                }
                Err(err) => {
                    warn!(peer = %peer.address(), error = %err, "initial dial failed, dropping peer");
                    self.inner.table.write().remove_key(&peer.address());
                }
            }
        }

        let result = tokio::select! {
            _ = run.cancelled() => Ok(()),
            result = self.gossip_loop(distribute_interval, run.clone()) => result,
            result = self.dispatch_loop(server, run.clone()) => result,
        };
        run.cancel();
        self.stop().await?;
        result
    }

    /// Idempotent shutdown: tombstone ourselves, gossip a farewell delta,
    /// then close every endpoint.
    pub async fn stop(&self) -> Result<(), SwarmError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.run_cancel.read().clone().cancel();
        self.inner
            .table
            .write()
            .tombstone(self.local_peer(), now_ms());
        self.distribute_delta(false).await;
        self.inner.endpoints.write().clear();
        *self.inner.chain.write() = None;
        info!(swarm = %self.address(), "swarm stopped");
        Ok(())
    }

    // ── Broadcast helpers ───────────────────────────────────────────────

    /// Announce blocks to every connected peer as a `BlockHashes` message.
    pub async fn broadcast_blocks(&self, blocks: &[Block]) -> Result<(), SwarmError> {
        if !self.is_running() {
            return Err(SwarmError::NotStarted);
        }
        let hashes: Vec<BlockHash> = blocks.iter().map(Block::hash).collect();
        if hashes.is_empty() {
            return Ok(());
        }
        self.broadcast(&Message::BlockHashes(hashes)).await;
        Ok(())
    }

    /// Announce transactions to every connected peer as a `TxIds` message.
    pub async fn broadcast_txs(&self, txs: &[Tx]) -> Result<(), SwarmError> {
        if !self.is_running() {
            return Err(SwarmError::NotStarted);
        }
        let ids: Vec<TxId> = txs.iter().map(Tx::id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.broadcast(&Message::TxIds(ids)).await;
        Ok(())
    }

    // ── Observable signals ──────────────────────────────────────────────

    /// Fires after each outbound delta broadcast.
    pub fn delta_distributed(&self) -> &Notify {
        &self.inner.delta_distributed
    }

    /// Fires after each applied inbound delta.
    pub fn delta_received(&self) -> &Notify {
        &self.inner.delta_received
    }

    /// Fires after announced transactions were staged.
    pub fn tx_received(&self) -> &Notify {
        &self.inner.tx_received
    }

    // ── Shared-state helpers ────────────────────────────────────────────

    pub(crate) fn endpoint(&self, address: &Address) -> Option<Arc<ClientEndpoint>> {
        self.inner.endpoints.read().get(address).cloned()
    }

    pub(crate) fn chain_ref(&self) -> Option<ChainRef> {
        self.inner.chain.read().clone()
    }
}
