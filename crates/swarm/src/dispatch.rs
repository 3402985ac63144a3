//! The server receive loop and the inbound handler matrix.
//!
//! Each inbound envelope is parsed, then handled on its own task so a
//! handler that talks back to the announcer cannot deadlock the receive
//! loop.  Task growth is bounded by a worker-pool semaphore, with a tighter
//! bound on sync pulls; delta applies are additionally serialized by the
//! receive lock inside `apply_delta`.
//!
//! Per the propagation policy, codec and gossip faults are recovered here;
//! catch-up and chain faults are forwarded to the caller of `start`.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::SwarmError;
use crate::message::{self, Envelope, Message};
use crate::swarm::Swarm;
use crate::transport::{ReplyHandle, ServerEndpoint};

impl Swarm {
    pub(crate) async fn dispatch_loop(
        &self,
        mut server: ServerEndpoint,
        cancel: CancellationToken,
    ) -> Result<(), SwarmError> {
        let pool = Arc::new(Semaphore::new(self.inner.config.handler_pool));
        let pulls = Arc::new(Semaphore::new(self.inner.config.max_parallel_pulls));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<SwarmError>(1);

        loop {
            if let Ok(err) = fatal_rx.try_recv() {
                return Err(err);
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(inbound) = server.recv(self.inner.config.poll_timeout).await else {
                continue;
            };
            let envelope = match message::parse(&inbound.frames, true) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(swarm = %self.address(), error = %err, "dropping invalid message");
                    continue;
                }
            };
            let Ok(permit) = pool.clone().acquire_owned().await else {
                return Ok(());
            };
            let swarm = self.clone();
            let reply = inbound.reply;
            let pulls = pulls.clone();
            let fatal = fatal_tx.clone();
            let handler_cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let kind = envelope.message.kind();
                let result = tokio::select! {
                    _ = handler_cancel.cancelled() => Ok(()),
                    result = swarm.handle_message(envelope, reply, pulls) => result,
                };
                if let Err(err) = result {
                    // Anything a handler lets through is fatal by policy.
                    warn!(kind, error = %err, "handler fault, stopping the swarm");
                    let _ = fatal.try_send(err);
                }
            });
        }
    }

    async fn handle_message(
        &self,
        envelope: Envelope,
        reply: ReplyHandle,
        pulls: Arc<Semaphore>,
    ) -> Result<(), SwarmError> {
        let Some(identity) = envelope.identity else {
            // Server-side parsing always attaches an identity.
            return Ok(());
        };
        match envelope.message {
            Message::Ping => {
                debug!(swarm = %self.address(), peer = %identity, "ping");
                if let Err(err) = self.reply_with(&reply, &Message::Pong).await {
                    warn!(peer = %identity, error = %err, "pong reply failed");
                }
            }
            Message::PeerSetDelta(delta) => {
                self.apply_delta(delta).await;
            }
            Message::GetBlockHashes { locator, stop } => {
                let hashes = match self.chain_ref() {
                    Some(chain) => chain.lock().find_next_hashes(
                        &locator,
                        &stop,
                        self.inner.config.max_served_hashes,
                    ),
                    None => Vec::new(),
                };
                if let Err(err) = self.reply_with(&reply, &Message::BlockHashes(hashes)).await {
                    warn!(peer = %identity, error = %err, "block-hashes reply failed");
                }
            }
            Message::GetBlocks(hashes) => {
                // Hashes we do not hold are skipped without comment.
                let blocks: Vec<Vec<u8>> = match self.chain_ref() {
                    Some(chain) => {
                        let guard = chain.lock();
                        hashes
                            .iter()
                            .filter_map(|hash| guard.block(hash))
                            .map(|block| block.encode())
                            .collect()
                    }
                    None => Vec::new(),
                };
                for bytes in blocks {
                    if let Err(err) = self.reply_with(&reply, &Message::Block(bytes)).await {
                        warn!(peer = %identity, error = %err, "block reply failed");
                        break;
                    }
                }
            }
            Message::GetTxs(ids) => {
                let txs: Vec<Vec<u8>> = match self.chain_ref() {
                    Some(chain) => {
                        let guard = chain.lock();
                        ids.iter()
                            .filter_map(|id| guard.transaction(id))
                            .map(|tx| tx.encode())
                            .collect()
                    }
                    None => Vec::new(),
                };
                for bytes in txs {
                    if let Err(err) = self.reply_with(&reply, &Message::Tx(bytes)).await {
                        warn!(peer = %identity, error = %err, "tx reply failed");
                        break;
                    }
                }
            }
            Message::TxIds(ids) => {
                let Ok(_pull) = pulls.acquire_owned().await else {
                    return Ok(());
                };
                if let Err(err) = self.pull_announced_txs(identity, ids).await {
                    warn!(peer = %identity, error = %err, "transaction pull failed");
                }
            }
            Message::BlockHashes(hashes) => {
                let Ok(_pull) = pulls.acquire_owned().await else {
                    return Ok(());
                };
                match self.catch_up(identity, &hashes).await {
                    Ok(()) => {}
                    Err(SwarmError::PeerNotFound(peer)) => {
                        debug!(%peer, "ignoring announcement from unknown peer");
                    }
                    Err(err) => return Err(err),
                }
            }
            other @ (Message::Pong | Message::Block(_) | Message::Tx(_)) => {
                // Replies never arrive at the server endpoint; seeing one
                // means the codec and the dispatcher disagree.
                error!(
                    kind = other.kind(),
                    peer = %identity,
                    "unexpected reply variant at the server endpoint"
                );
                std::process::abort();
            }
        }
        Ok(())
    }

    async fn reply_with(&self, reply: &ReplyHandle, message: &Message) -> Result<(), SwarmError> {
        let frames = message::encode(message, &self.inner.keys)?;
        reply.send(frames).await
    }
}
