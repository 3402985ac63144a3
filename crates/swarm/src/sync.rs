//! Chain catch-up and announced-transaction pulls.
//!
//! A `BlockHashes` announcement either extends the local tip directly, or
//! reveals that the announcer sits on a longer branch: then the branch point
//! is located with our block locator, everything above it is deleted, the
//! gap is refetched, and the original announcement is re-applied.  An
//! announcement older than our tip is ignored.

use chain::{Block, BlockHash, Tx, TxId};
use tracing::debug;

use crate::error::SwarmError;
use crate::message::{self, Message};
use crate::swarm::Swarm;
use crate::transport::ClientEndpoint;

impl Swarm {
    /// Reconcile the local chain with blocks announced by `announcer`.
    /// Raises `PeerNotFound` without a client endpoint to the announcer;
    /// chain-level failures propagate.
    pub(crate) async fn catch_up(
        &self,
        announcer: crypto::Address,
        hashes: &[BlockHash],
    ) -> Result<(), SwarmError> {
        if hashes.is_empty() {
            return Ok(());
        }
        let endpoint = self
            .endpoint(&announcer)
            .ok_or(SwarmError::PeerNotFound(announcer))?;
        let endpoint = endpoint.as_ref();
        let chain = self.chain_ref().ok_or(SwarmError::NotStarted)?;
        let blocks = self.fetch_blocks(endpoint, hashes).await?;
        let oldest = blocks.first().expect("announcement checked non-empty");
        let latest = blocks.last().expect("announcement checked non-empty");

        if chain.lock().contains_block(&latest.hash()) {
            debug!(swarm = %self.address(), "announced blocks already incorporated");
            return Ok(());
        }

        let mut last_round_tip: Option<u64> = None;
        loop {
            let tip = { chain.lock().tip() };
            let connects = match &tip {
                None => true,
                Some(tip) => oldest.previous_hash == tip.hash(),
            };
            if connects {
                let mut guard = chain.lock();
                for block in &blocks {
                    guard.append(block.clone())?;
                }
                debug!(swarm = %self.address(), count = blocks.len(), "appended announced blocks");
                return Ok(());
            }

            let tip = tip.expect("a non-connecting announcement implies a local tip");
            if latest.index < tip.index {
                debug!(swarm = %self.address(), "stale announcement, ignoring");
                return Ok(());
            }

            // The announced branch reaches at least as high as ours: locate
            // the branch point and reorg onto it.
            let locator = { chain.lock().block_locator() };
            let request = message::encode(
                &Message::GetBlockHashes {
                    locator,
                    stop: oldest.hash(),
                },
                &self.inner.keys,
            )?;
            let mut replies = endpoint.request(&request, 1).await?;
            let range = match replies.pop() {
                Some(Message::BlockHashes(range)) => range,
                Some(other) => {
                    return Err(SwarmError::InvalidMessage(format!(
                        "expected block-hashes reply, got {}",
                        other.kind()
                    )));
                }
                None => unreachable!("request returned exactly one reply"),
            };
            // The first hash is the branch point: the highest block common
            // to both chains.
            let Some((branch_point, to_fetch)) = range.split_first() else {
                return Err(SwarmError::InvalidMessage(
                    "peer returned an empty hash range for our locator".into(),
                ));
            };
            { chain.lock().delete_after(branch_point)?; }
            debug!(
                swarm = %self.address(),
                branch_point = %branch_point,
                refetch = to_fetch.len(),
                "reorging onto announced branch"
            );
            if !to_fetch.is_empty() {
                let fetched = self.fetch_blocks(endpoint, to_fetch).await?;
                let mut guard = chain.lock();
                for block in fetched {
                    guard.append(block)?;
                }
            }

            // Each reorg round must leave the tip higher than the last one,
            // otherwise the peer is feeding us a non-advancing hash range.
            let round_tip = chain.lock().tip().map(|block| block.index);
            if let (Some(previous), Some(current)) = (last_round_tip, round_tip) {
                if current <= previous {
                    return Err(SwarmError::InvalidMessage(
                        "reorg made no progress against the announced branch".into(),
                    ));
                }
            }
            last_round_tip = round_tip;
            // Re-enter with the original announcement; its prefix should
            // now connect.
        }
    }

    /// Stage announced transactions we do not yet know, pulled from the
    /// announcer.  Signals `tx_received` when anything was staged.
    pub(crate) async fn pull_announced_txs(
        &self,
        announcer: crypto::Address,
        ids: Vec<TxId>,
    ) -> Result<(), SwarmError> {
        let chain = self.chain_ref().ok_or(SwarmError::NotStarted)?;
        let unknown: Vec<TxId> = {
            let guard = chain.lock();
            ids.into_iter()
                .filter(|id| !guard.contains_transaction(id))
                .collect()
        };
        if unknown.is_empty() {
            return Ok(());
        }
        let endpoint = self
            .endpoint(&announcer)
            .ok_or(SwarmError::PeerNotFound(announcer))?;
        let txs = self.fetch_txs(&endpoint, &unknown).await?;
        debug!(swarm = %self.address(), count = txs.len(), "staging pulled transactions");
        chain.lock().stage_transactions(txs);
        self.inner.tx_received.notify_one();
        Ok(())
    }

    /// Issue `GetBlocks` and read back exactly one `Block` per hash.
    async fn fetch_blocks(
        &self,
        endpoint: &ClientEndpoint,
        hashes: &[BlockHash],
    ) -> Result<Vec<Block>, SwarmError> {
        let request = message::encode(&Message::GetBlocks(hashes.to_vec()), &self.inner.keys)?;
        let replies = endpoint.request(&request, hashes.len()).await?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Message::Block(bytes) => Block::decode(&bytes).map_err(|err| {
                    SwarmError::InvalidMessage(format!("undecodable block: {err}"))
                }),
                other => Err(SwarmError::InvalidMessage(format!(
                    "expected block reply, got {}",
                    other.kind()
                ))),
            })
            .collect()
    }

    /// Issue `GetTxs` and read back exactly one `Tx` per id.
    async fn fetch_txs(
        &self,
        endpoint: &ClientEndpoint,
        ids: &[TxId],
    ) -> Result<Vec<Tx>, SwarmError> {
        let request = message::encode(&Message::GetTxs(ids.to_vec()), &self.inner.keys)?;
        let replies = endpoint.request(&request, ids.len()).await?;
        replies
            .into_iter()
            .map(|reply| match reply {
                Message::Tx(bytes) => Tx::decode(&bytes).map_err(|err| {
                    SwarmError::InvalidMessage(format!("undecodable transaction: {err}"))
                }),
                other => Err(SwarmError::InvalidMessage(format!(
                    "expected tx reply, got {}",
                    other.kind()
                ))),
            })
            .collect()
    }
}
