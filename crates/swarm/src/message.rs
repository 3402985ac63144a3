//! Typed messages and the signed multi-frame envelope they travel in.
//!
//! Wire form of an envelope:
//!
//! 1. single-byte type tag
//! 2. zero or more type-specific payload frames
//! 3. signature frame covering the tag and payload frames
//!
//! The signature embeds the sender's public key, so parsing an envelope at
//! the server endpoint recovers the sender's address and attaches it as the
//! message identity.  Replies read back on a client endpoint carry no
//! identity.

use chain::{BlockHash, BlockLocator, TxId};
use crypto::{Address, Keypair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// A remote node: its public key and the ordered list of URLs it can be
/// reached at.  Dialing prunes the list down to `[live, …later]`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub urls: Vec<String>,
}

impl Peer {
    pub fn new(public_key: PublicKey, urls: Vec<String>) -> Self {
        Self { public_key, urls }
    }

    pub fn address(&self) -> Address {
        self.public_key.address()
    }

    /// Keep the URL at `live_index` and everything after it.
    pub fn pruned(&self, live_index: usize) -> Self {
        Self {
            public_key: self.public_key,
            urls: self.urls[live_index..].to_vec(),
        }
    }
}

/// One round of membership gossip: what the sender added and removed since
/// its last delta, plus the full live set on refresh ticks.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PeerSetDelta {
    pub sender: Peer,
    pub timestamp: i64,
    pub added: Vec<Peer>,
    pub removed: Vec<Peer>,
    pub existing: Option<Vec<Peer>>,
}

const TAG_PING: u8 = 1;
const TAG_PONG: u8 = 2;
const TAG_PEER_SET_DELTA: u8 = 3;
const TAG_GET_BLOCK_HASHES: u8 = 4;
const TAG_BLOCK_HASHES: u8 = 5;
const TAG_GET_BLOCKS: u8 = 6;
const TAG_BLOCK: u8 = 7;
const TAG_GET_TXS: u8 = 8;
const TAG_TX: u8 = 9;
const TAG_TX_IDS: u8 = 10;

/// The closed message set exchanged between swarm nodes.  `Block` and `Tx`
/// carry canonical chain bytes the swarm never interprets.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Ping,
    Pong,
    PeerSetDelta(PeerSetDelta),
    GetBlockHashes {
        locator: BlockLocator,
        stop: BlockHash,
    },
    BlockHashes(Vec<BlockHash>),
    GetBlocks(Vec<BlockHash>),
    Block(Vec<u8>),
    GetTxs(Vec<TxId>),
    Tx(Vec<u8>),
    TxIds(Vec<TxId>),
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::Ping => TAG_PING,
            Message::Pong => TAG_PONG,
            Message::PeerSetDelta(_) => TAG_PEER_SET_DELTA,
            Message::GetBlockHashes { .. } => TAG_GET_BLOCK_HASHES,
            Message::BlockHashes(_) => TAG_BLOCK_HASHES,
            Message::GetBlocks(_) => TAG_GET_BLOCKS,
            Message::Block(_) => TAG_BLOCK,
            Message::GetTxs(_) => TAG_GET_TXS,
            Message::Tx(_) => TAG_TX,
            Message::TxIds(_) => TAG_TX_IDS,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::PeerSetDelta(_) => "peer-set-delta",
            Message::GetBlockHashes { .. } => "get-block-hashes",
            Message::BlockHashes(_) => "block-hashes",
            Message::GetBlocks(_) => "get-blocks",
            Message::Block(_) => "block",
            Message::GetTxs(_) => "get-txs",
            Message::Tx(_) => "tx",
            Message::TxIds(_) => "tx-ids",
        }
    }
}

/// A parsed envelope.  `identity` is the recovered sender address when the
/// envelope arrived at the server endpoint, absent on client-side replies.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub message: Message,
    pub identity: Option<Address>,
}

/// Digest signed by the sender: length-prefixed concatenation of the tag and
/// payload frames, hashed so the signature input stays fixed-size.
fn signing_digest(frames: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for frame in frames {
        hasher.update(&(frame.len() as u64).to_le_bytes());
        hasher.update(frame);
    }
    *hasher.finalize().as_bytes()
}

fn payload<T: Serialize>(value: &T) -> Result<Vec<u8>, SwarmError> {
    Ok(codec::to_vec_cbor(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8], what: &str) -> Result<T, SwarmError> {
    codec::from_slice_cbor(frame)
        .map_err(|err| SwarmError::InvalidMessage(format!("bad {what} payload: {err}")))
}

/// Encode and sign a message into wire frames.
pub fn encode(message: &Message, keys: &Keypair) -> Result<Vec<Vec<u8>>, SwarmError> {
    let mut frames = vec![vec![message.tag()]];
    match message {
        Message::Ping | Message::Pong => {}
        Message::PeerSetDelta(delta) => frames.push(payload(delta)?),
        Message::GetBlockHashes { locator, stop } => {
            frames.push(payload(locator)?);
            frames.push(payload(stop)?);
        }
        Message::BlockHashes(hashes) => frames.push(payload(hashes)?),
        Message::GetBlocks(hashes) => frames.push(payload(hashes)?),
        Message::Block(bytes) => frames.push(bytes.clone()),
        Message::GetTxs(ids) => frames.push(payload(ids)?),
        Message::Tx(bytes) => frames.push(bytes.clone()),
        Message::TxIds(ids) => frames.push(payload(ids)?),
    }
    let signature = keys.sign(&signing_digest(&frames));
    frames.push(signature.to_bytes().to_vec());
    Ok(frames)
}

/// Parse and verify wire frames.  `server_side` controls whether the
/// recovered sender address is attached as the message identity.
pub fn parse(frames: &[Vec<u8>], server_side: bool) -> Result<Envelope, SwarmError> {
    if frames.len() < 2 {
        return Err(SwarmError::InvalidMessage(format!(
            "envelope has {} frames, expected at least 2",
            frames.len()
        )));
    }
    let (signature_frame, signed) = frames.split_last().expect("length checked above");
    let signature = Signature::from_bytes(signature_frame)?;
    let sender = signature.verify(&signing_digest(signed))?;

    let tag_frame = &signed[0];
    if tag_frame.len() != 1 {
        return Err(SwarmError::InvalidMessage(
            "type tag frame must be a single byte".into(),
        ));
    }
    let body = &signed[1..];
    let message = match tag_frame[0] {
        TAG_PING => {
            expect_arity(body, 0, "ping")?;
            Message::Ping
        }
        TAG_PONG => {
            expect_arity(body, 0, "pong")?;
            Message::Pong
        }
        TAG_PEER_SET_DELTA => {
            expect_arity(body, 1, "peer-set-delta")?;
            let delta: PeerSetDelta = decode(&body[0], "peer-set-delta")?;
            if delta.sender.urls.is_empty() {
                return Err(SwarmError::InvalidMessage(
                    "delta sender advertises no urls".into(),
                ));
            }
            Message::PeerSetDelta(delta)
        }
        TAG_GET_BLOCK_HASHES => {
            expect_arity(body, 2, "get-block-hashes")?;
            let locator: BlockLocator = decode(&body[0], "locator")?;
            if locator.is_empty() {
                return Err(SwarmError::InvalidMessage(
                    "get-block-hashes carries an empty locator".into(),
                ));
            }
            let stop: BlockHash = decode(&body[1], "stop hash")?;
            Message::GetBlockHashes { locator, stop }
        }
        TAG_BLOCK_HASHES => {
            expect_arity(body, 1, "block-hashes")?;
            Message::BlockHashes(decode(&body[0], "block-hashes")?)
        }
        TAG_GET_BLOCKS => {
            expect_arity(body, 1, "get-blocks")?;
            let hashes: Vec<BlockHash> = decode(&body[0], "get-blocks")?;
            if hashes.is_empty() {
                return Err(SwarmError::InvalidMessage(
                    "get-blocks requests no hashes".into(),
                ));
            }
            Message::GetBlocks(hashes)
        }
        TAG_BLOCK => {
            expect_arity(body, 1, "block")?;
            Message::Block(body[0].clone())
        }
        TAG_GET_TXS => {
            expect_arity(body, 1, "get-txs")?;
            let ids: Vec<TxId> = decode(&body[0], "get-txs")?;
            if ids.is_empty() {
                return Err(SwarmError::InvalidMessage(
                    "get-txs requests no ids".into(),
                ));
            }
            Message::GetTxs(ids)
        }
        TAG_TX => {
            expect_arity(body, 1, "tx")?;
            Message::Tx(body[0].clone())
        }
        TAG_TX_IDS => {
            expect_arity(body, 1, "tx-ids")?;
            let ids: Vec<TxId> = decode(&body[0], "tx-ids")?;
            if ids.is_empty() {
                return Err(SwarmError::InvalidMessage(
                    "tx-ids announces no ids".into(),
                ));
            }
            Message::TxIds(ids)
        }
        other => {
            return Err(SwarmError::InvalidMessage(format!(
                "unknown message tag {other}"
            )));
        }
    };

    Ok(Envelope {
        message,
        identity: server_side.then_some(sender),
    })
}

fn expect_arity(body: &[Vec<u8>], expected: usize, kind: &str) -> Result<(), SwarmError> {
    if body.len() == expected {
        Ok(())
    } else {
        Err(SwarmError::InvalidMessage(format!(
            "{kind} carries {} payload frames, expected {expected}",
            body.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::build_blocks;

    fn keys() -> Keypair {
        Keypair::from_seed(&[42u8; 32])
    }

    fn peer(seed: u8) -> Peer {
        let keys = Keypair::from_seed(&[seed; 32]);
        Peer::new(*keys.public_key(), vec![format!("tcp://127.0.0.1:{}", 5000 + seed as u16)])
    }

    fn sample_messages() -> Vec<Message> {
        let block = build_blocks(None, 1, 1).pop().unwrap();
        let tx = chain::Tx::new(vec![9, 9]);
        vec![
            Message::Ping,
            Message::Pong,
            Message::PeerSetDelta(PeerSetDelta {
                sender: peer(1),
                timestamp: 1_700_000_000_123,
                added: vec![peer(2)],
                removed: vec![peer(3)],
                existing: Some(vec![peer(2), peer(4)]),
            }),
            Message::GetBlockHashes {
                locator: BlockLocator(vec![block.hash()]),
                stop: BlockHash([5u8; 32]),
            },
            Message::BlockHashes(vec![block.hash()]),
            Message::GetBlocks(vec![block.hash()]),
            Message::Block(block.encode()),
            Message::GetTxs(vec![tx.id()]),
            Message::Tx(tx.encode()),
            Message::TxIds(vec![tx.id()]),
        ]
    }

    #[test]
    fn every_variant_round_trips_with_identity() {
        let keys = keys();
        for message in sample_messages() {
            let frames = encode(&message, &keys).expect("encode");
            let envelope = parse(&frames, true).expect("parse");
            assert_eq!(envelope.message, message);
            assert_eq!(envelope.identity, Some(keys.address()));
        }
    }

    #[test]
    fn client_side_parse_has_no_identity() {
        let frames = encode(&Message::Pong, &keys()).expect("encode");
        let envelope = parse(&frames, false).expect("parse");
        assert!(envelope.identity.is_none());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let keys = keys();
        let message = Message::BlockHashes(vec![BlockHash([1u8; 32])]);
        let mut frames = encode(&message, &keys).expect("encode");
        frames[1][0] ^= 0xff;
        assert!(matches!(
            parse(&frames, true),
            Err(SwarmError::InvalidMessage(_))
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let keys = keys();
        let mut frames = vec![vec![0xABu8]];
        let signature = keys.sign(&signing_digest(&frames));
        frames.push(signature.to_bytes().to_vec());
        let err = parse(&frames, true).unwrap_err();
        assert!(matches!(err, SwarmError::InvalidMessage(_)));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let keys = keys();
        let mut frames = vec![vec![TAG_PING], vec![1, 2, 3]];
        let signature = keys.sign(&signing_digest(&frames));
        frames.push(signature.to_bytes().to_vec());
        assert!(matches!(
            parse(&frames, true),
            Err(SwarmError::InvalidMessage(_))
        ));
    }

    #[test]
    fn empty_locator_violates_invariant() {
        let keys = keys();
        let message = Message::GetBlockHashes {
            locator: BlockLocator(Vec::new()),
            stop: BlockHash([0u8; 32]),
        };
        // Encode does not enforce invariants; parse must.
        let frames = encode(&message, &keys).expect("encode");
        assert!(matches!(
            parse(&frames, true),
            Err(SwarmError::InvalidMessage(_))
        ));
    }

    #[test]
    fn empty_tx_announcement_violates_invariant() {
        let keys = keys();
        let frames = encode(&Message::TxIds(Vec::new()), &keys).expect("encode");
        assert!(matches!(
            parse(&frames, true),
            Err(SwarmError::InvalidMessage(_))
        ));
    }

    #[test]
    fn pruning_keeps_the_live_suffix() {
        let mut peer = peer(1);
        peer.urls = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(peer.pruned(1).urls, vec!["b".to_string(), "c".to_string()]);
    }
}
