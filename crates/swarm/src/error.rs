use std::io;

use chain::ChainError;
use crypto::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    /// Codec failure: bad signature, unknown tag, wrong arity, or a field
    /// invariant violation.  The offending message is dropped.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Every advertised URL of the peer failed to dial.
    #[error("peer {0} is unreachable")]
    Unreachable(Address),
    /// An operation needed the client endpoint of a peer we do not hold.
    #[error("no client endpoint for peer {0}")]
    PeerNotFound(Address),
    #[error("swarm is already running")]
    AlreadyRunning,
    #[error("swarm is not running")]
    NotStarted,
    /// Offset lies outside the destination buffer.
    #[error("offset out of range")]
    Range,
    /// Destination buffer has insufficient room.
    #[error("destination buffer too small")]
    Arg,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl From<crypto::CryptoError> for SwarmError {
    fn from(err: crypto::CryptoError) -> Self {
        SwarmError::InvalidMessage(err.to_string())
    }
}
