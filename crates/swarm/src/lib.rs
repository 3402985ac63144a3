//! Peer-to-peer swarm for the node: membership gossip over signed deltas,
//! block and transaction serving, and chain catch-up, all over an
//! asymmetric request/reply transport.
//!
//! One server endpoint accepts envelopes from any peer; one client endpoint
//! per known peer carries requests and gossip the other way.  Peers are
//! identified by the address derived from their public key, and every
//! envelope is signed so the server side can attribute it.

#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod error;
mod gossip;
mod message;
mod peers;
mod swarm;
mod sync;
mod transport;
mod wire;

pub use config::SwarmConfig;
pub use error::SwarmError;
pub use message::{Message, Peer, PeerSetDelta};
pub use swarm::{ChainRef, Swarm};
