use std::time::Duration;

/// Tunables for the swarm runtime.
#[derive(Clone, Debug)]
pub struct SwarmConfig {
    /// Budget for probing one peer across all of its advertised URLs.
    pub dial_timeout: Duration,
    /// Per-endpoint send budget during a gossip broadcast.
    pub broadcast_timeout: Duration,
    /// Server receive poll; bounds how long cancellation goes unobserved.
    pub poll_timeout: Duration,
    /// Every n-th gossip tick carries the full live set.
    pub full_state_every: u64,
    /// Upper bound on hashes served per `GetBlockHashes` request.
    pub max_served_hashes: usize,
    /// Total concurrent message handlers.
    pub handler_pool: usize,
    /// Concurrent sync pulls (block and transaction fetches).
    pub max_parallel_pulls: usize,
    /// Hard cap on a single wire frame.
    pub max_frame_bytes: usize,
    /// Inbound queue depth on the server endpoint.
    pub inbound_queue: usize,
    /// Outbound queue depth per server connection.
    pub outbound_queue: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            broadcast_timeout: Duration::from_millis(300),
            poll_timeout: Duration::from_millis(100),
            full_state_every: 10,
            max_served_hashes: 500,
            handler_pool: 32,
            max_parallel_pulls: 4,
            max_frame_bytes: 2 * 1024 * 1024,
            inbound_queue: 1024,
            outbound_queue: 64,
        }
    }
}
