//! Multi-node scenarios: handshake, gossip convergence, catch-up, reorg,
//! transaction staging and lifecycle.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chain::{Block, Chain, MemoryChain, Tx, build_blocks};
use crypto::Keypair;
use swarm::{ChainRef, Swarm, SwarmError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const GOSSIP_INTERVAL: Duration = Duration::from_millis(150);
const WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Reserve a loopback port the swarm can advertise to its peers.
fn free_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("reserve port");
    let addr = listener.local_addr().expect("local addr");
    format!("tcp://{addr}")
}

struct TestSwarm {
    swarm: Swarm,
    chain: Arc<parking_lot::Mutex<MemoryChain>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), SwarmError>>,
}

impl TestSwarm {
    async fn spawn(seed: u8, blocks: Vec<Block>, known: Vec<swarm::Peer>) -> Self {
        let url = free_url();
        let keys = Keypair::from_seed(&[seed; 32]);
        let swarm = Swarm::new(keys, url.clone(), DIAL_TIMEOUT);
        swarm.add_peers(known, None).await;

        let chain = Arc::new(parking_lot::Mutex::new(
            MemoryChain::with_blocks(blocks).expect("linked test blocks"),
        ));
        let dyn_chain: ChainRef = chain.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let swarm = swarm.clone();
            let cancel = cancel.clone();
            async move { swarm.start(dyn_chain, GOSSIP_INTERVAL, cancel).await }
        });
        wait_listening(&url).await;
        Self {
            swarm,
            chain,
            cancel,
            task,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.task
            .await
            .expect("swarm task join")
            .expect("swarm run");
        assert!(!self.swarm.is_running());
    }
}

async fn wait_listening(url: &str) {
    let addr = url.strip_prefix("tcp://").expect("tcp url").to_string();
    wait_until("server endpoint to listen", || {
        std::net::TcpStream::connect(&addr).is_ok()
    })
    .await;
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn handshake_heals_membership_both_ways() {
    init_tracing();
    let s1 = TestSwarm::spawn(1, Vec::new(), Vec::new()).await;
    let s2 = TestSwarm::spawn(2, Vec::new(), vec![s1.swarm.local_peer()]).await;

    // Dialing succeeded: s2 holds s1.
    wait_until("s2 to hold s1", || s2.swarm.contains(&s1.swarm.local_peer())).await;
    // Gossip introduces s2 back to s1 within a ticker cycle.
    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;
    assert_eq!(s1.swarm.len(), 1);
    assert_eq!(s2.swarm.len(), 1);

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn three_swarm_gossip_converges() {
    init_tracing();
    let s1 = TestSwarm::spawn(11, Vec::new(), Vec::new()).await;
    let s2 = TestSwarm::spawn(12, Vec::new(), vec![s1.swarm.local_peer()]).await;
    let s3 = TestSwarm::spawn(13, Vec::new(), vec![s2.swarm.local_peer()]).await;

    let all = [&s1, &s2, &s3];
    for swarm in &all {
        wait_until("live set to converge on the other two", || {
            swarm.swarm.len() == 2
        })
        .await;
    }
    for a in &all {
        for b in &all {
            if a.swarm.address() != b.swarm.address() {
                assert!(
                    a.swarm.peers().iter().any(|p| p.address() == b.swarm.address()),
                    "{} should know {}",
                    a.swarm.address(),
                    b.swarm.address()
                );
            }
        }
    }

    s3.shutdown().await;
    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn announced_block_is_appended() {
    init_tracing();
    let blocks = build_blocks(None, 2, 0);
    let genesis = blocks[0].clone();
    let b1 = blocks[1].clone();

    let s1 = TestSwarm::spawn(21, blocks.clone(), Vec::new()).await;
    let s2 = TestSwarm::spawn(22, vec![genesis], vec![s1.swarm.local_peer()]).await;

    // s1 needs its client endpoint to s2 before it can be asked for blocks.
    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;

    s1.swarm
        .broadcast_blocks(std::slice::from_ref(&b1))
        .await
        .expect("broadcast");

    wait_until("s2 to append the announced block", || {
        s2.chain.lock().tip().map(|tip| tip.hash()) == Some(b1.hash())
    })
    .await;
    assert!(s2.chain.lock().contains_block(&b1.hash()));

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn divergent_history_reorgs_onto_announced_branch() {
    init_tracing();
    let genesis = build_blocks(None, 1, 0).pop().expect("genesis");
    let good = build_blocks(Some(&genesis), 2, 1);
    let stale = build_blocks(Some(&genesis), 2, 9);

    let mut s1_blocks = vec![genesis.clone()];
    s1_blocks.extend(good.clone());
    let mut s2_blocks = vec![genesis.clone()];
    s2_blocks.extend(stale.clone());

    let s1 = TestSwarm::spawn(31, s1_blocks, Vec::new()).await;
    let s2 = TestSwarm::spawn(32, s2_blocks, vec![s1.swarm.local_peer()]).await;

    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;

    s1.swarm.broadcast_blocks(&good).await.expect("broadcast");

    wait_until("s2 to reorg onto the announced branch", || {
        s2.chain.lock().tip().map(|tip| tip.hash()) == Some(good[1].hash())
    })
    .await;
    let guard = s2.chain.lock();
    assert!(guard.contains_block(&good[0].hash()));
    assert!(!guard.contains_block(&stale[0].hash()));
    assert!(!guard.contains_block(&stale[1].hash()));
    assert_eq!(guard.height(), 3);
    drop(guard);

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn stale_announcement_is_ignored() {
    init_tracing();
    let genesis = build_blocks(None, 1, 0).pop().expect("genesis");
    let short_fork = build_blocks(Some(&genesis), 1, 5);
    let long_branch = build_blocks(Some(&genesis), 2, 6);

    let mut s1_blocks = vec![genesis.clone()];
    s1_blocks.extend(short_fork.clone());
    let mut s2_blocks = vec![genesis.clone()];
    s2_blocks.extend(long_branch.clone());

    let s1 = TestSwarm::spawn(71, s1_blocks, Vec::new()).await;
    let s2 = TestSwarm::spawn(72, s2_blocks, vec![s1.swarm.local_peer()]).await;

    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;

    // The announced branch tops out below our tip, so nothing changes.
    s1.swarm.broadcast_blocks(&short_fork).await.expect("broadcast");
    sleep(Duration::from_millis(800)).await;

    let guard = s2.chain.lock();
    assert_eq!(guard.tip().map(|tip| tip.hash()), Some(long_branch[1].hash()));
    assert!(!guard.contains_block(&short_fork[0].hash()));
    drop(guard);

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn announced_transaction_is_staged_once() {
    init_tracing();
    let genesis = build_blocks(None, 1, 0);
    let t1 = Tx::new(vec![0xAB, 0xCD]);

    let s1 = TestSwarm::spawn(41, genesis.clone(), Vec::new()).await;
    s1.chain.lock().insert_transaction(t1.clone());
    let s2 = TestSwarm::spawn(42, genesis, vec![s1.swarm.local_peer()]).await;

    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;

    s1.swarm
        .broadcast_txs(std::slice::from_ref(&t1))
        .await
        .expect("broadcast");

    wait_until("s2 to stage the announced transaction", || {
        s2.chain.lock().staged().iter().any(|tx| tx.id() == t1.id())
    })
    .await;

    // The signal fired exactly once for the single announcement.
    tokio::time::timeout(Duration::from_millis(200), s2.swarm.tx_received().notified())
        .await
        .expect("one stored signal");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), s2.swarm.tx_received().notified())
            .await
            .is_err(),
        "tx_received fired more than once"
    );

    s2.shutdown().await;
    s1.shutdown().await;
}

#[tokio::test]
async fn start_twice_fails_and_stop_is_idempotent() {
    init_tracing();
    let s1 = TestSwarm::spawn(51, Vec::new(), Vec::new()).await;

    let other_chain: ChainRef = Arc::new(parking_lot::Mutex::new(MemoryChain::new()));
    let err = s1
        .swarm
        .start(other_chain, GOSSIP_INTERVAL, CancellationToken::new())
        .await
        .expect_err("second start must fail");
    assert!(matches!(err, SwarmError::AlreadyRunning));

    s1.swarm.stop().await.expect("first stop");
    s1.swarm.stop().await.expect("second stop");
    assert!(!s1.swarm.is_running());

    s1.cancel.cancel();
    s1.task.await.expect("join").expect("run");
}

#[tokio::test]
async fn farewell_delta_removes_the_stopping_peer() {
    init_tracing();
    let s1 = TestSwarm::spawn(61, Vec::new(), Vec::new()).await;
    let s2 = TestSwarm::spawn(62, Vec::new(), vec![s1.swarm.local_peer()]).await;

    wait_until("s1 to hold s2", || s1.swarm.contains(&s2.swarm.local_peer())).await;
    wait_until("s2 to hold s1", || s2.swarm.contains(&s1.swarm.local_peer())).await;

    // Stopping gossips a farewell delta carrying the stopping peer itself.
    s1.shutdown().await;
    wait_until("s2 to drop the departed peer", || s2.swarm.len() == 0).await;

    s2.shutdown().await;
}
