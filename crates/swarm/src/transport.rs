//! The two-socket transport.
//!
//! One [`ServerEndpoint`] accepts envelopes from any peer and can route a
//! reply back over the connection the request arrived on.  One
//! [`ClientEndpoint`] per known peer holds a persistent outbound stream used
//! for requests and gossip sends; its send/receive pairs are serialized by an
//! internal lock so FIFO request/reply correlation holds.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crypto::Keypair;

use crate::config::SwarmConfig;
use crate::error::SwarmError;
use crate::message::{self, Message, Peer};
use crate::wire;

/// Resolve a `tcp://host:port` URL (scheme optional) to a socket address.
pub(crate) fn socket_addr(url: &str) -> Result<SocketAddr, SwarmError> {
    let trimmed = url.strip_prefix("tcp://").unwrap_or(url);
    trimmed.parse().map_err(|_| {
        SwarmError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a dialable url: {url}"),
        ))
    })
}

/// An envelope received at the server endpoint, paired with the handle that
/// routes a reply back to the originating peer.
pub(crate) struct Inbound {
    pub frames: Vec<Vec<u8>>,
    pub reply: ReplyHandle,
}

/// Write side of the connection an inbound envelope arrived on.
#[derive(Clone)]
pub(crate) struct ReplyHandle {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
}

impl ReplyHandle {
    pub async fn send(&self, frames: Vec<Vec<u8>>) -> Result<(), SwarmError> {
        self.tx.send(frames).await.map_err(|_| {
            SwarmError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer connection closed before the reply was sent",
            ))
        })
    }
}

/// The bound inbound socket: a listener plus per-connection reader and
/// writer tasks feeding one queue of inbound envelopes.
pub(crate) struct ServerEndpoint {
    local: SocketAddr,
    inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
}

impl ServerEndpoint {
    pub async fn bind(url: &str, config: &SwarmConfig) -> Result<Self, SwarmError> {
        let addr = socket_addr(url)?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_queue);
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        let max_frame = config.max_frame_bytes;
        let outbound_queue = config.outbound_queue;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        let inbound_tx = inbound_tx.clone();
                        let conn_cancel = accept_cancel.child_token();
                        tokio::spawn(serve_connection(
                            stream,
                            remote,
                            inbound_tx,
                            conn_cancel,
                            max_frame,
                            outbound_queue,
                        ));
                    }
                    Err(err) => {
                        warn!(error = ?err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            local,
            inbound,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Wait up to `poll` for the next inbound envelope.  `None` on timeout,
    /// keeping the receive loop responsive to cancellation.
    pub async fn recv(&mut self, poll: Duration) -> Option<Inbound> {
        timeout(poll, self.inbound.recv()).await.ok().flatten()
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    max_frame: usize,
    outbound_queue: usize,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<Vec<u8>>>(outbound_queue);

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frames = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frames = reply_rx.recv() => match frames {
                    Some(frames) => frames,
                    None => break,
                },
            };
            if let Err(err) = wire::write_frames(&mut writer, &frames).await {
                debug!(%remote, error = ?err, "reply write failed");
                break;
            }
        }
    });

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = wire::read_frames(&mut reader, max_frame) => read,
        };
        match read {
            Ok(frames) => {
                let item = Inbound {
                    frames,
                    reply: ReplyHandle {
                        tx: reply_tx.clone(),
                    },
                };
                if inbound.send(item).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(%remote, error = ?err, "connection read loop exiting");
                break;
            }
        }
    }
    cancel.cancel();
}

/// Persistent outbound stream to one peer.  The internal lock serializes
/// whole send/receive exchanges; concurrent callers queue.
pub(crate) struct ClientEndpoint {
    stream: Mutex<TcpStream>,
    max_frame: usize,
}

impl ClientEndpoint {
    pub async fn connect(url: &str, max_frame: usize) -> Result<Self, SwarmError> {
        let stream = TcpStream::connect(socket_addr(url)?).await?;
        Ok(Self {
            stream: Mutex::new(stream),
            max_frame,
        })
    }

    /// Fire-and-forget send (gossip, announcements).
    pub async fn send(&self, frames: &[Vec<u8>]) -> Result<(), SwarmError> {
        let mut stream = self.stream.lock().await;
        wire::write_frames(&mut *stream, frames).await?;
        Ok(())
    }

    /// Send a request and read back exactly `expected` replies in order.
    pub async fn request(
        &self,
        frames: &[Vec<u8>],
        expected: usize,
    ) -> Result<Vec<Message>, SwarmError> {
        let mut stream = self.stream.lock().await;
        wire::write_frames(&mut *stream, frames).await?;
        let mut replies = Vec::with_capacity(expected);
        for _ in 0..expected {
            let reply = wire::read_frames(&mut *stream, self.max_frame).await?;
            replies.push(message::parse(&reply, false)?.message);
        }
        Ok(replies)
    }
}

/// Walk the peer's URL list in order, probing each with a signed `Ping`
/// until one answers inside the dial timeout.  The returned peer is pruned
/// to `[live, …later]`.
pub(crate) async fn dial(
    peer: &Peer,
    keys: &Keypair,
    config: &SwarmConfig,
) -> Result<(ClientEndpoint, Peer), SwarmError> {
    let ping = message::encode(&Message::Ping, keys)?;
    for (index, url) in peer.urls.iter().enumerate() {
        match probe(url, &ping, config).await {
            Ok(endpoint) => {
                debug!(peer = %peer.address(), url, "dialed peer");
                return Ok((endpoint, peer.pruned(index)));
            }
            Err(err) => {
                debug!(peer = %peer.address(), url, error = %err, "dial attempt failed");
            }
        }
    }
    Err(SwarmError::Unreachable(peer.address()))
}

async fn probe(
    url: &str,
    ping: &[Vec<u8>],
    config: &SwarmConfig,
) -> Result<ClientEndpoint, SwarmError> {
    timeout(config.dial_timeout, async {
        let endpoint = ClientEndpoint::connect(url, config.max_frame_bytes).await?;
        // Any verified reply marks this URL as the live one.
        endpoint.request(ping, 1).await?;
        Ok(endpoint)
    })
    .await
    .map_err(|_| {
        SwarmError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial of {url} timed out"),
        ))
    })?
}
