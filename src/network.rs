use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tracing::{debug, trace, warn};

use crate::config::{BitswapConfig, HashLoader};
use crate::error::{BitswapError, BoxError};
use crate::message::BitswapMessage;
use crate::MAX_BUF_SIZE;

/// Protocol identifier carried on a stream, e.g. `/ipfs/bitswap/1.2.0`.
pub type ProtocolId = &'static str;

pub const BS_PROTO_V100: ProtocolId = "/ipfs/bitswap/1.0.0";
pub const BS_PROTO_V110: ProtocolId = "/ipfs/bitswap/1.1.0";
pub const BS_PROTO_V120: ProtocolId = "/ipfs/bitswap/1.2.0";

/// Wire format revisions. `V110` and `V120` share one encoding; they differ
/// only in which fields the peers act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V100,
    V110,
    V120,
}

impl ProtocolVersion {
    pub fn protocol_id(self) -> ProtocolId {
        match self {
            ProtocolVersion::V100 => BS_PROTO_V100,
            ProtocolVersion::V110 => BS_PROTO_V110,
            ProtocolVersion::V120 => BS_PROTO_V120,
        }
    }

    pub fn from_protocol_id(id: &str) -> Option<ProtocolVersion> {
        match id {
            BS_PROTO_V100 => Some(ProtocolVersion::V100),
            BS_PROTO_V110 => Some(ProtocolVersion::V110),
            BS_PROTO_V120 => Some(ProtocolVersion::V120),
            _ => None,
        }
    }

    /// The protocols this node speaks, newest first so negotiation lands on
    /// the highest revision both sides support.
    pub fn advertised(b100_only: bool) -> Vec<ProtocolId> {
        if b100_only {
            vec![BS_PROTO_V100]
        } else {
            vec![BS_PROTO_V120, BS_PROTO_V110, BS_PROTO_V100]
        }
    }
}

/// Connection events delivered by the transport topology.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    NewPeer(PeerId),
    DeadPeer(PeerId),
}

/// A provider record from routing.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
}

/// Raw byte stream between two peers; framing happens above it.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// An outbound stream along with the protocol that was negotiated on it.
pub struct NegotiatedStream {
    pub protocol: ProtocolId,
    pub io: Box<dyn RawStream>,
}

/// An inbound stream accepted by the transport for a registered protocol.
pub struct InboundStream {
    pub remote: PeerId,
    pub protocol: ProtocolId,
    pub io: Box<dyn RawStream>,
}

/// The peer-to-peer transport: dialing, stream negotiation and topology.
///
/// Accepted streams for registered protocols are pushed into the handler
/// channel; negotiation picks the first protocol in the caller's list the
/// remote handles.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn handle(&self, protocols: Vec<ProtocolId>, incoming: mpsc::UnboundedSender<InboundStream>);
    fn unhandle(&self, protocols: Vec<ProtocolId>);
    async fn dial(&self, peer: &PeerId) -> Result<(), BoxError>;
    async fn new_stream(&self, peer: &PeerId, protocols: Vec<ProtocolId>)
        -> Result<NegotiatedStream, BoxError>;
    fn subscribe_topology(&self, events: mpsc::UnboundedSender<PeerEvent>) -> usize;
    fn unsubscribe_topology(&self, id: usize);
    fn connections(&self) -> Vec<PeerId>;
}

/// Content routing: provider records for cids.
#[async_trait]
pub trait Routing: Send + Sync + 'static {
    async fn find_providers(&self, cid: &Cid, limit: usize)
        -> Result<BoxStream<'static, PeerInfo>, BoxError>;
    async fn provide(&self, cid: &Cid) -> Result<(), BoxError>;
}

/// Binds the engine to its transport and routing collaborators: protocol
/// registration, dialing, framed message I/O and provider lookups.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    transport: Arc<dyn Transport>,
    routing: Arc<dyn Routing>,
    hash_loader: HashLoader,
    b100_only: bool,
    max_providers_per_request: usize,
    incoming_stream_timeout: Duration,
    max_inbound_streams: usize,
    max_outbound_streams: usize,
    running: AtomicBool,
    inbound_streams: Arc<AtomicUsize>,
    outbound_streams: AtomicUsize,
    topology_id: Mutex<Option<usize>>,
}

impl Network {
    pub fn new(transport: Arc<dyn Transport>, routing: Arc<dyn Routing>, config: &BitswapConfig) -> Self {
        Network {
            inner: Arc::new(NetworkInner {
                transport,
                routing,
                hash_loader: config.hash_loader.clone(),
                b100_only: config.b100_only,
                max_providers_per_request: config.max_providers_per_request,
                incoming_stream_timeout: config.incoming_stream_timeout,
                max_inbound_streams: config.max_inbound_streams,
                max_outbound_streams: config.max_outbound_streams,
                running: AtomicBool::new(false),
                inbound_streams: Arc::new(AtomicUsize::new(0)),
                outbound_streams: AtomicUsize::new(0),
                topology_id: Mutex::new(None),
            }),
        }
    }

    /// Registers the protocol handlers and the topology subscription, and
    /// replays already-open connections as connects.
    pub(crate) fn start(
        &self,
        incoming_tx: mpsc::UnboundedSender<(PeerId, BitswapMessage)>,
        peer_tx: mpsc::UnboundedSender<PeerEvent>,
    ) {
        let inner = &self.inner;
        inner.running.store(true, Ordering::SeqCst);

        let (stream_tx, mut stream_rx) = mpsc::unbounded();
        inner.transport.handle(ProtocolVersion::advertised(inner.b100_only), stream_tx);

        let accept_inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(stream) = stream_rx.next().await {
                let active = accept_inner.inbound_streams.clone();
                if active.fetch_add(1, Ordering::SeqCst) >= accept_inner.max_inbound_streams {
                    active.fetch_sub(1, Ordering::SeqCst);
                    debug!("refusing inbound stream from {}: at capacity", stream.remote);
                    continue;
                }
                let incoming_tx = incoming_tx.clone();
                let idle = accept_inner.incoming_stream_timeout;
                let hash_loader = accept_inner.hash_loader.clone();
                tokio::spawn(async move {
                    let remote = stream.remote;
                    if let Err(e) = read_loop(stream, incoming_tx, idle, hash_loader).await {
                        debug!("inbound stream from {} closed: {}", remote, e);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        let id = inner.transport.subscribe_topology(peer_tx.clone());
        *inner.topology_id.lock().unwrap() = Some(id);
        for peer in inner.transport.connections() {
            let _ = peer_tx.unbounded_send(PeerEvent::NewPeer(peer));
        }
    }

    /// Unregisters handlers and the topology subscription.
    pub(crate) fn stop(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.transport.unhandle(ProtocolVersion::advertised(inner.b100_only));
        if let Some(id) = inner.topology_id.lock().unwrap().take() {
            inner.transport.unsubscribe_topology(id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), BitswapError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BitswapError::NotStarted)
        }
    }

    /// Dials the peer; fails with [`BitswapError::NotStarted`] when stopped.
    pub async fn connect_to(&self, peer: &PeerId) -> Result<(), BitswapError> {
        self.ensure_running()?;
        self.inner.transport.dial(peer).await.map_err(|e| BitswapError::Dial {
            peer: *peer,
            error: e.to_string(),
        })
    }

    /// Opens a fresh stream, negotiates the best protocol, writes one
    /// length-prefixed message and closes the stream. Dials first in case
    /// the peer is not yet connected.
    pub async fn send_message(&self, peer: &PeerId, msg: &BitswapMessage) -> Result<(), BitswapError> {
        self.ensure_running()?;
        let inner = &self.inner;
        if inner.outbound_streams.fetch_add(1, Ordering::SeqCst) >= inner.max_outbound_streams {
            inner.outbound_streams.fetch_sub(1, Ordering::SeqCst);
            return Err(BitswapError::Dial {
                peer: *peer,
                error: "outbound stream budget exhausted".into(),
            });
        }
        let res = self.send_message_inner(peer, msg).await;
        inner.outbound_streams.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn send_message_inner(&self, peer: &PeerId, msg: &BitswapMessage) -> Result<(), BitswapError> {
        let inner = &self.inner;
        self.connect_to(peer).await?;

        let protocols = ProtocolVersion::advertised(inner.b100_only);
        let mut stream = inner
            .transport
            .new_stream(peer, protocols)
            .await
            .map_err(|e| BitswapError::Dial {
                peer: *peer,
                error: e.to_string(),
            })?;
        let version = ProtocolVersion::from_protocol_id(stream.protocol).ok_or_else(|| {
            BitswapError::Dial {
                peer: *peer,
                error: format!("negotiated unknown protocol {}", stream.protocol),
            }
        })?;

        let data = msg.to_bytes(version);
        trace!("sending {} bytes to {} over {}", data.len(), peer, stream.protocol);
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        stream.io.write_all(unsigned_varint::encode::usize(data.len(), &mut len_buf)).await?;
        stream.io.write_all(&data).await?;
        stream.io.close().await?;
        Ok(())
    }

    /// Providers of `cid` as routing reports them, capped at the configured
    /// provider budget.
    pub async fn find_providers(&self, cid: &Cid) -> Result<BoxStream<'static, PeerInfo>, BitswapError> {
        self.ensure_running()?;
        self.inner
            .routing
            .find_providers(cid, self.inner.max_providers_per_request)
            .await
            .map_err(|e| BitswapError::Routing(e.to_string()))
    }

    /// Looks up providers of `cid` and dials them in parallel, ignoring
    /// individual failures.
    pub async fn find_and_connect(&self, cid: &Cid) -> Result<(), BitswapError> {
        let providers = self.find_providers(cid).await?;
        let limit = self.inner.max_providers_per_request;
        providers
            .take(limit)
            .for_each_concurrent(limit, |info| {
                let network = self.clone();
                async move {
                    if let Err(e) = network.connect_to(&info.peer_id).await {
                        debug!("failed to connect to provider {}: {}", info.peer_id, e);
                    }
                }
            })
            .await;
        Ok(())
    }

    /// Publishes a provider record for `cid`.
    pub async fn provide(&self, cid: &Cid) -> Result<(), BitswapError> {
        self.ensure_running()?;
        self.inner
            .routing
            .provide(cid)
            .await
            .map_err(|e| BitswapError::Routing(e.to_string()))
    }
}

/// Reads length-prefixed frames until the remote closes the stream, the
/// idle window elapses or a frame fails to decode. The idle timer resets on
/// every received frame.
async fn read_loop(
    mut stream: InboundStream,
    incoming_tx: mpsc::UnboundedSender<(PeerId, BitswapMessage)>,
    idle: Duration,
    hash_loader: HashLoader,
) -> Result<(), BitswapError> {
    let version = match ProtocolVersion::from_protocol_id(stream.protocol) {
        Some(version) => version,
        None => {
            warn!("inbound stream with unknown protocol {}", stream.protocol);
            return Ok(());
        }
    };
    loop {
        let frame = match tokio::time::timeout(idle, read_frame(&mut stream.io)).await {
            Err(_) => {
                debug!("stream from {} idle for {:?}, aborting", stream.remote, idle);
                return Err(BitswapError::Timeout);
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(frame))) => frame,
            Ok(Err(e)) => return Err(e),
        };
        trace!("received {} byte frame from {}", frame.len(), stream.remote);
        let msg = BitswapMessage::from_bytes(version, &frame, &hash_loader)?;
        if incoming_tx.unbounded_send((stream.remote, msg)).is_err() {
            // engine is gone, nothing left to deliver to
            return Ok(());
        }
    }
}

/// Reads one varint length-prefixed frame; `None` on a clean end of stream.
async fn read_frame(io: &mut Box<dyn RawStream>) -> Result<Option<Vec<u8>>, BitswapError> {
    let len = match unsigned_varint::aio::read_usize(&mut *io).await {
        Ok(len) => len,
        Err(unsigned_varint::io::ReadError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_BUF_SIZE {
        return Err(BitswapError::MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocols_advertise_newest_first() {
        assert_eq!(
            ProtocolVersion::advertised(false),
            vec![BS_PROTO_V120, BS_PROTO_V110, BS_PROTO_V100]
        );
        assert_eq!(ProtocolVersion::advertised(true), vec![BS_PROTO_V100]);
    }

    #[test]
    fn protocol_ids_round_trip() {
        for version in [ProtocolVersion::V100, ProtocolVersion::V110, ProtocolVersion::V120] {
            assert_eq!(ProtocolVersion::from_protocol_id(version.protocol_id()), Some(version));
        }
        assert_eq!(ProtocolVersion::from_protocol_id("/ipfs/bitswap/0.9.0"), None);
    }
}
