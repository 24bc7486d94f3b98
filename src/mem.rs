//! In-memory collaborators: a process-local transport switchboard, a
//! routing table and a block store.
//!
//! These back the integration tests and make the engine runnable without a
//! real peer-to-peer stack. Streams are chunk-channel duplex pipes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use cid::Cid;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use libp2p_identity::PeerId;

use crate::block::{Block, BlockStore};
use crate::error::BoxError;
use crate::network::{
    InboundStream, NegotiatedStream, PeerEvent, PeerInfo, ProtocolId, Routing, Transport,
};

/// Block store backed by a hash map.
#[derive(Clone, Default)]
pub struct MemStore {
    blocks: Arc<Mutex<HashMap<Cid, Block>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl BlockStore for MemStore {
    async fn has(&self, cid: &Cid) -> Result<bool, BoxError> {
        Ok(self.blocks.lock().unwrap().contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Block>, BoxError> {
        Ok(self.blocks.lock().unwrap().get(cid).cloned())
    }

    async fn put(&self, block: Block) -> Result<(), BoxError> {
        self.blocks.lock().unwrap().insert(block.cid.clone(), block);
        Ok(())
    }

    async fn put_many(&self, blocks: Vec<Block>) -> Result<(), BoxError> {
        let mut map = self.blocks.lock().unwrap();
        for block in blocks {
            map.insert(block.cid.clone(), block);
        }
        Ok(())
    }
}

#[derive(Default)]
struct NodeEntry {
    handlers: HashMap<ProtocolId, mpsc::UnboundedSender<InboundStream>>,
    topology: HashMap<usize, mpsc::UnboundedSender<PeerEvent>>,
    connected: HashSet<PeerId>,
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<PeerId, NodeEntry>,
    providers: HashMap<Cid, Vec<PeerId>>,
    /// Protocols of the streams delivered to each peer, in arrival order.
    delivered: HashMap<PeerId, Vec<ProtocolId>>,
    next_subscription: usize,
}

/// Switchboard connecting any number of in-process nodes.
#[derive(Clone, Default)]
pub struct MemHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport and routing endpoints for one node.
    pub fn attach(&self, peer: PeerId) -> (Arc<MemTransport>, Arc<MemRouting>) {
        self.inner.lock().unwrap().nodes.entry(peer).or_default();
        (
            Arc::new(MemTransport {
                hub: self.clone(),
                local: peer,
            }),
            Arc::new(MemRouting {
                hub: self.clone(),
                local: peer,
            }),
        )
    }

    /// Severs the connection between two peers, notifying both topologies.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let inner = self.inner.lock().unwrap();
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(node) = inner.nodes.get(local) {
                if node.connected.contains(remote) {
                    for tx in node.topology.values() {
                        let _ = tx.unbounded_send(PeerEvent::DeadPeer(*remote));
                    }
                }
            }
        }
        drop(inner);
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(a) {
            node.connected.remove(b);
        }
        if let Some(node) = inner.nodes.get_mut(b) {
            node.connected.remove(a);
        }
    }

    /// Protocols of the streams delivered to `peer` so far; one stream is
    /// one message, so this doubles as a wire message counter.
    pub fn delivered_streams(&self, peer: &PeerId) -> Vec<ProtocolId> {
        self.inner
            .lock()
            .unwrap()
            .delivered
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }
}

/// Transport endpoint of one node on a [`MemHub`].
pub struct MemTransport {
    hub: MemHub,
    local: PeerId,
}

#[async_trait]
impl Transport for MemTransport {
    fn handle(&self, protocols: Vec<ProtocolId>, incoming: mpsc::UnboundedSender<InboundStream>) {
        let mut inner = self.hub.inner.lock().unwrap();
        let node = inner.nodes.entry(self.local).or_default();
        for protocol in protocols {
            node.handlers.insert(protocol, incoming.clone());
        }
    }

    fn unhandle(&self, protocols: Vec<ProtocolId>) {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.local) {
            for protocol in protocols {
                node.handlers.remove(protocol);
            }
        }
    }

    async fn dial(&self, peer: &PeerId) -> Result<(), BoxError> {
        let local = self.local;
        let remote = *peer;
        if local == remote {
            return Err("cannot dial self".into());
        }
        let mut inner = self.hub.inner.lock().unwrap();
        if !inner.nodes.contains_key(&remote) {
            return Err(format!("peer {remote} is unreachable").into());
        }
        let fresh_local = inner
            .nodes
            .get_mut(&local)
            .map(|n| n.connected.insert(remote))
            .unwrap_or(false);
        let fresh_remote = inner
            .nodes
            .get_mut(&remote)
            .map(|n| n.connected.insert(local))
            .unwrap_or(false);
        if fresh_local {
            for tx in inner.nodes[&local].topology.values() {
                let _ = tx.unbounded_send(PeerEvent::NewPeer(remote));
            }
        }
        if fresh_remote {
            for tx in inner.nodes[&remote].topology.values() {
                let _ = tx.unbounded_send(PeerEvent::NewPeer(local));
            }
        }
        Ok(())
    }

    async fn new_stream(
        &self,
        peer: &PeerId,
        protocols: Vec<ProtocolId>,
    ) -> Result<NegotiatedStream, BoxError> {
        self.dial(peer).await?;
        let (protocol, handler) = {
            let mut inner = self.hub.inner.lock().unwrap();
            let negotiated = {
                let remote = inner.nodes.get(peer).ok_or_else(|| format!("peer {peer} is unreachable"))?;
                protocols
                    .iter()
                    .find_map(|p| remote.handlers.get(p).map(|tx| (*p, tx.clone())))
            };
            let Some((protocol, handler)) = negotiated else {
                return Err(format!("no protocol in common with {peer}").into());
            };
            inner.delivered.entry(*peer).or_default().push(protocol);
            (protocol, handler)
        };
        let (local_end, remote_end) = duplex();
        let inbound = InboundStream {
            remote: self.local,
            protocol,
            io: Box::new(remote_end),
        };
        if handler.unbounded_send(inbound).is_err() {
            return Err(format!("{peer} stopped accepting streams").into());
        }
        Ok(NegotiatedStream {
            protocol,
            io: Box::new(local_end),
        })
    }

    fn subscribe_topology(&self, events: mpsc::UnboundedSender<PeerEvent>) -> usize {
        let mut inner = self.hub.inner.lock().unwrap();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.nodes.entry(self.local).or_default().topology.insert(id, events);
        id
    }

    fn unsubscribe_topology(&self, id: usize) {
        let mut inner = self.hub.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.local) {
            node.topology.remove(&id);
        }
    }

    fn connections(&self) -> Vec<PeerId> {
        self.hub
            .inner
            .lock()
            .unwrap()
            .nodes
            .get(&self.local)
            .map(|n| n.connected.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Routing endpoint of one node on a [`MemHub`].
pub struct MemRouting {
    hub: MemHub,
    local: PeerId,
}

#[async_trait]
impl Routing for MemRouting {
    async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
    ) -> Result<BoxStream<'static, PeerInfo>, BoxError> {
        let providers: Vec<PeerInfo> = self
            .hub
            .inner
            .lock()
            .unwrap()
            .providers
            .get(cid)
            .map(|peers| {
                peers
                    .iter()
                    .take(limit)
                    .map(|p| PeerInfo {
                        peer_id: *p,
                        multiaddrs: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(stream::iter(providers).boxed())
    }

    async fn provide(&self, cid: &Cid) -> Result<(), BoxError> {
        let mut inner = self.hub.inner.lock().unwrap();
        let list = inner.providers.entry(cid.clone()).or_default();
        if !list.contains(&self.local) {
            list.push(self.local);
        }
        Ok(())
    }
}

/// One half of an in-memory duplex byte stream.
pub struct MemSocket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: VecDeque<u8>,
}

/// A connected pair of byte streams.
pub fn duplex() -> (MemSocket, MemSocket) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (
        MemSocket {
            tx: a_tx,
            rx: a_rx,
            buffer: VecDeque::new(),
        },
        MemSocket {
            tx: b_tx,
            rx: b_rx,
            buffer: VecDeque::new(),
        },
    )
}

impl AsyncRead for MemSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        while this.buffer.is_empty() {
            match Pin::new(&mut this.rx).poll_next(cx) {
                Poll::Ready(Some(chunk)) => this.buffer.extend(chunk),
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = this.buffer.len().min(buf.len());
        for (i, byte) in this.buffer.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for MemSocket {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.tx.unbounded_send(buf.to_vec()).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use crate::network::{BS_PROTO_V100, BS_PROTO_V110, BS_PROTO_V120};

    #[tokio::test]
    async fn duplex_carries_bytes_both_ways() {
        let (mut a, mut b) = duplex();
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        b.close().await.unwrap();
        let mut rest = Vec::new();
        a.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"pong");
    }

    #[tokio::test]
    async fn negotiation_follows_the_callers_preference() {
        let hub = MemHub::new();
        let alice = PeerId::random();
        let bob = PeerId::random();
        let (alice_transport, _) = hub.attach(alice);
        let (bob_transport, _) = hub.attach(bob);

        let (tx, _rx) = mpsc::unbounded();
        bob_transport.handle(vec![BS_PROTO_V110, BS_PROTO_V100], tx);

        let stream = alice_transport
            .new_stream(&bob, vec![BS_PROTO_V120, BS_PROTO_V110, BS_PROTO_V100])
            .await
            .unwrap();
        assert_eq!(stream.protocol, BS_PROTO_V110);
        assert_eq!(hub.delivered_streams(&bob), vec![BS_PROTO_V110]);

        let err = alice_transport.new_stream(&bob, vec![BS_PROTO_V120]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn dial_emits_topology_events_on_both_sides() {
        let hub = MemHub::new();
        let alice = PeerId::random();
        let bob = PeerId::random();
        let (alice_transport, _) = hub.attach(alice);
        let (bob_transport, _) = hub.attach(bob);

        let (alice_tx, mut alice_rx) = mpsc::unbounded();
        let (bob_tx, mut bob_rx) = mpsc::unbounded();
        alice_transport.subscribe_topology(alice_tx);
        bob_transport.subscribe_topology(bob_tx);

        alice_transport.dial(&bob).await.unwrap();
        assert!(matches!(alice_rx.next().await, Some(PeerEvent::NewPeer(p)) if p == bob));
        assert!(matches!(bob_rx.next().await, Some(PeerEvent::NewPeer(p)) if p == alice));

        // dialing again is a no-op
        alice_transport.dial(&bob).await.unwrap();
        assert!(alice_rx.try_next().is_err());
    }
}
