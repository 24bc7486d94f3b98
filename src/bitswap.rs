use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cid::Cid;
use futures::channel::{mpsc, oneshot};
use futures::select;
use futures::StreamExt;
use libp2p_identity::PeerId;
use tracing::{debug, trace, warn};

use crate::block::{Block, BlockStore};
use crate::config::BitswapConfig;
use crate::control::Control;
use crate::engine::Engine;
use crate::error::BitswapError;
use crate::ledger::LedgerSnapshot;
use crate::message::BitswapMessage;
use crate::network::{Network, PeerEvent, Routing, Transport};
use crate::stat::Stats;
use crate::want_manager::WantManager;
use crate::wantlist::{Priority, WantType};

type Result<T> = std::result::Result<T, BitswapError>;

/// A registered local getter waiting on a cid.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Block>>,
}

/// Handed to a getter on registration: the waiter id (for release on drop)
/// and the resolution channel.
pub(crate) struct WantTicket {
    pub cid: Cid,
    pub waiter: u64,
    pub rx: oneshot::Receiver<Result<Block>>,
}

pub(crate) enum ControlCommand {
    WantBlock(Cid, oneshot::Sender<WantTicket>),
    CancelWaiter(Cid, u64),
    PutBlocks(Vec<Block>, oneshot::Sender<Result<()>>),
    Unwant(Cid, oneshot::Sender<()>),
    WantList(Option<PeerId>, oneshot::Sender<Vec<(Cid, Priority)>>),
    PeerLedger(PeerId, oneshot::Sender<Option<LedgerSnapshot>>),
    Peers(oneshot::Sender<Vec<PeerId>>),
    Stats(oneshot::Sender<Stats>),
    Stop(oneshot::Sender<()>),
}

/// The block exchange: binds a block store, a routing provider, the
/// want-manager and the decision engine into one event loop with a
/// `get`/`put`/`unwant` surface.
pub struct Bitswap<S: BlockStore> {
    store: S,
    network: Network,
    want_manager: WantManager,
    engine: Engine<S>,

    /// Local getters per cid, resolved on arrival or `put`.
    pending: HashMap<Cid, Vec<Waiter>>,
    next_waiter: u64,
    started: Arc<AtomicBool>,

    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    incoming_tx: mpsc::UnboundedSender<(PeerId, BitswapMessage)>,
    incoming_rx: mpsc::UnboundedReceiver<(PeerId, BitswapMessage)>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

impl<S: BlockStore> Bitswap<S> {
    pub fn new(
        store: S,
        transport: Arc<dyn Transport>,
        routing: Arc<dyn Routing>,
        config: BitswapConfig,
    ) -> Self {
        let network = Network::new(transport, routing, &config);
        let (peer_tx, peer_rx) = mpsc::unbounded();
        let (incoming_tx, incoming_rx) = mpsc::unbounded();
        let (control_tx, control_rx) = mpsc::unbounded();
        let want_manager = WantManager::new(network.clone(), config.wantlist_send_debounce);
        let engine = Engine::new(store.clone(), network.clone());
        Bitswap {
            store,
            network,
            want_manager,
            engine,
            pending: HashMap::new(),
            next_waiter: 0,
            started: Arc::new(AtomicBool::new(false)),
            peer_tx,
            peer_rx,
            incoming_tx,
            incoming_rx,
            control_tx,
            control_rx,
        }
    }

    /// The client handle. Any number of clones may exist; the loop shuts
    /// down when the last one is dropped or `stop()` is called.
    pub fn control(&self) -> Control {
        Control::new(self.control_tx.clone(), self.started.clone())
    }

    /// Registers the network handlers and spawns the processing loop.
    pub fn start(mut self) {
        self.network.start(self.incoming_tx.clone(), self.peer_tx.clone());
        self.started.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            self.process_loop().await;
        });
    }

    /// Message process loop; runs until `stop()` or the last control handle
    /// goes away.
    async fn process_loop(&mut self) {
        loop {
            select! {
                evt = self.peer_rx.next() => match evt {
                    Some(evt) => self.handle_peer_event(evt),
                    None => break,
                },
                msg = self.incoming_rx.next() => match msg {
                    Some((peer, msg)) => self.handle_incoming_message(peer, msg).await,
                    None => break,
                },
                cmd = self.control_rx.next() => match cmd {
                    Some(ControlCommand::Stop(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    Some(cmd) => self.handle_control_command(cmd).await,
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    fn handle_peer_event(&mut self, evt: PeerEvent) {
        match evt {
            PeerEvent::NewPeer(peer) => {
                trace!("peer {} connected", peer);
                self.want_manager.connected(peer);
                self.engine.peer_connected(peer);
            }
            PeerEvent::DeadPeer(peer) => {
                trace!("peer {} disconnected", peer);
                self.want_manager.disconnected(&peer);
                self.engine.peer_disconnected(&peer);
            }
        }
    }

    async fn handle_incoming_message(&mut self, peer: PeerId, msg: BitswapMessage) {
        let blocks = self.engine.message_received(peer, msg);
        if blocks.is_empty() {
            return;
        }
        trace!("received {} blocks from {}", blocks.len(), peer);

        let mut fresh = Vec::new();
        for block in &blocks {
            match self.store.has(&block.cid).await {
                Ok(true) => self.engine.record_incoming(&peer, block.data.len(), true),
                Ok(false) => {
                    self.engine.record_incoming(&peer, block.data.len(), false);
                    fresh.push(block.clone());
                }
                Err(e) => {
                    warn!("block store lookup failed for {}: {}", block.cid, e);
                    fresh.push(block.clone());
                }
            }
        }
        if !fresh.is_empty() {
            if let Err(e) = self.store.put_many(fresh).await {
                warn!("storing received blocks failed: {}", e);
            }
        }

        let cids: Vec<Cid> = blocks.iter().map(|b| b.cid.clone()).collect();
        for block in blocks {
            self.resolve_waiters(block);
        }
        // local demand is satisfied, retract the wants everywhere
        self.want_manager.cancel_wants(&cids, true);
        self.engine.blocks_stored(&cids);
    }

    async fn handle_control_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::WantBlock(cid, reply) => {
                let ticket = self.want_block(cid).await;
                let _ = reply.send(ticket);
            }
            ControlCommand::CancelWaiter(cid, id) => self.cancel_waiter(&cid, id),
            ControlCommand::PutBlocks(blocks, reply) => {
                let _ = reply.send(self.put_blocks(blocks).await);
            }
            ControlCommand::Unwant(cid, reply) => {
                self.unwant(&cid);
                let _ = reply.send(());
            }
            ControlCommand::WantList(peer, reply) => {
                let list = match peer {
                    Some(peer) => self.engine.wantlist_for_peer(&peer),
                    None => self
                        .want_manager
                        .wantlist()
                        .sorted_entries()
                        .into_iter()
                        .map(|e| (e.cid, e.priority))
                        .collect(),
                };
                let _ = reply.send(list);
            }
            ControlCommand::PeerLedger(peer, reply) => {
                let _ = reply.send(self.engine.ledger(&peer));
            }
            ControlCommand::Peers(reply) => {
                let _ = reply.send(self.want_manager.peers());
            }
            ControlCommand::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
            ControlCommand::Stop(_) => unreachable!("handled by the process loop"),
        }
    }

    /// Registers a getter for `cid`. A store hit resolves the ticket on the
    /// spot; otherwise the want goes out and, for the first getter, a
    /// provider lookup starts in the background.
    async fn want_block(&mut self, cid: Cid) -> WantTicket {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;

        match self.store.get(&cid).await {
            Ok(Some(block)) => {
                let _ = tx.send(Ok(block));
                return WantTicket { cid, waiter: id, rx };
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Err(BitswapError::Store(e.to_string())));
                return WantTicket { cid, waiter: id, rx };
            }
        }

        let first = !self.pending.contains_key(&cid);
        self.pending.entry(cid.clone()).or_default().push(Waiter { id, tx });
        self.want_manager.want_blocks(std::slice::from_ref(&cid), 1, WantType::Block);
        if first {
            let network = self.network.clone();
            let target = cid.clone();
            tokio::spawn(async move {
                if let Err(e) = network.find_and_connect(&target).await {
                    debug!("provider lookup for {} failed: {}", target, e);
                }
            });
        }
        WantTicket { cid, waiter: id, rx }
    }

    /// Releases one getter. The last one out retracts the want.
    fn cancel_waiter(&mut self, cid: &Cid, id: u64) {
        if let Some(waiters) = self.pending.get_mut(cid) {
            let before = waiters.len();
            waiters.retain(|w| w.id != id);
            if waiters.len() == before {
                return;
            }
            if waiters.is_empty() {
                self.pending.remove(cid);
            }
            self.want_manager.cancel_wants(std::slice::from_ref(cid), false);
        }
    }

    async fn put_blocks(&mut self, blocks: Vec<Block>) -> Result<()> {
        self.store
            .put_many(blocks.clone())
            .await
            .map_err(|e| BitswapError::Store(e.to_string()))?;

        let cids: Vec<Cid> = blocks.iter().map(|b| b.cid.clone()).collect();
        for block in blocks {
            let cid = block.cid.clone();
            self.resolve_waiters(block);
            let network = self.network.clone();
            tokio::spawn(async move {
                if let Err(e) = network.provide(&cid).await {
                    debug!("providing {} failed: {}", cid, e);
                }
            });
        }
        self.want_manager.cancel_wants(&cids, true);
        self.engine.blocks_stored(&cids);
        Ok(())
    }

    fn resolve_waiters(&mut self, block: Block) {
        if let Some(waiters) = self.pending.remove(&block.cid) {
            trace!("resolving {} getters of {}", waiters.len(), block.cid);
            for waiter in waiters {
                let _ = waiter.tx.send(Ok(block.clone()));
            }
        }
    }

    /// Fails every pending getter of `cid` and force-retracts the want.
    fn unwant(&mut self, cid: &Cid) {
        if let Some(waiters) = self.pending.remove(cid) {
            for waiter in waiters {
                let _ = waiter.tx.send(Err(BitswapError::Unwanted(cid.clone())));
            }
        }
        self.want_manager.cancel_wants(std::slice::from_ref(cid), true);
    }

    fn shutdown(&mut self) {
        debug!("bitswap shutting down");
        self.started.store(false, Ordering::SeqCst);
        self.network.stop();
        self.want_manager.stop();
        self.engine.stop();
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.tx.send(Err(BitswapError::Closing));
            }
        }
    }
}
