use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cid::Cid;
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p_identity::PeerId;
use tracing::{debug, trace, warn};

use crate::block::{Block, BlockStore};
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::message::{BitswapMessage, BlockPresence, Entry};
use crate::network::Network;
use crate::stat::Stats;
use crate::wantlist::{Priority, WantType};

/// Quiet window before a response worker scans the peer's wantlist, so a
/// burst of updates (wants immediately followed by cancels) is observed as
/// one state.
const SEND_BATCH_DELAY: Duration = Duration::from_millis(10);

struct PeerState {
    ledger: Arc<Mutex<Ledger>>,
    stats: Arc<Stats>,
    /// Wake channel of the response worker; `None` while disconnected.
    worker: Option<mpsc::UnboundedSender<()>>,
}

impl PeerState {
    fn new() -> Self {
        PeerState {
            ledger: Arc::new(Mutex::new(Ledger::new())),
            stats: Arc::new(Stats::default()),
            worker: None,
        }
    }

    fn wake(&self) {
        if let Some(worker) = &self.worker {
            let _ = worker.unbounded_send(());
        }
    }
}

/// Serves remote wantlists from the local store and keeps per-peer ledgers.
///
/// One response worker runs per connected peer: responses to a peer are
/// strictly sequential while different peers are served concurrently, so a
/// slow remote only ever delays its own queue.
pub(crate) struct Engine<S: BlockStore> {
    peers: HashMap<PeerId, PeerState>,
    store: S,
    network: Network,
}

impl<S: BlockStore> Engine<S> {
    pub fn new(store: S, network: Network) -> Self {
        Engine {
            peers: HashMap::new(),
            store,
            network,
        }
    }

    /// Makes sure a ledger exists and the response worker is running.
    pub fn peer_connected(&mut self, peer: PeerId) {
        let store = self.store.clone();
        let network = self.network.clone();
        let state = self.peers.entry(peer).or_insert_with(PeerState::new);
        if state.worker.is_none() {
            let (tx, rx) = mpsc::unbounded();
            tokio::spawn(respond_loop(
                peer,
                state.ledger.clone(),
                state.stats.clone(),
                store,
                network,
                rx,
            ));
            state.worker = Some(tx);
        }
    }

    /// Stops the response worker. The ledger is retained, accounting is
    /// cumulative over the life of the engine.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.worker = None;
        }
    }

    /// Ingests a message from `peer`: accounts the received bytes, applies
    /// the wantlist update and schedules response work. Returns the blocks
    /// the message carried; storing them and waking local getters is the
    /// coordinator's job.
    pub fn message_received(&mut self, peer: PeerId, mut msg: BitswapMessage) -> Vec<Block> {
        // inbound data can beat the topology event for a fresh connection
        self.peer_connected(peer);
        let state = self.peers.get_mut(&peer).expect("peer registered above");

        let blocks = msg.take_blocks();
        {
            let mut ledger = state.ledger.lock().unwrap();
            for block in &blocks {
                ledger.received_bytes(block.data.len());
                // a peer that sends us a block evidently has it
                ledger.cancel_want(&block.cid);
            }
            let entries: Vec<Entry> = msg.wantlist().cloned().collect();
            ledger.apply_update(msg.full(), entries.iter());
        }
        state.wake();
        blocks
    }

    /// Statistics hook for blocks accepted by the coordinator.
    pub fn record_incoming(&self, peer: &PeerId, bytes: usize, duplicate: bool) {
        if let Some(state) = self.peers.get(peer) {
            if duplicate {
                state.stats.update_incoming_duplicate(bytes as u64);
            } else {
                state.stats.update_incoming_unique(bytes as u64);
            }
        }
    }

    /// Wakes the workers of peers that want any of the freshly stored cids.
    pub fn blocks_stored(&mut self, cids: &[Cid]) {
        for state in self.peers.values() {
            let wants_one = {
                let ledger = state.ledger.lock().unwrap();
                cids.iter().any(|cid| ledger.wantlist.contains(cid))
            };
            if wants_one {
                state.wake();
            }
        }
    }

    pub fn ledger(&self, peer: &PeerId) -> Option<LedgerSnapshot> {
        self.peers.get(peer).map(|state| state.ledger.lock().unwrap().snapshot())
    }

    /// The wantlist `peer` has open with us, as recorded in its ledger.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<(Cid, Priority)> {
        self.peers
            .get(peer)
            .map(|state| state.ledger.lock().unwrap().snapshot().wantlist)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Stats {
        let total = Stats::default();
        for state in self.peers.values() {
            total.add_assign(&state.stats);
        }
        total
    }

    /// Stops every response worker.
    pub fn stop(&mut self) {
        for state in self.peers.values_mut() {
            state.worker = None;
        }
    }
}

/// One pass per wake: wait out the batch window, snapshot what the peer
/// still wants, serve what the store has in one response message.
async fn respond_loop<S: BlockStore>(
    peer: PeerId,
    ledger: Arc<Mutex<Ledger>>,
    stats: Arc<Stats>,
    store: S,
    network: Network,
    mut wake_rx: mpsc::UnboundedReceiver<()>,
) {
    while let Some(()) = wake_rx.next().await {
        tokio::time::sleep(SEND_BATCH_DELAY).await;
        // collapse wakes that arrived inside the window
        while let Ok(Some(())) = wake_rx.try_next() {}

        let wanted = { ledger.lock().unwrap().wantlist.serve_order() };
        if wanted.is_empty() {
            continue;
        }

        let mut msg = BitswapMessage::new(false);
        // (cid, data length) pairs this round answers; presences count zero
        let mut served: Vec<(Cid, usize)> = Vec::new();
        for entry in wanted {
            match entry.want_type {
                WantType::Block => match store.get(&entry.cid).await {
                    Ok(Some(block)) => {
                        served.push((entry.cid.clone(), block.data.len()));
                        msg.add_block(block);
                    }
                    // keep the want open, a later put may satisfy it
                    Ok(None) => {}
                    Err(e) => warn!("block store failed reading {}: {}", entry.cid, e),
                },
                WantType::Have => match store.has(&entry.cid).await {
                    Ok(true) => {
                        served.push((entry.cid.clone(), 0));
                        msg.add_block_presence(entry.cid.clone(), BlockPresence::Have);
                    }
                    Ok(false) => {
                        if entry.send_dont_have {
                            served.push((entry.cid.clone(), 0));
                            msg.add_block_presence(entry.cid.clone(), BlockPresence::DontHave);
                        }
                    }
                    Err(e) => warn!("block store failed probing {}: {}", entry.cid, e),
                },
            }
        }
        if msg.is_empty() {
            continue;
        }

        match network.send_message(&peer, &msg).await {
            Ok(()) => {
                let mut blocks_sent = 0;
                let mut bytes_sent = 0;
                {
                    // delivery confirmed, the answered entries come off the
                    // wantlist and the bytes go on the ledger
                    let mut ledger = ledger.lock().unwrap();
                    for (cid, len) in &served {
                        ledger.wantlist.remove_force(cid);
                        if *len > 0 {
                            ledger.sent_bytes(*len);
                            blocks_sent += 1;
                            bytes_sent += *len as u64;
                        }
                    }
                }
                stats.update_outgoing(blocks_sent, bytes_sent);
                trace!("served {} wantlist entries to {}", served.len(), peer);
            }
            // the entries stay on the wantlist, the next wake retries them
            Err(e) => debug!("failed to respond to {}: {}", peer, e),
        }
    }
    trace!("engine worker for {} stopped", peer);
}
